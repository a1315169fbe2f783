//! End-to-end tests for rendezvous-core.
//!
//! Two participants share one in-memory rendezvous store and one loopback
//! network, find each other through the shared key, negotiate, and exchange
//! data over the resulting channel.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rendezvous_core::{
    DataConnection, EventBus, EventSubscription, InMemoryRendezvous, LoopbackNetwork,
    NegotiationEvent, NegotiationState, SharedKey,
};
use serde_json::json;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

/// A participant plus everything it reported.
struct Participant {
    conn: DataConnection,
    log: Arc<Mutex<Vec<NegotiationEvent>>>,
    _subscription: EventSubscription,
}

impl Participant {
    /// Open a participant, recording events from the very first transition.
    async fn open(id: &str, store: &InMemoryRendezvous, net: &LoopbackNetwork) -> Self {
        let bus = Arc::new(EventBus::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let subscription = bus.subscribe(move |event| sink.lock().unwrap().push(event));

        let conn = DataConnection::builder(SharedKey::new("K").unwrap())
            .participant_id(id.parse().unwrap())
            .events(bus)
            .open(Arc::new(store.clone()), Arc::new(net.clone()))
            .await
            .expect("Failed to open connection");

        Self {
            conn,
            log,
            _subscription: subscription,
        }
    }

    fn states(&self) -> Vec<NegotiationState> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                NegotiationEvent::StateChanged { to, .. } => Some(*to),
                _ => None,
            })
            .collect()
    }

    fn times_in(&self, state: NegotiationState) -> usize {
        self.states().into_iter().filter(|s| *s == state).count()
    }

    fn received(&self) -> Vec<Vec<u8>> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                NegotiationEvent::MessageReceived { data } => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    fn has_received(&self, data: &[u8]) -> bool {
        self.received().iter().any(|m| m == data)
    }
}

/// Poll `condition` until it holds, failing after `WAIT`.
async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let polled = timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "Timed out waiting for {}", what);
}

async fn connect_pair(
    store: &InMemoryRendezvous,
    net: &LoopbackNetwork,
) -> (Participant, Participant) {
    let a = Participant::open("A", store, net).await;
    let b = Participant::open("B", store, net).await;

    timeout(WAIT, a.conn.connected())
        .await
        .expect("A timed out connecting")
        .expect("A closed before connecting");
    timeout(WAIT, b.conn.connected())
        .await
        .expect("B timed out connecting")
        .expect("B closed before connecting");
    (a, b)
}

#[tokio::test]
async fn test_first_arrival_offers_and_both_connect() {
    let store = InMemoryRendezvous::new();
    let net = LoopbackNetwork::new();

    let (a, b) = connect_pair(&store, &net).await;

    // A saw B announce live and offered; B found A in the replay and answered
    assert_eq!(
        a.states(),
        vec![
            NegotiationState::Announced,
            NegotiationState::Discovered,
            NegotiationState::OfferSent,
            NegotiationState::Connected,
        ]
    );
    assert_eq!(
        b.states(),
        vec![
            NegotiationState::Announced,
            NegotiationState::AnswerSent,
            NegotiationState::Connected,
        ]
    );
    assert_eq!(net.connected_session_count(), 2);
}

#[tokio::test]
async fn test_data_flows_both_ways() {
    let store = InMemoryRendezvous::new();
    let net = LoopbackNetwork::new();
    let (a, b) = connect_pair(&store, &net).await;

    eventually("greetings", || {
        a.has_received(b"Hello! I am B") && b.has_received(b"Hello! I am A")
    })
    .await;

    a.conn.send(b"hello").await.unwrap();
    eventually("hello on B", || b.has_received(b"hello")).await;

    b.conn.send(b"hi back").await.unwrap();
    eventually("reply on A", || a.has_received(b"hi back")).await;
}

#[tokio::test]
async fn test_signal_records_use_wire_format() {
    let store = InMemoryRendezvous::new();
    let net = LoopbackNetwork::new();
    let (_a, _b) = connect_pair(&store, &net).await;

    // B's path holds A's offer first, stored as JSON text
    let records = store.records("messages/B");
    let first = records.first().and_then(|r| r.as_str()).unwrap();
    let decoded: serde_json::Value = serde_json::from_str(first).unwrap();
    assert_eq!(decoded["sdp"]["type"], "offer");

    assert!(
        store
            .records("messages/A")
            .iter()
            .filter_map(|r| r.as_str())
            .any(|r| r.contains("\"ice\""))
    );
}

#[tokio::test]
async fn test_disconnect_reannounces_and_reconnects() {
    let store = InMemoryRendezvous::new();
    let net = LoopbackNetwork::new();
    let (a, b) = connect_pair(&store, &net).await;

    net.disconnect_all();

    eventually("both to reconnect", || {
        a.times_in(NegotiationState::Connected) == 2 && b.times_in(NegotiationState::Connected) == 2
    })
    .await;

    assert_eq!(a.times_in(NegotiationState::Disconnected), 1);
    assert_eq!(b.times_in(NegotiationState::Disconnected), 1);
    // Re-announcing did not stack subscriptions or announcements
    assert_eq!(store.subscriber_count("K"), 2);
    assert_eq!(store.subscriber_count("messages/A"), 1);
    assert_eq!(store.records("K").len(), 1);
    // Superseded sessions were closed
    assert_eq!(net.open_session_count(), 2);

    a.conn.send(b"after recovery").await.unwrap();
    eventually("message after recovery", || b.has_received(b"after recovery")).await;
}

#[tokio::test]
async fn test_one_sided_disconnect_recovers() {
    let store = InMemoryRendezvous::new();
    let net = LoopbackNetwork::new();
    let (a, b) = connect_pair(&store, &net).await;

    // A hears about the loss first and announces again while B still
    // believes it is connected
    let mut held = net.sever_links();
    assert!(held.release_next());
    eventually("A to re-announce", || {
        a.times_in(NegotiationState::Disconnected) == 1
            && a.conn.state() == NegotiationState::Announced
    })
    .await;
    assert_eq!(b.conn.state(), NegotiationState::Connected);
    held.release_all();

    eventually("both to reconnect", || {
        a.times_in(NegotiationState::Connected) == 2 && b.times_in(NegotiationState::Connected) == 2
    })
    .await;
    assert_eq!(b.times_in(NegotiationState::Disconnected), 1);

    b.conn.send(b"after one-sided loss").await.unwrap();
    eventually("message after recovery", || {
        a.has_received(b"after one-sided loss")
    })
    .await;
}

#[tokio::test]
async fn test_signal_records_bounded_across_reconnects() {
    let store = InMemoryRendezvous::new();
    let net = LoopbackNetwork::new();
    let (a, b) = connect_pair(&store, &net).await;
    let signal_records =
        || store.records("messages/A").len() + store.records("messages/B").len();
    let after_first = signal_records();

    for round in 2..=4 {
        net.disconnect_all();
        eventually("both to reconnect", || {
            a.times_in(NegotiationState::Connected) == round
                && b.times_in(NegotiationState::Connected) == round
        })
        .await;
    }

    // Each reconnect empties the participant's own path first, so only the
    // latest round's signals remain
    assert!(
        signal_records() <= after_first * 2,
        "{} signal records after reconnects, {} after the first connect",
        signal_records(),
        after_first
    );
}

#[tokio::test]
async fn test_close_releases_and_peer_returns_to_discovery() {
    let store = InMemoryRendezvous::new();
    let net = LoopbackNetwork::new();
    let (a, b) = connect_pair(&store, &net).await;

    a.conn.close().await;

    assert_eq!(a.conn.state(), NegotiationState::Closed);
    assert!(store.records("messages/A").is_empty());
    assert_eq!(store.subscriber_count("messages/A"), 0);
    assert_eq!(store.subscriber_count("K"), 1);

    eventually("B to re-announce", || {
        b.times_in(NegotiationState::Disconnected) == 1
            && b.conn.state() == NegotiationState::Announced
    })
    .await;
    assert_eq!(store.records("K"), vec![json!({ "id": "B" })]);
    assert!(a.conn.send(b"gone").await.is_err());
}

#[tokio::test]
async fn test_late_joiner_after_close_connects() {
    let store = InMemoryRendezvous::new();
    let net = LoopbackNetwork::new();
    let (a, b) = connect_pair(&store, &net).await;

    a.conn.close().await;
    eventually("B back in discovery", || {
        b.conn.state() == NegotiationState::Announced
    })
    .await;

    // C arrives later; B sees it live and offers
    let c = Participant::open("C", &store, &net).await;
    timeout(WAIT, c.conn.connected())
        .await
        .expect("C timed out connecting")
        .unwrap();
    assert!(c.states().contains(&NegotiationState::AnswerSent));
    assert!(b.states().contains(&NegotiationState::OfferSent));
}
