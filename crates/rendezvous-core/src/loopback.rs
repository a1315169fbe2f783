//! In-process transport for tests and the demo.
//!
//! Every session created by one `LoopbackNetwork` can reach every other.
//! A session's description names it (`o=loopback <session>`), so two
//! sessions pair up once each holds the other's description plus at least
//! one remote candidate. Pairing reports `connecting` then `connected` to
//! both sides and opens their channels; data sent on one side's channel
//! arrives as `ChannelMessage` on the other.

use crate::signal::{IceCandidate, SdpType, SessionDescription};
use crate::transport::{
    ConnectionState, DataChannel, Result, SessionConfig, TransportError, TransportEvent,
    TransportEventSink, TransportFactory, TransportSession,
};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tracing::debug;

type Pending = Vec<(TransportEventSink, TransportEvent)>;

struct SessionState {
    events: TransportEventSink,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    remote_candidates: usize,
    channels: Vec<String>,
    peer: Option<u64>,
    state: ConnectionState,
}

#[derive(Default)]
struct NetworkState {
    next_session: u64,
    sessions: HashMap<u64, SessionState>,
}

impl NetworkState {
    fn session_mut(&mut self, id: u64) -> Result<&mut SessionState> {
        match self.sessions.get_mut(&id) {
            Some(session) if session.state != ConnectionState::Closed => Ok(session),
            _ => Err(TransportError::Closed),
        }
    }

    /// The session `id` could pair with, if it has everything it needs.
    fn ready_peer(&self, id: u64) -> Option<u64> {
        let session = self.sessions.get(&id)?;
        if session.peer.is_some()
            || session.state == ConnectionState::Closed
            || session.remote_candidates == 0
        {
            return None;
        }
        session.local.as_ref()?;
        session_id_of(session.remote.as_ref()?)
    }

    fn try_connect(&mut self, id: u64, pending: &mut Pending) {
        let Some(peer) = self.ready_peer(id) else {
            return;
        };
        if self.ready_peer(peer) != Some(id) {
            return;
        }

        debug!("Loopback sessions {} and {} connected", id, peer);
        for (this, other) in [(id, peer), (peer, id)] {
            if let Some(session) = self.sessions.get_mut(&this) {
                session.peer = Some(other);
                session.state = ConnectionState::Connected;
                let sink = &session.events;
                pending.push((
                    Arc::clone(sink),
                    TransportEvent::ConnectionStateChanged(ConnectionState::Connecting),
                ));
                pending.push((
                    Arc::clone(sink),
                    TransportEvent::ConnectionStateChanged(ConnectionState::Connected),
                ));
                for label in &session.channels {
                    pending.push((
                        Arc::clone(sink),
                        TransportEvent::ChannelOpen {
                            label: label.clone(),
                        },
                    ));
                }
            }
        }
    }

    /// Break the pairing of `id`, reporting `state` to its former peer.
    fn unpair(&mut self, id: u64, state: ConnectionState, pending: &mut Pending) {
        let Some(peer) = self.sessions.get_mut(&id).and_then(|s| s.peer.take()) else {
            return;
        };
        if let Some(other) = self.sessions.get_mut(&peer) {
            other.peer = None;
            if other.state != ConnectionState::Closed {
                other.state = state;
                pending.push((
                    Arc::clone(&other.events),
                    TransportEvent::ConnectionStateChanged(state),
                ));
            }
        }
    }
}

fn deliver(pending: Pending) {
    for (sink, event) in pending {
        sink(event);
    }
}

fn describe(id: u64) -> String {
    format!("v=0\r\no=loopback {id} 1 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n")
}

fn session_id_of(description: &SessionDescription) -> Option<u64> {
    description
        .sdp
        .lines()
        .find_map(|line| line.strip_prefix("o=loopback "))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|id| id.parse().ok())
}

/// Simulated network shared by all sessions it creates.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    inner: Arc<Mutex<NetworkState>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut NetworkState) -> T) -> T {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    /// Sessions that have not been closed.
    pub fn open_session_count(&self) -> usize {
        self.with_state(|net| {
            net.sessions
                .values()
                .filter(|s| s.state != ConnectionState::Closed)
                .count()
        })
    }

    /// Sessions currently paired with a peer.
    pub fn connected_session_count(&self) -> usize {
        self.with_state(|net| net.sessions.values().filter(|s| s.peer.is_some()).count())
    }

    /// Simulate connectivity loss on every paired session.
    pub fn disconnect_all(&self) {
        self.sever_links().release_all();
    }

    /// Break every pairing now but hold back the `disconnected`
    /// notifications, so the caller decides which side learns first.
    pub fn sever_links(&self) -> HeldDisconnects {
        let pending = self.with_state(|net| {
            let mut paired: Vec<u64> = net
                .sessions
                .iter()
                .filter(|(_, s)| s.peer.is_some())
                .map(|(id, _)| *id)
                .collect();
            paired.sort_unstable();

            let mut pending = VecDeque::new();
            for id in paired {
                if let Some(session) = net.sessions.get_mut(&id) {
                    if session.peer.take().is_some() {
                        session.state = ConnectionState::Disconnected;
                        pending.push_back((
                            Arc::clone(&session.events),
                            TransportEvent::ConnectionStateChanged(ConnectionState::Disconnected),
                        ));
                    }
                }
            }
            pending
        });
        debug!("Severed {} loopback sessions", pending.len());
        HeldDisconnects { pending }
    }
}

/// `disconnected` notifications from `LoopbackNetwork::sever_links`, in
/// session creation order.
#[must_use = "held notifications are never delivered unless released"]
pub struct HeldDisconnects {
    pending: VecDeque<(TransportEventSink, TransportEvent)>,
}

impl HeldDisconnects {
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Notify the oldest severed session. Returns `false` once none remain.
    pub fn release_next(&mut self) -> bool {
        match self.pending.pop_front() {
            Some((sink, event)) => {
                sink(event);
                true
            }
            None => false,
        }
    }

    pub fn release_all(self) {
        deliver(self.pending.into());
    }
}

impl TransportFactory for LoopbackNetwork {
    fn create_session(
        &self,
        config: &SessionConfig,
        events: TransportEventSink,
    ) -> Result<Arc<dyn TransportSession>> {
        let id = self.with_state(|net| {
            net.next_session += 1;
            let id = net.next_session;
            net.sessions.insert(
                id,
                SessionState {
                    events,
                    local: None,
                    remote: None,
                    remote_candidates: 0,
                    channels: Vec::new(),
                    peer: None,
                    state: ConnectionState::New,
                },
            );
            id
        });
        debug!(
            "Created loopback session {} ({} ice servers ignored)",
            id,
            config.ice_servers.len()
        );
        Ok(Arc::new(LoopbackSession {
            id,
            network: self.clone(),
        }))
    }
}

struct LoopbackSession {
    id: u64,
    network: LoopbackNetwork,
}

#[async_trait]
impl TransportSession for LoopbackSession {
    fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>> {
        self.network.with_state(|net| -> Result<()> {
            net.session_mut(self.id)?.channels.push(label.to_string());
            Ok(())
        })?;
        Ok(Arc::new(LoopbackChannel {
            session: self.id,
            label: label.to_string(),
            network: self.network.clone(),
        }))
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        self.network.with_state(|net| net.session_mut(self.id).map(|_| ()))?;
        Ok(SessionDescription::offer(describe(self.id)))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.network.with_state(|net| -> Result<()> {
            let session = net.session_mut(self.id)?;
            match &session.remote {
                Some(remote) if remote.sdp_type == SdpType::Offer => Ok(()),
                _ => Err(TransportError::InvalidState(
                    "create_answer without a remote offer".into(),
                )),
            }
        })?;
        Ok(SessionDescription::answer(describe(self.id)))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        if session_id_of(&description) != Some(self.id) {
            return Err(TransportError::DescriptionFailed(
                "description was not created by this session".into(),
            ));
        }
        let pending = self.network.with_state(|net| -> Result<Pending> {
            let session = net.session_mut(self.id)?;
            session.local = Some(description);
            if session.state == ConnectionState::New {
                session.state = ConnectionState::Connecting;
            }
            let candidate = IceCandidate {
                candidate: format!(
                    "candidate:{} 1 udp 2122260223 127.0.0.1 {} typ host",
                    self.id,
                    40000 + self.id
                ),
                sdp_m_line_index: Some(0),
                sdp_mid: Some("0".into()),
            };
            let mut pending: Pending = vec![
                (
                    Arc::clone(&session.events),
                    TransportEvent::IceCandidate(Some(candidate)),
                ),
                (
                    Arc::clone(&session.events),
                    TransportEvent::IceCandidate(None),
                ),
            ];
            net.try_connect(self.id, &mut pending);
            Ok(pending)
        })?;
        deliver(pending);
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        if session_id_of(&description).is_none() {
            return Err(TransportError::DescriptionFailed(
                "unrecognized session description".into(),
            ));
        }
        let pending = self.network.with_state(|net| -> Result<Pending> {
            let session = net.session_mut(self.id)?;
            match description.sdp_type {
                SdpType::Offer => {}
                SdpType::Answer => {
                    let has_local_offer = session
                        .local
                        .as_ref()
                        .is_some_and(|d| d.sdp_type == SdpType::Offer);
                    if !has_local_offer {
                        return Err(TransportError::InvalidState(
                            "answer received without a local offer".into(),
                        ));
                    }
                }
                other => {
                    return Err(TransportError::InvalidState(format!(
                        "unsupported description type {other:?}"
                    )));
                }
            }
            session.remote = Some(description);
            let mut pending = Vec::new();
            net.try_connect(self.id, &mut pending);
            Ok(pending)
        })?;
        deliver(pending);
        Ok(())
    }

    async fn add_ice_candidate(&self, _candidate: IceCandidate) -> Result<()> {
        let pending = self.network.with_state(|net| -> Result<Pending> {
            let session = net.session_mut(self.id)?;
            if session.remote.is_none() {
                return Err(TransportError::NoRemoteDescription);
            }
            session.remote_candidates += 1;
            let mut pending = Vec::new();
            net.try_connect(self.id, &mut pending);
            Ok(pending)
        })?;
        deliver(pending);
        Ok(())
    }

    async fn close(&self) {
        let pending = self.network.with_state(|net| {
            let mut pending = Vec::new();
            let Some(session) = net.sessions.get_mut(&self.id) else {
                return pending;
            };
            if session.state == ConnectionState::Closed {
                return pending;
            }
            session.state = ConnectionState::Closed;
            pending.push((
                Arc::clone(&session.events),
                TransportEvent::ConnectionStateChanged(ConnectionState::Closed),
            ));
            net.unpair(self.id, ConnectionState::Disconnected, &mut pending);
            pending
        });
        deliver(pending);
    }
}

struct LoopbackChannel {
    session: u64,
    label: String,
    network: LoopbackNetwork,
}

#[async_trait]
impl DataChannel for LoopbackChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.network.with_state(|net| {
            net.sessions
                .get(&self.session)
                .is_some_and(|s| s.peer.is_some())
        })
    }

    async fn send(&self, data: &[u8]) -> Result<()> {
        let pending = self.network.with_state(|net| {
            let peer = net
                .sessions
                .get(&self.session)
                .and_then(|s| s.peer)
                .ok_or_else(|| TransportError::SendFailed("channel not open".into()))?;
            let remote = net
                .sessions
                .get(&peer)
                .ok_or_else(|| TransportError::SendFailed("peer session gone".into()))?;
            Ok::<Pending, TransportError>(vec![(
                Arc::clone(&remote.events),
                TransportEvent::ChannelMessage {
                    label: self.label.clone(),
                    data: data.to_vec(),
                },
            )])
        })?;
        deliver(pending);
        Ok(())
    }
}
