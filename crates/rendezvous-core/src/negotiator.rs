//! Connection negotiator: peer discovery and offer/answer state machine.
//!
//! The negotiator owns the negotiation state and decides what happens next,
//! but performs no I/O itself:
//! 1. Feed it what the collaborators reported (`Input`)
//! 2. Execute the `Action`s it returns, in order
//! 3. Feed completions of asynchronous actions back as further inputs
//!
//! Every transport-bound action carries the session generation it was
//! issued under. A disconnect starts a new generation, and inputs tagged
//! with an older one are dropped, so a late offer or answer from a
//! superseded session is never applied.
//!
//! Exactly one side offers: a participant requests an offer only for a peer
//! whose announcement arrived after its own initial snapshot completed. A
//! peer seen during the replay is expected to offer to us instead.

use crate::config::NegotiatorConfig;
use crate::events::NegotiationEvent;
use crate::signal::{Announcement, IceCandidate, SdpType, SessionDescription, SignalMessage};
use crate::transport::ConnectionState;
use crate::{ParticipantId, SharedKey};
use serde::Serialize;
use serde_json::Value;
use std::fmt::{self, Display, Formatter};
use tracing::{debug, error, info, warn};

/// Where a negotiation stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum NegotiationState {
    /// Constructed, nothing published yet
    Idle,
    /// Our announcement is published; waiting for a peer
    Announced,
    /// A live peer was found and an offer was requested
    Discovered,
    /// Our offer was sent; waiting for the answer and connectivity
    OfferSent,
    /// A remote offer was accepted and our answer is being sent
    AnswerSent,
    /// The transport reported connectivity
    Connected,
    /// Connectivity was lost; about to re-announce
    Disconnected,
    /// Released by `close()`
    Closed,
}

impl NegotiationState {
    fn accepts_candidates(self) -> bool {
        matches!(
            self,
            Self::Announced | Self::Discovered | Self::OfferSent | Self::AnswerSent | Self::Connected
        )
    }

    fn is_negotiating(self) -> bool {
        matches!(
            self,
            Self::Discovered | Self::OfferSent | Self::AnswerSent | Self::Connected
        )
    }
}

impl Display for NegotiationState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Announced => "announced",
            Self::Discovered => "discovered",
            Self::OfferSent => "offer-sent",
            Self::AnswerSent => "answer-sent",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Asynchronous transport operation whose failure is reported back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    OpenSession,
    CreateOffer,
    CreateAnswer,
    SetLocalDescription,
    SetRemoteDescription,
    AddIceCandidate,
}

impl Display for Operation {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::OpenSession => "open session",
            Self::CreateOffer => "create offer",
            Self::CreateAnswer => "create answer",
            Self::SetLocalDescription => "set local description",
            Self::SetRemoteDescription => "set remote description",
            Self::AddIceCandidate => "add ice candidate",
        };
        f.write_str(name)
    }
}

/// Something the collaborators reported.
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    /// A record was added on the announcement path (replay or live)
    AnnouncementAdded(Value),
    /// The announcement path finished its initial replay
    InitialSnapshotComplete,
    /// A record was added on our signal path
    SignalAdded(Value),
    /// `create_offer` / `create_answer` finished
    DescriptionCreated {
        generation: u64,
        result: Result<SessionDescription, String>,
    },
    /// Any other transport operation failed
    OperationFailed {
        generation: u64,
        operation: Operation,
        error: String,
    },
    /// The transport gathered a local candidate (`None` = gathering done)
    LocalCandidate {
        generation: u64,
        candidate: Option<IceCandidate>,
    },
    ConnectivityChanged {
        generation: u64,
        state: ConnectionState,
    },
    ChannelOpen {
        generation: u64,
        label: String,
    },
    ChannelMessage {
        generation: u64,
        data: Vec<u8>,
    },
}

/// Something the caller must do on the negotiator's behalf.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    SubscribeAnnouncements { path: String },
    SubscribeSignals { path: String },
    /// Close the current transport session (if any) and open a new one,
    /// with its data channel, tagged with `generation`
    OpenSession { generation: u64 },
    ClearAnnouncements { path: String },
    PublishAnnouncement {
        path: String,
        announcement: Announcement,
    },
    CreateOffer { generation: u64 },
    CreateAnswer { generation: u64 },
    SetLocalDescription {
        generation: u64,
        description: SessionDescription,
    },
    SetRemoteDescription {
        generation: u64,
        description: SessionDescription,
    },
    AddIceCandidate {
        generation: u64,
        candidate: IceCandidate,
    },
    SendSignal {
        path: String,
        message: SignalMessage,
    },
    SendData { generation: u64, data: Vec<u8> },
    Emit(NegotiationEvent),
    /// Drop every rendezvous subscription
    Unsubscribe,
    /// Remove our own announcement record
    RetractAnnouncement { path: String },
    ClearSignals { path: String },
    CloseSession,
}

/// Per-generation bookkeeping, reset whenever a new session opens.
#[derive(Debug, Clone, Default)]
struct Round {
    offer_requested: bool,
    local_description_set: bool,
    remote_description_set: bool,
    answer_applied: bool,
    /// Signals produced before the remote id was known
    outbox: Vec<SignalMessage>,
}

/// Discovery and negotiation for one logical connection.
pub struct Negotiator {
    local_id: ParticipantId,
    config: NegotiatorConfig,
    announcement_path: String,
    signal_path: String,
    state: NegotiationState,
    remote: Option<ParticipantId>,
    bulk_loaded: bool,
    generation: u64,
    round: Round,
    /// Our remote announced again while we still considered it connected
    pending_live_peer: Option<ParticipantId>,
}

impl Negotiator {
    pub fn new(local_id: ParticipantId, shared_key: &SharedKey, config: NegotiatorConfig) -> Self {
        let announcement_path = config.announcement_path(shared_key);
        let signal_path = config.signal_path(&local_id);
        Self {
            local_id,
            config,
            announcement_path,
            signal_path,
            state: NegotiationState::Idle,
            remote: None,
            bulk_loaded: false,
            generation: 0,
            round: Round::default(),
            pending_live_peer: None,
        }
    }

    pub fn local_id(&self) -> &ParticipantId {
        &self.local_id
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn remote(&self) -> Option<&ParticipantId> {
        self.remote.as_ref()
    }

    pub fn is_bulk_loaded(&self) -> bool {
        self.bulk_loaded
    }

    /// Current session generation (0 before `start`).
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn config(&self) -> &NegotiatorConfig {
        &self.config
    }

    /// Wire the subscriptions, open the first session and announce.
    pub fn start(&mut self) -> Vec<Action> {
        if self.state != NegotiationState::Idle {
            warn!("Negotiator already started (state {})", self.state);
            return Vec::new();
        }

        let mut actions = vec![
            Action::SubscribeAnnouncements {
                path: self.announcement_path.clone(),
            },
            Action::SubscribeSignals {
                path: self.signal_path.clone(),
            },
        ];
        self.begin_round(&mut actions);
        actions.extend(self.announce());
        self.transition(NegotiationState::Announced, &mut actions);
        actions
    }

    /// Replace whatever is on the announcement path with our own record.
    ///
    /// Safe to repeat: the path is cleared before each publish, so it holds
    /// a single record afterwards.
    pub fn announce(&mut self) -> Vec<Action> {
        if self.state == NegotiationState::Closed {
            return Vec::new();
        }
        info!(
            "Announcing {} on {}",
            self.local_id, self.announcement_path
        );
        vec![
            Action::ClearAnnouncements {
                path: self.announcement_path.clone(),
            },
            Action::PublishAnnouncement {
                path: self.announcement_path.clone(),
                announcement: Announcement::new(self.local_id.clone()),
            },
        ]
    }

    /// Abandon the current negotiation and go back to discovery.
    ///
    /// Used on connectivity loss; the owner may also call it to restart a
    /// negotiation that stalled.
    pub fn reconnect(&mut self) -> Vec<Action> {
        if matches!(
            self.state,
            NegotiationState::Idle | NegotiationState::Closed
        ) {
            return Vec::new();
        }

        let mut actions = Vec::new();
        self.transition(NegotiationState::Disconnected, &mut actions);
        self.remote = None;
        self.begin_round(&mut actions);
        // Signals addressed to the abandoned session are no longer useful
        actions.push(Action::ClearSignals {
            path: self.signal_path.clone(),
        });
        actions.extend(self.announce());
        self.transition(NegotiationState::Announced, &mut actions);

        // Its live announcement was consumed while we were connected
        if let Some(peer) = self.pending_live_peer.take() {
            info!("{} announced again before we noticed the loss; offering", peer);
            self.remote = Some(peer.clone());
            actions.push(Action::Emit(NegotiationEvent::PeerDiscovered {
                remote: peer,
                live: true,
            }));
            self.request_offer(&mut actions);
        }
        actions
    }

    /// Release subscriptions, our announcement, our signal path and the
    /// session. Every later input is ignored.
    pub fn close(&mut self) -> Vec<Action> {
        if self.state == NegotiationState::Closed {
            return Vec::new();
        }

        let mut actions = vec![
            Action::Unsubscribe,
            Action::RetractAnnouncement {
                path: self.announcement_path.clone(),
            },
            Action::ClearSignals {
                path: self.signal_path.clone(),
            },
            Action::CloseSession,
        ];
        self.remote = None;
        self.pending_live_peer = None;
        self.transition(NegotiationState::Closed, &mut actions);
        actions
    }

    /// Process one input.
    pub fn handle(&mut self, input: Input) -> Vec<Action> {
        if self.state == NegotiationState::Closed {
            debug!("Ignoring input after close: {:?}", input);
            return Vec::new();
        }

        match input {
            Input::AnnouncementAdded(record) => self.on_announcement_added(&record),
            Input::InitialSnapshotComplete => {
                self.on_initial_snapshot_complete();
                Vec::new()
            }
            Input::SignalAdded(record) => self.on_signal_added(&record),
            Input::DescriptionCreated { generation, result } => {
                self.on_description_created(generation, result)
            }
            Input::OperationFailed {
                generation,
                operation,
                error,
            } => {
                self.on_operation_failed(generation, operation, &error);
                Vec::new()
            }
            Input::LocalCandidate {
                generation,
                candidate,
            } => self.on_local_candidate(generation, candidate),
            Input::ConnectivityChanged { generation, state } => {
                self.on_connection_state_change(generation, state)
            }
            Input::ChannelOpen { generation, label } => self.on_channel_open(generation, label),
            Input::ChannelMessage { generation, data } => {
                self.on_channel_message(generation, data)
            }
        }
    }

    /// Address a signal to the current remote participant.
    ///
    /// Returns `None` (and logs) when no remote is known, which happens
    /// while messages are still in flight during a reconnect.
    pub fn send_signal(&self, message: SignalMessage) -> Option<Action> {
        match &self.remote {
            Some(remote) => Some(Action::SendSignal {
                path: self.config.signal_path(remote),
                message,
            }),
            None => {
                warn!(
                    "No remote participant; dropping outgoing {} signal",
                    message.kind()
                );
                None
            }
        }
    }

    /// Send a signal we produced, or keep it for the round until the remote
    /// is known.
    fn send_or_hold(&mut self, message: SignalMessage) -> Option<Action> {
        if self.remote.is_none() {
            debug!("Holding {} signal until the remote is known", message.kind());
            self.round.outbox.push(message);
            return None;
        }
        self.send_signal(message)
    }

    fn flush_outbox(&mut self) -> Vec<Action> {
        let held = std::mem::take(&mut self.round.outbox);
        if !held.is_empty() {
            debug!("Sending {} held signals", held.len());
        }
        held.into_iter()
            .filter_map(|message| self.send_signal(message))
            .collect()
    }

    fn on_announcement_added(&mut self, record: &Value) -> Vec<Action> {
        let mut actions = Vec::new();
        let announcement = match Announcement::from_record(record) {
            Ok(announcement) => announcement,
            Err(e) => {
                warn!("Ignoring malformed announcement {}: {}", record, e);
                return actions;
            }
        };
        let id = announcement.id;

        if id == self.local_id {
            debug!("Ignoring our own announcement");
            return actions;
        }

        if self.state.is_negotiating() {
            match &self.remote {
                Some(remote) if *remote == id => {
                    if self.bulk_loaded {
                        debug!("{} announced again while we are {}", id, self.state);
                        self.pending_live_peer = Some(id);
                    } else {
                        debug!("Duplicate announcement from {}", id);
                    }
                }
                Some(remote) => {
                    info!(
                        "Already negotiating with {}; ignoring announcement from {}",
                        remote, id
                    );
                }
                None => {
                    // Answering an offer whose sender we had not seen yet
                    self.remote = Some(id.clone());
                    actions.push(Action::Emit(NegotiationEvent::PeerDiscovered {
                        remote: id,
                        live: self.bulk_loaded,
                    }));
                    actions.extend(self.flush_outbox());
                }
            }
            return actions;
        }

        let live = self.bulk_loaded;
        info!("Discovered matching announcement from {}", id);
        self.remote = Some(id.clone());
        actions.push(Action::Emit(NegotiationEvent::PeerDiscovered {
            remote: id.clone(),
            live,
        }));

        if !live {
            debug!(
                "Announcement from {} predates our subscription; waiting for its offer",
                id
            );
            return actions;
        }

        if self.state == NegotiationState::Announced {
            self.request_offer(&mut actions);
        }
        actions
    }

    fn request_offer(&mut self, actions: &mut Vec<Action>) {
        if self.round.offer_requested {
            return;
        }
        self.round.offer_requested = true;
        self.transition(NegotiationState::Discovered, actions);
        actions.push(Action::CreateOffer {
            generation: self.generation,
        });
    }

    fn on_initial_snapshot_complete(&mut self) {
        if self.bulk_loaded {
            debug!("Initial snapshot already complete");
            return;
        }
        debug!("Existing announcements loaded");
        self.bulk_loaded = true;
    }

    fn on_signal_added(&mut self, record: &Value) -> Vec<Action> {
        let message = match SignalMessage::from_record(record) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping signal: {}", e);
                return Vec::new();
            }
        };

        debug!("Received {} signal", message.kind());
        match message {
            SignalMessage::Sdp(description) => self.on_remote_description(description),
            SignalMessage::Ice(candidate) => self.on_remote_candidate(candidate),
        }
    }

    fn on_remote_description(&mut self, description: SessionDescription) -> Vec<Action> {
        let mut actions = Vec::new();
        match description.sdp_type {
            SdpType::Offer => match self.state {
                NegotiationState::Announced | NegotiationState::Discovered => {
                    self.accept_offer(description, &mut actions);
                }
                NegotiationState::OfferSent => {
                    if self.yields_on_collision() {
                        info!("Offer collision; yielding and answering instead");
                        self.begin_round(&mut actions);
                        self.accept_offer(description, &mut actions);
                    } else {
                        info!("Offer collision; keeping our offer");
                    }
                }
                NegotiationState::AnswerSent => {
                    debug!("Ignoring duplicate offer");
                }
                other => {
                    warn!("Ignoring offer received in state {}", other);
                }
            },
            SdpType::Answer => match self.state {
                NegotiationState::OfferSent | NegotiationState::AnswerSent => {
                    if self.round.answer_applied {
                        debug!("Ignoring duplicate answer");
                    } else {
                        info!("Received answer; waiting for connectivity");
                        self.round.answer_applied = true;
                        self.round.remote_description_set = true;
                        actions.push(Action::SetRemoteDescription {
                            generation: self.generation,
                            description,
                        });
                    }
                }
                other => {
                    warn!("Ignoring answer received in state {}", other);
                }
            },
            other => {
                warn!("Ignoring unsupported {:?} description", other);
            }
        }
        actions
    }

    fn accept_offer(&mut self, description: SessionDescription, actions: &mut Vec<Action>) {
        if self.remote.is_none() {
            warn!("Answering an offer from a participant we have not seen announce");
        }
        self.round.remote_description_set = true;
        actions.push(Action::SetRemoteDescription {
            generation: self.generation,
            description,
        });
        actions.push(Action::CreateAnswer {
            generation: self.generation,
        });
        self.transition(NegotiationState::AnswerSent, actions);
    }

    /// On simultaneous offers the participant with the smaller id answers.
    fn yields_on_collision(&self) -> bool {
        self.remote
            .as_ref()
            .is_some_and(|remote| self.local_id < *remote)
    }

    fn on_remote_candidate(&mut self, candidate: IceCandidate) -> Vec<Action> {
        if !self.state.accepts_candidates() {
            warn!("Dropping candidate received in state {}", self.state);
            return Vec::new();
        }
        if !self.round.remote_description_set {
            warn!("Dropping candidate received before the remote description");
            return Vec::new();
        }
        vec![Action::AddIceCandidate {
            generation: self.generation,
            candidate,
        }]
    }

    fn on_description_created(
        &mut self,
        generation: u64,
        result: Result<SessionDescription, String>,
    ) -> Vec<Action> {
        if generation != self.generation {
            debug!("Ignoring description from stale generation {}", generation);
            return Vec::new();
        }

        let description = match result {
            Ok(description) => description,
            Err(e) => {
                error!("Failed to create session description: {}", e);
                return Vec::new();
            }
        };

        let expected = match self.state {
            NegotiationState::Discovered => SdpType::Offer,
            NegotiationState::AnswerSent => SdpType::Answer,
            other => {
                debug!(
                    "Ignoring {:?} description created in state {}",
                    description.sdp_type, other
                );
                return Vec::new();
            }
        };
        if description.sdp_type != expected || self.round.local_description_set {
            debug!("Ignoring unneeded {:?} description", description.sdp_type);
            return Vec::new();
        }

        self.round.local_description_set = true;
        let mut actions = vec![Action::SetLocalDescription {
            generation,
            description: description.clone(),
        }];
        actions.extend(self.send_or_hold(SignalMessage::Sdp(description)));
        if expected == SdpType::Offer {
            self.transition(NegotiationState::OfferSent, &mut actions);
        }
        actions
    }

    fn on_operation_failed(&mut self, generation: u64, operation: Operation, error: &str) {
        if generation != self.generation {
            debug!(
                "Ignoring {} failure from stale generation {}",
                operation, generation
            );
            return;
        }
        error!("Failed to {}: {}", operation, error);
    }

    fn on_local_candidate(
        &mut self,
        generation: u64,
        candidate: Option<IceCandidate>,
    ) -> Vec<Action> {
        if generation != self.generation {
            debug!("Ignoring candidate from stale generation {}", generation);
            return Vec::new();
        }
        match candidate {
            Some(candidate) => {
                if let Some(remote) = &self.remote {
                    debug!("Sending candidate to {}", remote);
                }
                self.send_or_hold(SignalMessage::Ice(candidate))
                    .into_iter()
                    .collect()
            }
            None => {
                info!("All candidates sent");
                Vec::new()
            }
        }
    }

    fn on_connection_state_change(
        &mut self,
        generation: u64,
        state: ConnectionState,
    ) -> Vec<Action> {
        if generation != self.generation {
            debug!(
                "Ignoring {:?} from stale generation {}",
                state, generation
            );
            return Vec::new();
        }

        let mut actions = Vec::new();
        match state {
            ConnectionState::Connected => {
                if let Some(remote) = &self.remote {
                    info!("Connected to {}", remote);
                }
                if self.state != NegotiationState::Connected {
                    self.pending_live_peer = None;
                }
                self.transition(NegotiationState::Connected, &mut actions);
            }
            ConnectionState::Disconnected if self.state == NegotiationState::Connected => {
                info!("Peer disconnected; re-announcing");
                actions = self.reconnect();
            }
            ConnectionState::Failed if self.state.is_negotiating() => {
                warn!("Connection failed in state {}; re-announcing", self.state);
                actions = self.reconnect();
            }
            other => {
                debug!("Transport reported {:?} in state {}", other, self.state);
            }
        }
        actions
    }

    fn on_channel_open(&mut self, generation: u64, label: String) -> Vec<Action> {
        if generation != self.generation {
            debug!("Ignoring channel open from stale generation {}", generation);
            return Vec::new();
        }

        info!("Data channel {} open", label);
        let mut actions = vec![Action::Emit(NegotiationEvent::ChannelOpen { label })];
        if let Some(greeting) = self.config.greeting_for(&self.local_id) {
            actions.push(Action::SendData {
                generation,
                data: greeting.into_bytes(),
            });
        }
        actions
    }

    fn on_channel_message(&mut self, generation: u64, data: Vec<u8>) -> Vec<Action> {
        if generation != self.generation {
            debug!("Ignoring message from stale generation {}", generation);
            return Vec::new();
        }
        debug!("Received message ({} bytes)", data.len());
        vec![Action::Emit(NegotiationEvent::MessageReceived { data })]
    }

    fn begin_round(&mut self, actions: &mut Vec<Action>) {
        self.generation += 1;
        self.round = Round::default();
        actions.push(Action::OpenSession {
            generation: self.generation,
        });
    }

    fn transition(&mut self, to: NegotiationState, actions: &mut Vec<Action>) {
        if self.state == to {
            return;
        }
        let from = self.state;
        self.state = to;
        debug!("Negotiation {} -> {}", from, to);
        actions.push(Action::Emit(NegotiationEvent::StateChanged { from, to }));
    }
}
