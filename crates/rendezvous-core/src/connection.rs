//! Data connection: runs a `Negotiator` against real collaborators.
//!
//! Every callback from the rendezvous store or the transport is forwarded
//! into one unbounded channel. A single task owns the negotiator and the
//! current transport session; it takes one input at a time and executes the
//! resulting actions in order before taking the next. Completions of
//! asynchronous transport calls are queued back as inputs, so the
//! negotiator never sees two callbacks at once.

use crate::config::NegotiatorConfig;
use crate::events::{EventBus, EventSubscription, NegotiationEvent};
use crate::negotiator::{Action, Input, NegotiationState, Negotiator, Operation};
use crate::rendezvous::{RecordId, Rendezvous, RendezvousError, Subscription};
use crate::signal::SignalError;
use crate::transport::{
    DataChannel, TransportError, TransportEvent, TransportEventSink, TransportFactory,
    TransportSession,
};
use crate::{ParticipantId, SharedKey};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Rendezvous error: {0}")]
    Rendezvous(#[from] RendezvousError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Signal encoding error: {0}")]
    Signal(#[from] SignalError),

    #[error("Data channel is not open")]
    ChannelNotOpen,

    #[error("Connection closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, ConnectionError>;

/// Request from the application handle to the driver task.
enum Command {
    Send {
        data: Vec<u8>,
        reply: oneshot::Sender<Result<()>>,
    },
    Reconnect,
    Close {
        reply: Option<oneshot::Sender<()>>,
    },
}

enum DriverInput {
    Negotiation(Input),
    Command(Command),
}

/// Builder for `DataConnection`.
pub struct DataConnectionBuilder {
    key: SharedKey,
    participant_id: Option<ParticipantId>,
    config: NegotiatorConfig,
    events: Option<Arc<EventBus>>,
}

impl DataConnectionBuilder {
    /// Use a fixed participant id instead of a random one.
    pub fn participant_id(mut self, id: ParticipantId) -> Self {
        self.participant_id = Some(id);
        self
    }

    pub fn config(mut self, config: NegotiatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Publish events on an existing bus.
    pub fn events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Subscribe, announce, and start negotiating in the background.
    ///
    /// Fails if the initial subscriptions or the first announcement cannot
    /// be made; later failures are logged and only delay the connection.
    pub async fn open(
        self,
        rendezvous: Arc<dyn Rendezvous>,
        transport: Arc<dyn TransportFactory>,
    ) -> Result<DataConnection> {
        let participant_id = self.participant_id.unwrap_or_else(ParticipantId::generate);
        let events = self.events.unwrap_or_default();
        info!(
            "Opening data connection {} for key {}",
            participant_id, self.key
        );

        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(NegotiationState::Idle);

        let mut driver = Driver {
            negotiator: Negotiator::new(participant_id.clone(), &self.key, self.config),
            rendezvous,
            transport,
            events: Arc::clone(&events),
            input_tx: input_tx.clone(),
            state: state_tx,
            subscriptions: Vec::new(),
            session: None,
            announcement: None,
        };

        let actions = driver.negotiator.start();
        for action in actions {
            if let Err(e) = driver.execute(action).await {
                error!("Failed to start negotiation: {}", e);
                driver.shutdown().await;
                return Err(e);
            }
        }

        tokio::spawn(driver.run(input_rx));

        Ok(DataConnection {
            participant_id,
            commands: input_tx,
            state: state_rx,
            events,
        })
    }
}

/// Application handle for one logical peer connection.
///
/// Dropping the handle closes the connection.
pub struct DataConnection {
    participant_id: ParticipantId,
    commands: mpsc::UnboundedSender<DriverInput>,
    state: watch::Receiver<NegotiationState>,
    events: Arc<EventBus>,
}

impl DataConnection {
    pub fn builder(key: SharedKey) -> DataConnectionBuilder {
        DataConnectionBuilder {
            key,
            participant_id: None,
            config: NegotiatorConfig::default(),
            events: None,
        }
    }

    /// Open with a random participant id and default configuration.
    pub async fn open(
        key: SharedKey,
        rendezvous: Arc<dyn Rendezvous>,
        transport: Arc<dyn TransportFactory>,
    ) -> Result<Self> {
        Self::builder(key).open(rendezvous, transport).await
    }

    pub fn participant_id(&self) -> &ParticipantId {
        &self.participant_id
    }

    pub fn state(&self) -> NegotiationState {
        *self.state.borrow()
    }

    /// Wait until the negotiation reaches `target`.
    ///
    /// Returns `ConnectionError::Closed` if the connection closes first.
    pub async fn wait_for_state(&self, target: NegotiationState) -> Result<()> {
        let mut state = self.state.clone();
        let reached = *state
            .wait_for(|s| *s == target || *s == NegotiationState::Closed)
            .await
            .map_err(|_| ConnectionError::Closed)?;
        if reached == target {
            Ok(())
        } else {
            Err(ConnectionError::Closed)
        }
    }

    /// Wait until the transport reports connectivity.
    pub async fn connected(&self) -> Result<()> {
        self.wait_for_state(NegotiationState::Connected).await
    }

    /// Install a handler for negotiation events and received messages.
    pub fn subscribe(
        &self,
        handler: impl Fn(NegotiationEvent) + Send + Sync + 'static,
    ) -> EventSubscription {
        self.events.subscribe(handler)
    }

    /// Send data on the open channel.
    pub async fn send(&self, data: &[u8]) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.command(Command::Send {
            data: data.to_vec(),
            reply,
        })?;
        response.await.map_err(|_| ConnectionError::Closed)?
    }

    /// Abandon the current negotiation and re-announce.
    pub fn reconnect(&self) -> Result<()> {
        self.command(Command::Reconnect)
    }

    /// Release subscriptions, announcement, signal path and session.
    pub async fn close(&self) {
        let (reply, done) = oneshot::channel();
        if self.command(Command::Close { reply: Some(reply) }).is_ok() {
            let _ = done.await;
        }
    }

    fn command(&self, command: Command) -> Result<()> {
        self.commands
            .send(DriverInput::Command(command))
            .map_err(|_| ConnectionError::Closed)
    }
}

impl Drop for DataConnection {
    fn drop(&mut self) {
        let _ = self
            .commands
            .send(DriverInput::Command(Command::Close { reply: None }));
    }
}

struct ActiveSession {
    generation: u64,
    session: Arc<dyn TransportSession>,
    channel: Arc<dyn DataChannel>,
}

/// Owns the negotiator and executes its actions.
struct Driver {
    negotiator: Negotiator,
    rendezvous: Arc<dyn Rendezvous>,
    transport: Arc<dyn TransportFactory>,
    events: Arc<EventBus>,
    input_tx: mpsc::UnboundedSender<DriverInput>,
    state: watch::Sender<NegotiationState>,
    subscriptions: Vec<Subscription>,
    session: Option<ActiveSession>,
    /// Path and record id of our live announcement
    announcement: Option<(String, RecordId)>,
}

impl Driver {
    async fn run(mut self, mut input_rx: mpsc::UnboundedReceiver<DriverInput>) {
        while let Some(input) = input_rx.recv().await {
            match input {
                DriverInput::Negotiation(input) => {
                    let actions = self.negotiator.handle(input);
                    self.execute_all(actions).await;
                }
                DriverInput::Command(Command::Send { data, reply }) => {
                    let _ = reply.send(self.send_data(&data).await);
                }
                DriverInput::Command(Command::Reconnect) => {
                    info!("Reconnect requested by owner");
                    let actions = self.negotiator.reconnect();
                    self.execute_all(actions).await;
                }
                DriverInput::Command(Command::Close { reply }) => {
                    self.shutdown().await;
                    if let Some(reply) = reply {
                        let _ = reply.send(());
                    }
                    break;
                }
            }
        }
        debug!("Driver for {} stopped", self.negotiator.local_id());
    }

    async fn execute_all(&mut self, actions: Vec<Action>) {
        for action in actions {
            if let Err(e) = self.execute(action).await {
                error!("{}", e);
            }
        }
    }

    async fn shutdown(&mut self) {
        info!("Closing data connection {}", self.negotiator.local_id());
        let actions = self.negotiator.close();
        self.execute_all(actions).await;
    }

    fn feed(&self, input: Input) {
        let _ = self.input_tx.send(DriverInput::Negotiation(input));
    }

    /// The session for `generation`, if it is still the current one.
    fn session_for(&self, generation: u64) -> Option<Arc<dyn TransportSession>> {
        self.session
            .as_ref()
            .filter(|active| active.generation == generation)
            .map(|active| Arc::clone(&active.session))
    }

    /// Like `session_for`, noting when `operation` is skipped.
    fn live_session(
        &self,
        generation: u64,
        operation: Operation,
    ) -> Option<Arc<dyn TransportSession>> {
        let session = self.session_for(generation);
        if session.is_none() {
            debug!(
                "Skipping {} for stale generation {}",
                operation, generation
            );
        }
        session
    }

    async fn execute(&mut self, action: Action) -> Result<()> {
        match action {
            Action::SubscribeAnnouncements { path } => {
                let tx = self.input_tx.clone();
                let added = self.rendezvous.subscribe_added(
                    &path,
                    Box::new(move |record| {
                        let _ = tx.send(DriverInput::Negotiation(Input::AnnouncementAdded(record)));
                    }),
                )?;
                self.subscriptions.push(added);

                let tx = self.input_tx.clone();
                let snapshot = self.rendezvous.subscribe_initial_snapshot(
                    &path,
                    Box::new(move || {
                        let _ = tx.send(DriverInput::Negotiation(Input::InitialSnapshotComplete));
                    }),
                )?;
                self.subscriptions.push(snapshot);
            }
            Action::SubscribeSignals { path } => {
                let tx = self.input_tx.clone();
                let added = self.rendezvous.subscribe_added(
                    &path,
                    Box::new(move |record| {
                        let _ = tx.send(DriverInput::Negotiation(Input::SignalAdded(record)));
                    }),
                )?;
                self.subscriptions.push(added);
            }
            Action::OpenSession { generation } => {
                self.close_session().await;
                if let Err(e) = self.open_session(generation) {
                    self.feed(Input::OperationFailed {
                        generation,
                        operation: Operation::OpenSession,
                        error: e.to_string(),
                    });
                }
            }
            Action::ClearAnnouncements { path } => {
                self.rendezvous.clear(&path).await?;
                self.announcement = None;
            }
            Action::PublishAnnouncement { path, announcement } => {
                let id = self
                    .rendezvous
                    .publish(&path, announcement.to_record()?)
                    .await?;
                self.announcement = Some((path, id));
            }
            Action::CreateOffer { generation } => {
                if let Some(session) = self.live_session(generation, Operation::CreateOffer) {
                    let result = session.create_offer().await.map_err(|e| e.to_string());
                    self.feed(Input::DescriptionCreated { generation, result });
                }
            }
            Action::CreateAnswer { generation } => {
                if let Some(session) = self.live_session(generation, Operation::CreateAnswer) {
                    let result = session.create_answer().await.map_err(|e| e.to_string());
                    self.feed(Input::DescriptionCreated { generation, result });
                }
            }
            Action::SetLocalDescription {
                generation,
                description,
            } => {
                let session = self.live_session(generation, Operation::SetLocalDescription);
                if let Some(session) = session {
                    if let Err(e) = session.set_local_description(description).await {
                        self.feed(Input::OperationFailed {
                            generation,
                            operation: Operation::SetLocalDescription,
                            error: e.to_string(),
                        });
                    }
                }
            }
            Action::SetRemoteDescription {
                generation,
                description,
            } => {
                let session = self.live_session(generation, Operation::SetRemoteDescription);
                if let Some(session) = session {
                    if let Err(e) = session.set_remote_description(description).await {
                        self.feed(Input::OperationFailed {
                            generation,
                            operation: Operation::SetRemoteDescription,
                            error: e.to_string(),
                        });
                    }
                }
            }
            Action::AddIceCandidate {
                generation,
                candidate,
            } => {
                let Some(session) = self.session_for(generation) else {
                    warn!("Transport not initialized; dropping remote candidate");
                    return Ok(());
                };
                if let Err(e) = session.add_ice_candidate(candidate).await {
                    self.feed(Input::OperationFailed {
                        generation,
                        operation: Operation::AddIceCandidate,
                        error: e.to_string(),
                    });
                }
            }
            Action::SendSignal { path, message } => {
                debug!("Sending {} signal to {}", message.kind(), path);
                self.rendezvous.publish(&path, message.to_record()?).await?;
            }
            Action::SendData { generation, data } => {
                let channel = self
                    .session
                    .as_ref()
                    .filter(|active| active.generation == generation)
                    .map(|active| Arc::clone(&active.channel));
                match channel {
                    Some(channel) => {
                        debug!("Sending {} bytes on {}", data.len(), channel.label());
                        if let Err(e) = channel.send(&data).await {
                            warn!("Failed to send on data channel {}: {}", channel.label(), e);
                        }
                    }
                    None => debug!("Dropping data for stale generation {}", generation),
                }
            }
            Action::Emit(event) => {
                if let NegotiationEvent::StateChanged { to, .. } = &event {
                    self.state.send_replace(*to);
                }
                self.events.emit(event);
            }
            Action::Unsubscribe => {
                debug!("Dropping {} subscriptions", self.subscriptions.len());
                self.subscriptions.clear();
            }
            Action::RetractAnnouncement { path } => {
                if let Some((published_at, id)) = self.announcement.take() {
                    if published_at == path {
                        self.rendezvous.remove(&path, &id).await?;
                    }
                }
            }
            Action::ClearSignals { path } => {
                self.rendezvous.clear(&path).await?;
            }
            Action::CloseSession => {
                self.close_session().await;
            }
        }
        Ok(())
    }

    fn open_session(&mut self, generation: u64) -> Result<()> {
        let tx = self.input_tx.clone();
        let sink: TransportEventSink = Arc::new(move |event| {
            let input = match event {
                TransportEvent::IceCandidate(candidate) => Input::LocalCandidate {
                    generation,
                    candidate,
                },
                TransportEvent::ConnectionStateChanged(state) => {
                    Input::ConnectivityChanged { generation, state }
                }
                TransportEvent::ChannelOpen { label } => Input::ChannelOpen { generation, label },
                TransportEvent::ChannelMessage { data, .. } => {
                    Input::ChannelMessage { generation, data }
                }
            };
            let _ = tx.send(DriverInput::Negotiation(input));
        });

        let config = self.negotiator.config();
        let session = self
            .transport
            .create_session(&config.session_config(), sink)?;
        let channel = session.create_data_channel(&config.data_channel_label)?;
        debug!("Opened transport session (generation {})", generation);
        self.session = Some(ActiveSession {
            generation,
            session,
            channel,
        });
        Ok(())
    }

    async fn close_session(&mut self) {
        if let Some(active) = self.session.take() {
            debug!(
                "Closing transport session (generation {})",
                active.generation
            );
            active.session.close().await;
        }
    }

    async fn send_data(&self, data: &[u8]) -> Result<()> {
        let Some(active) = &self.session else {
            return Err(ConnectionError::ChannelNotOpen);
        };
        if !active.channel.is_open() {
            return Err(ConnectionError::ChannelNotOpen);
        }
        debug!("Sending {} bytes on {}", data.len(), active.channel.label());
        active.channel.send(data).await?;
        Ok(())
    }
}
