//! Transport traits for the point-to-point session being negotiated.
//!
//! Implementations:
//! - `LoopbackNetwork`: in-process simulated sessions (tests, demo)
//! - A WebRTC peer connection adapter (external)
//!
//! A session reports what it discovers (local candidates, connectivity,
//! channel traffic) through the `TransportEventSink` it was created with.

use crate::signal::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Description failed: {0}")]
    DescriptionFailed(String),

    #[error("No remote description set")]
    NoRemoteDescription,

    #[error("Invalid signaling state: {0}")]
    InvalidState(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Session closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Connectivity of a transport session.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Something a session reports asynchronously.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A local candidate was gathered. `None` means gathering is complete.
    IceCandidate(Option<IceCandidate>),
    /// Connectivity changed
    ConnectionStateChanged(ConnectionState),
    /// A local data channel became usable
    ChannelOpen { label: String },
    /// Data arrived from the remote's channel
    ChannelMessage { label: String, data: Vec<u8> },
}

/// Where a session delivers its events.
pub type TransportEventSink = Arc<dyn Fn(TransportEvent) + Send + Sync>;

/// Parameters for a new session.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    /// Reflection/relay helper addresses (e.g. `stun:host:port`)
    pub ice_servers: Vec<String>,
}

/// A message channel opened over a session.
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    /// Whether data can currently be sent.
    fn is_open(&self) -> bool;

    async fn send(&self, data: &[u8]) -> Result<()>;
}

/// One point-to-point session.
///
/// `add_ice_candidate` before `set_remote_description` is undefined for real
/// transports; callers must guard it.
#[async_trait]
pub trait TransportSession: Send + Sync {
    fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>>;

    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Tear the session down. Idempotent.
    async fn close(&self);
}

/// Creates sessions.
pub trait TransportFactory: Send + Sync {
    fn create_session(
        &self,
        config: &SessionConfig,
        events: TransportEventSink,
    ) -> Result<Arc<dyn TransportSession>>;
}
