//! rendezvous-core: peer discovery and connection negotiation for direct
//! peer-to-peer data channels.
//!
//! This crate provides:
//! - Announcement-based discovery of a peer through a shared rendezvous key
//! - The offer/answer and candidate exchange state machine (`Negotiator`)
//! - An async driver binding it to a rendezvous store and a transport
//!   (`DataConnection`)
//! - Rendezvous and transport trait abstractions with in-process
//!   implementations for tests and demos

pub mod config;
pub mod connection;
pub mod events;
pub mod loopback;
pub mod negotiator;
pub mod participant;
pub mod rendezvous;
pub mod signal;
pub mod transport;

pub use config::{ConfigError, NegotiatorConfig};
pub use connection::{ConnectionError, DataConnection, DataConnectionBuilder};
pub use events::{EventBus, EventSubscription, NegotiationEvent};
pub use loopback::{HeldDisconnects, LoopbackNetwork};
pub use negotiator::{Action, Input, NegotiationState, Negotiator};
pub use participant::{ParticipantId, SegmentError, SharedKey};
pub use rendezvous::{InMemoryRendezvous, Rendezvous, RendezvousError, Subscription};
pub use signal::{Announcement, IceCandidate, SdpType, SessionDescription, SignalMessage};
pub use transport::{
    ConnectionState, DataChannel, TransportError, TransportFactory, TransportSession,
};
