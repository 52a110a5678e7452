//! Peer-to-peer data-channel sessions: connectivity establishment, an
//! encrypted tunnel, reliable multiplexed messaging, and in-band channel
//! negotiation, without a media stack.
//!
//! The connectivity checker, the encryption handshake, and the multiplexing
//! engine are external collaborators consumed through the traits in
//! [`connectivity`], [`handshake`], and [`association`]. This crate owns the
//! bring-up sequencing between them, the cross-layer relays, and the channel
//! negotiation protocol.

use thiserror::Error;

pub mod association;
pub mod channel;
pub mod config;
pub mod connectivity;
pub mod dcep;
pub mod handshake;
pub mod mock;
pub mod orchestrator;
pub mod queue;
pub mod sdp;
pub mod session;
pub mod stack;

pub use association::{AssociationEvent, AssociationSide, NotificationKind};
pub use channel::{Channel, ChannelMessage, ChannelState, PayloadKind, Reliability, ReliabilityMode};
pub use config::SessionConfig;
pub use connectivity::{Connectivity, ConnectivityEvent, IceCredentials};
pub use handshake::HandshakeRole;
pub use orchestrator::TransportStage;
pub use sdp::SetupRole;
pub use session::{
    Collaborators, DescriptionOutcome, Session, SessionBuilder, SessionEvent, SessionLifecycle,
    SessionRole,
};
pub use stack::TransportStack;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("channel registry full")]
    RegistryFull,
    #[error("channel closed")]
    ChannelClosed,
    #[error("session closed")]
    SessionClosed,
    #[error("transport not initialized")]
    NotInitialized,
    #[error("malformed remote description: {0}")]
    MalformedDescription(String),
    #[error("connectivity error: {0}")]
    Connectivity(String),
    #[error("handshake error: {0}")]
    Handshake(String),
    #[error("association error: {0}")]
    Association(String),
    #[error("setup error: {0}")]
    Setup(String),
}
