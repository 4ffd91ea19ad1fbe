//! Delivery channels for encoded envelopes.
//!
//! Two independent, unreliable channels carry the same envelopes:
//!
//! ```text
//!            ┌──────────────────┐
//!            │  Session actor   │
//!            └───┬──────────┬───┘
//!     send(bytes,│targets)  │send(bytes)
//!                ▼          ▼
//!      ┌────────────┐  ┌────────────┐
//!      │  Direct    │  │  Relay     │
//!      │ peer links │  │ group chan │
//!      └─────┬──────┘  └─────┬──────┘
//!            │ TransportEvent│ (mpsc, one per transport)
//!            └───────┬───────┘
//!                    ▼
//!             Session actor
//! ```
//!
//! Every transport starts its own background tasks and reports inbound bytes
//! and state changes on one event channel taken with
//! [`Transport::take_event_rx`]. `send` is fire-and-forget.

pub mod direct;
pub mod link;
pub mod memory;
pub mod relay;

use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

pub use link::{LinkError, LinkFrame, PeerInfo};

/// Which of the two channels a transport implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Peer-to-peer link with per-peer connect/disconnect events.
    Direct,
    /// Group broadcast channel with membership counts only.
    Relay,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Direct => write!(f, "direct"),
            TransportKind::Relay => write!(f, "relay"),
        }
    }
}

/// Everything a transport reports to the session.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    PeerDiscovered(PeerInfo),
    PeerLost(PeerInfo),
    PeerConnecting(PeerInfo),
    PeerConnected(PeerInfo),
    PeerDisconnected(PeerInfo),
    /// One encoded envelope from `from`.
    Received { bytes: Vec<u8>, from: PeerInfo },
    /// Relay only: the group session was joined.
    SessionJoined,
    /// Relay only: current member count, local device included.
    MembershipChanged(usize),
    /// Relay only: the group session ended or the service went away.
    SessionInvalidated(String),
    Error(TransportError),
}

/// Transport errors.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    /// The OS refused local-network access. Fatal for the session.
    #[error("Local network permission required: {0}")]
    PermissionDenied(String),
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Send failed: {0}")]
    SendFailed(String),
    #[error("Transport not started")]
    NotStarted,
    #[error("Transport closed")]
    Closed,
    #[error("I/O error: {0}")]
    Io(String),
    #[error(transparent)]
    Link(#[from] LinkError),
}

impl TransportError {
    /// Whether this error must force the session back to idle.
    pub fn is_permission_error(&self) -> bool {
        matches!(self, TransportError::PermissionDenied(_))
    }

    /// Map an I/O error raised while binding or connecting.
    pub fn from_io(context: &str, err: &std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::PermissionDenied | std::io::ErrorKind::AddrNotAvailable => {
                TransportError::PermissionDenied(format!("{context}: {err}"))
            }
            std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::TimedOut => TransportError::ConnectionFailed(format!("{context}: {err}")),
            _ => TransportError::Io(format!("{context}: {err}")),
        }
    }
}

/// Common contract of the direct and relay channels.
///
/// Implementations spawn their own tokio tasks, so `start_*` must be called
/// from within a runtime. `stop` is idempotent and returns once every task
/// has been told to shut down.
pub trait Transport: Send {
    fn kind(&self) -> TransportKind;

    /// Identity this transport announces to others.
    fn local_peer(&self) -> &PeerInfo;

    /// Advertise so others can find and connect to us.
    fn start_hosting(&mut self) -> Result<(), TransportError>;

    /// Search for a host to connect to.
    fn start_browsing(&mut self) -> Result<(), TransportError>;

    /// Queue `bytes` for delivery. `None` or an empty slice means every
    /// connected peer. No acknowledgement.
    fn send(&self, bytes: &[u8], targets: Option<&[Uuid]>) -> Result<(), TransportError>;

    /// Tear down all connections.
    fn stop(&mut self);

    /// Take the event receiver (can only be called once).
    fn take_event_rx(&mut self) -> Option<mpsc::Receiver<TransportEvent>>;
}

/// `true` when `targets` selects `peer_id` (no targets selects everyone).
pub(crate) fn is_targeted(targets: Option<&[Uuid]>, peer_id: &Uuid) -> bool {
    match targets {
        None => true,
        Some([]) => true,
        Some(list) => list.contains(peer_id),
    }
}
