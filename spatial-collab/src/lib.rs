//! # spatial-collab: peer-to-peer synchronization of shared spatial diagrams
//!
//! One host originates diagrams and a shared world anchor; nearby peers
//! (direct WebSocket links) and remote peers (a relay group) receive them.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   LinkFrame/WS    ┌──────────────┐
//! │ Session      │ ◄───────────────► │ Session      │
//! │ (host)       │  DirectTransport  │ (peer)       │
//! └──────┬───────┘                   └──────────────┘
//!        │ RelayTransport
//!        ▼
//! ┌──────────────┐
//! │ RelayServer  │──► BroadcastGroup per group ──► remote peers
//! └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON envelopes exchanged between sessions
//! - [`transport`]: direct, relay and in-memory transports
//! - [`session`]: the session actor and its handle
//! - [`reconcile`]: diagram list ownership and merge rules
//! - [`anchor`]: last-writer-wins shared anchor
//! - [`storage`]: on-disk anchor persistence
//! - [`server`]: relay server with room-based fan-out

pub mod alerts;
pub mod anchor;
pub mod broadcast;
pub mod config;
pub mod hooks;
pub mod protocol;
pub mod reconcile;
pub mod roster;
pub mod server;
pub mod session;
pub mod storage;
pub mod transport;

// Re-exports for convenience
pub use alerts::SessionAlert;
pub use anchor::AnchorCoordinator;
pub use broadcast::{BroadcastGroup, BroadcastStats, RoomManager};
pub use config::{DirectConfig, RelayConfig, Role, SessionConfig};
pub use hooks::{NullObserver, PoseProvider, SessionObserver, StaticPoseProvider};
pub use protocol::{CodecError, Envelope};
pub use reconcile::DiagramStore;
pub use roster::Roster;
pub use server::{RelayServer, RelayServerConfig, ServerStats};
pub use session::{SessionBuilder, SessionError, SessionHandle, SessionSnapshot, SessionState};
pub use storage::{AnchorStore, PersistError};
pub use transport::{
    direct::DirectTransport, memory::MemoryHub, relay::RelayTransport, PeerInfo, Transport,
    TransportError, TransportEvent, TransportKind,
};
