//! Session and transport configuration.

use std::path::PathBuf;

/// Device capability: whether it may ever originate structural changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// May host a session and originate diagram/anchor changes.
    CanOriginate,
    /// Only applies changes received from a host.
    ReceiveOnly,
}

/// Direct (peer-to-peer WebSocket) transport configuration.
#[derive(Debug, Clone)]
pub struct DirectConfig {
    /// Address the host listens on
    pub bind_addr: String,
    /// Host addresses a joiner tries while browsing
    pub seed_peers: Vec<String>,
    /// Delay between browse attempts per seed
    pub browse_interval_ms: u64,
    /// Connect + handshake timeout
    pub connect_timeout_ms: u64,
}

impl Default for DirectConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:7878".to_string(),
            seed_peers: Vec::new(),
            browse_interval_ms: 1000,
            connect_timeout_ms: 3000,
        }
    }
}

impl DirectConfig {
    /// Config for testing (ephemeral port, fast retries).
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            seed_peers: Vec::new(),
            browse_interval_ms: 50,
            connect_timeout_ms: 500,
        }
    }
}

/// Relay (group session) transport configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// WebSocket URL of the relay service
    pub url: String,
    /// Group session name shared by all participants
    pub group: String,
    pub connect_timeout_ms: u64,
}

impl RelayConfig {
    pub fn new(url: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            group: group.into(),
            connect_timeout_ms: 3000,
        }
    }
}

/// Top-level session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Display name announced to peers
    pub local_name: String,
    pub role: Role,
    pub direct: DirectConfig,
    /// Relay channel (None = direct transport only)
    pub relay: Option<RelayConfig>,
    /// Persisted anchor file (None = in-memory anchor only)
    pub anchor_path: Option<PathBuf>,
    /// Confidence used when sharing the first diagram broadcasts an anchor
    pub implicit_anchor_confidence: f32,
    /// World maps larger than this go to the relay as pose-only alignments
    pub relay_world_map_limit: usize,
    /// Session command queue depth
    pub command_capacity: usize,
    /// Per-transport event queue depth
    pub event_capacity: usize,
    /// Alert broadcast buffer
    pub alert_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            local_name: "Spatial Device".to_string(),
            role: Role::CanOriginate,
            direct: DirectConfig::default(),
            relay: None,
            anchor_path: None,
            implicit_anchor_confidence: 0.8,
            relay_world_map_limit: 192 * 1024, // 192KB
            command_capacity: 64,
            event_capacity: 256,
            alert_capacity: 32,
        }
    }
}

impl SessionConfig {
    /// Config for testing (local-only, no persistence).
    pub fn for_testing(local_name: impl Into<String>) -> Self {
        Self {
            local_name: local_name.into(),
            direct: DirectConfig::for_testing(),
            relay_world_map_limit: 64,
            ..Self::default()
        }
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }
}
