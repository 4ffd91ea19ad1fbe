//! Group fan-out for the relay server.
//!
//! Uses tokio broadcast channels for O(1) send to all members of a group.
//! Each member gets an independent receiver that buffers up to `capacity`
//! frames; a member that lags further behind loses the oldest ones, which
//! matches the unreliable delivery the session already tolerates.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::transport::{LinkError, LinkFrame, PeerInfo};

/// One pre-encoded frame on its way to every member.
#[derive(Debug)]
pub struct Outbound {
    /// Member that produced it (skipped on fan-out); `None` for server frames
    pub sender: Option<Uuid>,
    pub bytes: Vec<u8>,
}

/// Statistics for monitoring group health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub active_members: usize,
}

/// Lock-free counters for the hot path.
struct AtomicBroadcastStats {
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            frames_sent: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
        }
    }
}

/// The members of one named group session.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Outbound>>,
    members: Arc<RwLock<HashMap<Uuid, PeerInfo>>>,
    capacity: usize,
    atomic_stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    /// `capacity` is how many frames a member may fall behind before it
    /// starts losing them.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            members: Arc::new(RwLock::new(HashMap::new())),
            capacity,
            atomic_stats: Arc::new(AtomicBroadcastStats::new()),
        }
    }

    /// Add a member. Returns its receiver.
    pub async fn add_member(&self, info: PeerInfo) -> broadcast::Receiver<Arc<Outbound>> {
        let mut members = self.members.write().await;
        members.insert(info.peer_id, info);
        self.sender.subscribe()
    }

    pub async fn remove_member(&self, peer_id: &Uuid) -> Option<PeerInfo> {
        self.members.write().await.remove(peer_id)
    }

    /// Encode and fan out a frame. Returns the number of receivers.
    pub fn broadcast(&self, frame: &LinkFrame, sender: Option<Uuid>) -> Result<usize, LinkError> {
        let bytes = frame.encode()?;
        Ok(self.broadcast_raw(Arc::new(Outbound { sender, bytes })))
    }

    /// Fan out pre-encoded bytes.
    pub fn broadcast_raw(&self, outbound: Arc<Outbound>) -> usize {
        let count = self.sender.send(outbound).unwrap_or(0);
        self.atomic_stats.frames_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Record frames a lagging member lost.
    pub fn record_dropped(&self, count: u64) {
        self.atomic_stats.frames_dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }

    pub async fn members(&self) -> Vec<PeerInfo> {
        self.members.read().await.values().cloned().collect()
    }

    pub async fn has_member(&self, peer_id: &Uuid) -> bool {
        self.members.read().await.contains_key(peer_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        let members = self.members.read().await;
        BroadcastStats {
            frames_sent: self.atomic_stats.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.atomic_stats.frames_dropped.load(Ordering::Relaxed),
            active_members: members.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Maps group names to broadcast groups, isolating sessions from each other.
pub struct RoomManager {
    rooms: Arc<RwLock<HashMap<String, Arc<BroadcastGroup>>>>,
    default_capacity: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            default_capacity,
        }
    }

    /// Get or create the group named `group`.
    pub async fn get_or_create(&self, group: &str) -> Arc<BroadcastGroup> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(group) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(group) {
            return room.clone();
        }

        let room = Arc::new(BroadcastGroup::new(self.default_capacity));
        rooms.insert(group.to_string(), room.clone());
        room
    }

    /// Add `peer` to `group`, creating the group if needed. Returns `None`
    /// when the group already holds `max_members`.
    ///
    /// The room map stays write-locked until the member is in, so a
    /// concurrent `remove_if_empty` cannot drop the group under a joiner.
    pub async fn join(
        &self,
        group: &str,
        peer: PeerInfo,
        max_members: usize,
    ) -> Option<(Arc<BroadcastGroup>, broadcast::Receiver<Arc<Outbound>>)> {
        let mut rooms = self.rooms.write().await;
        let room = match rooms.get(group) {
            Some(room) => room.clone(),
            None => Arc::new(BroadcastGroup::new(self.default_capacity)),
        };
        if room.member_count().await >= max_members {
            return None;
        }
        let rx = room.add_member(peer).await;
        rooms.entry(group.to_string()).or_insert_with(|| room.clone());
        Some((room, rx))
    }

    pub async fn get(&self, group: &str) -> Option<Arc<BroadcastGroup>> {
        self.rooms.read().await.get(group).cloned()
    }

    /// Drop the group if nobody is left in it.
    pub async fn remove_if_empty(&self, group: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(group) {
            if room.member_count().await == 0 {
                rooms.remove(group);
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_groups(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }
}
