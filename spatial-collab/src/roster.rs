//! Who is around: peers found while browsing and peers with a live link.

use uuid::Uuid;

use crate::transport::PeerInfo;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Roster {
    connected: Vec<PeerInfo>,
    available: Vec<PeerInfo>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connected(&self) -> &[PeerInfo] {
        &self.connected
    }

    pub fn available(&self) -> &[PeerInfo] {
        &self.available
    }

    pub fn is_connected(&self, peer_id: &Uuid) -> bool {
        self.connected.iter().any(|p| &p.peer_id == peer_id)
    }

    /// Returns `true` when the peer was not connected before.
    pub fn add_connected(&mut self, peer: PeerInfo) -> bool {
        self.available.retain(|p| p.peer_id != peer.peer_id);
        match self.connected.iter_mut().find(|p| p.peer_id == peer.peer_id) {
            Some(existing) => {
                *existing = peer;
                false
            }
            None => {
                self.connected.push(peer);
                true
            }
        }
    }

    pub fn remove_connected(&mut self, peer_id: &Uuid) -> Option<PeerInfo> {
        let i = self.connected.iter().position(|p| &p.peer_id == peer_id)?;
        Some(self.connected.remove(i))
    }

    pub fn add_available(&mut self, peer: PeerInfo) {
        if self.is_connected(&peer.peer_id) || self.available.iter().any(|p| p.peer_id == peer.peer_id) {
            return;
        }
        self.available.push(peer);
    }

    pub fn remove_available(&mut self, peer_id: &Uuid) {
        self.available.retain(|p| &p.peer_id != peer_id);
    }

    pub fn clear(&mut self) {
        self.connected.clear();
        self.available.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_moves_out_of_available() {
        let mut roster = Roster::new();
        let peer = PeerInfo::new("Alice");
        roster.add_available(peer.clone());
        roster.add_available(peer.clone());
        assert_eq!(roster.available().len(), 1);

        assert!(roster.add_connected(peer.clone()));
        assert!(!roster.add_connected(peer.clone()));
        assert!(roster.available().is_empty());
        assert_eq!(roster.connected().len(), 1);

        // Already connected peers are not listed as available
        roster.add_available(peer.clone());
        assert!(roster.available().is_empty());

        assert_eq!(roster.remove_connected(&peer.peer_id), Some(peer.clone()));
        assert!(roster.remove_connected(&peer.peer_id).is_none());
    }
}
