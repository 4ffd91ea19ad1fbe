//! Ownership of the one shared anchor on this device.
//!
//! Every write is last-writer-wins: a received anchor replaces the current
//! one whatever its confidence or timestamp. Each change is written through
//! to the [`AnchorStore`] when one is configured; a failed write is logged
//! and the anchor stays in memory.

use spatial_core::{Matrix4, SharedAnchor};

use crate::protocol::{AlignmentPayload, AnchorPayload, Envelope};
use crate::storage::AnchorStore;

pub struct AnchorCoordinator {
    current: Option<SharedAnchor>,
    store: Option<AnchorStore>,
}

impl AnchorCoordinator {
    pub fn new(store: Option<AnchorStore>) -> Self {
        Self { current: None, store }
    }

    /// Load the persisted anchor, if any. Call before any network activity.
    pub fn restore(&mut self) -> Option<&SharedAnchor> {
        let store = self.store.as_ref()?;
        match store.load() {
            Ok(Some(anchor)) => {
                log::info!("Restored anchor {} from {}", anchor.id, store.path().display());
                self.current = Some(anchor);
            }
            Ok(None) => log::debug!("No persisted anchor; cold start"),
            Err(e) => log::warn!("Ignoring unreadable anchor at {}: {}", store.path().display(), e),
        }
        self.current.as_ref()
    }

    pub fn current(&self) -> Option<&SharedAnchor> {
        self.current.as_ref()
    }

    /// Create a fresh anchor from the local device pose.
    pub fn capture(&mut self, transform: Matrix4, confidence: f32, world_map: Option<Vec<u8>>) -> SharedAnchor {
        let anchor = SharedAnchor::new(transform, confidence, world_map);
        log::info!(
            "Captured anchor {} (confidence {:.2}, world map {} bytes)",
            anchor.id,
            anchor.confidence,
            anchor.world_map_len()
        );
        self.replace(anchor.clone());
        anchor
    }

    /// Adopt a received anchor unconditionally. Confidence is clamped to
    /// [0, 1] as for alignments.
    pub fn apply_remote(&mut self, mut anchor: SharedAnchor) -> &SharedAnchor {
        anchor.confidence = anchor.confidence.clamp(0.0, 1.0);
        log::info!("Adopting remote anchor {} (confidence {:.2})", anchor.id, anchor.confidence);
        self.replace(anchor)
    }

    /// Adopt a pose-only alignment. The world map survives when the
    /// alignment refers to the anchor we already hold.
    pub fn apply_alignment(&mut self, alignment: &AlignmentPayload) -> &SharedAnchor {
        let world_map = match &self.current {
            Some(current) if current.id == alignment.anchor_id => current.world_map.clone(),
            _ => None,
        };
        log::info!("Applying coordinate alignment {} from {}", alignment.anchor_id, alignment.source);
        self.replace(SharedAnchor {
            id: alignment.anchor_id,
            transform: Matrix4::from_flat(&alignment.transform),
            confidence: alignment.confidence.clamp(0.0, 1.0),
            timestamp_ms: alignment.timestamp_ms,
            world_map,
        })
    }

    /// Forget the anchor here and on disk.
    pub fn clear(&mut self) {
        self.current = None;
        if let Some(store) = &self.store {
            if let Err(e) = store.clear() {
                log::warn!("Failed to clear persisted anchor: {}", e);
            }
        }
    }

    fn replace(&mut self, anchor: SharedAnchor) -> &SharedAnchor {
        if let Some(store) = &self.store {
            if let Err(e) = store.save(&anchor) {
                log::warn!("Anchor {} kept in memory only: {}", anchor.id, e);
            }
        }
        self.current.insert(anchor)
    }
}

/// Full anchor envelope for the direct channel.
pub fn anchor_envelope(anchor: &SharedAnchor) -> Envelope {
    Envelope::Anchor(AnchorPayload::from_anchor(anchor))
}

/// Envelope for the relay channel: the full anchor when its world map fits
/// under `limit`, otherwise a pose-only alignment.
pub fn relay_anchor_envelope(anchor: &SharedAnchor, limit: usize, source: &str) -> Envelope {
    if anchor.world_map_len() > limit {
        log::debug!(
            "World map of {} bytes exceeds relay limit {}; sending alignment",
            anchor.world_map_len(),
            limit
        );
        Envelope::CoordinateAlignment(AlignmentPayload::from_anchor(anchor, source))
    } else {
        anchor_envelope(anchor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spatial_core::Vec3;
    use tempfile::TempDir;

    #[test]
    fn test_last_writer_wins_regardless_of_confidence() {
        let mut coordinator = AnchorCoordinator::new(None);
        let high = SharedAnchor::new(Matrix4::IDENTITY, 0.9, None);
        let low = SharedAnchor::new(Matrix4::from_translation(Vec3::new(1.0, 0.0, 0.0)), 0.3, None);

        coordinator.apply_remote(high);
        coordinator.apply_remote(low.clone());
        assert_eq!(coordinator.current(), Some(&low));
    }

    #[test]
    fn test_older_timestamp_still_wins() {
        let mut coordinator = AnchorCoordinator::new(None);
        let newer = SharedAnchor::new(Matrix4::IDENTITY, 0.5, None);
        let mut older = SharedAnchor::new(Matrix4::IDENTITY, 0.5, None);
        older.timestamp_ms = newer.timestamp_ms - 10_000;

        coordinator.apply_remote(newer);
        coordinator.apply_remote(older.clone());
        assert_eq!(coordinator.current().unwrap().id, older.id);
    }

    #[test]
    fn test_remote_confidence_clamped_like_alignment() {
        let mut coordinator = AnchorCoordinator::new(None);
        let mut anchor = SharedAnchor::new(Matrix4::IDENTITY, 0.5, None);
        anchor.confidence = 3.5;
        assert_eq!(coordinator.apply_remote(anchor.clone()).confidence, 1.0);

        let mut alignment = AlignmentPayload::from_anchor(&anchor, "host");
        alignment.confidence = 3.5;
        assert_eq!(coordinator.apply_alignment(&alignment).confidence, 1.0);

        anchor.confidence = -0.25;
        assert_eq!(coordinator.apply_remote(anchor).confidence, 0.0);
    }

    #[test]
    fn test_alignment_keeps_world_map_for_same_anchor() {
        let mut coordinator = AnchorCoordinator::new(None);
        let anchor = coordinator.capture(Matrix4::IDENTITY, 0.8, Some(vec![1, 2, 3]));

        let mut moved = anchor.clone();
        moved.transform = Matrix4::from_translation(Vec3::new(0.0, 2.0, 0.0));
        let alignment = AlignmentPayload::from_anchor(&moved, "host");
        let current = coordinator.apply_alignment(&alignment);
        assert_eq!(current.world_map.as_deref(), Some(&[1u8, 2, 3][..]));
        assert_eq!(current.transform.translation(), Vec3::new(0.0, 2.0, 0.0));

        let other = SharedAnchor::new(Matrix4::IDENTITY, 0.8, None);
        let current = coordinator.apply_alignment(&AlignmentPayload::from_anchor(&other, "host"));
        assert!(current.world_map.is_none());
    }

    #[test]
    fn test_write_through_and_restore() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("anchor.bin");

        let mut first = AnchorCoordinator::new(Some(AnchorStore::new(&path)));
        let anchor = first.capture(Matrix4::from_translation(Vec3::new(0.5, 0.0, -1.0)), 0.7, Some(vec![4; 64]));

        let mut second = AnchorCoordinator::new(Some(AnchorStore::new(&path)));
        assert_eq!(second.restore(), Some(&anchor));

        second.clear();
        let mut third = AnchorCoordinator::new(Some(AnchorStore::new(&path)));
        assert!(third.restore().is_none());
    }

    #[test]
    fn test_persist_failure_keeps_anchor_in_memory() {
        let dir = TempDir::new().unwrap();
        // A directory where the file should be makes every write fail
        let path = dir.path().join("anchor.bin");
        std::fs::create_dir_all(&path).unwrap();

        let mut coordinator = AnchorCoordinator::new(Some(AnchorStore::new(&path)));
        let anchor = coordinator.capture(Matrix4::IDENTITY, 0.5, None);
        assert_eq!(coordinator.current(), Some(&anchor));
    }

    #[test]
    fn test_relay_envelope_respects_limit() {
        let small = SharedAnchor::new(Matrix4::IDENTITY, 0.5, Some(vec![0; 10]));
        assert!(matches!(relay_anchor_envelope(&small, 64, "host"), Envelope::Anchor(_)));

        let large = SharedAnchor::new(Matrix4::IDENTITY, 0.5, Some(vec![0; 100]));
        match relay_anchor_envelope(&large, 64, "host") {
            Envelope::CoordinateAlignment(a) => {
                assert_eq!(a.anchor_id, large.id);
                assert_eq!(a.source, "host");
            }
            other => panic!("unexpected {}", other.tag()),
        }
    }
}
