//! The shared world anchor every participant interprets positions against.

use uuid::Uuid;

use crate::math::Matrix4;

/// Single agreed-upon world pose.
///
/// `world_map` is a device-specific blob forwarded untouched; this crate
/// never interprets it.
#[derive(Debug, Clone, PartialEq)]
pub struct SharedAnchor {
    pub id: Uuid,
    pub transform: Matrix4,
    /// Informational only, in [0, 1]. Never used to arbitrate between anchors.
    pub confidence: f32,
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    pub world_map: Option<Vec<u8>>,
}

impl SharedAnchor {
    pub fn new(transform: Matrix4, confidence: f32, world_map: Option<Vec<u8>>) -> Self {
        Self {
            id: Uuid::new_v4(),
            transform,
            confidence: confidence.clamp(0.0, 1.0),
            timestamp_ms: crate::now_ms(),
            world_map,
        }
    }

    pub fn world_map_len(&self) -> usize {
        self.world_map.as_ref().map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confidence_clamped() {
        assert_eq!(SharedAnchor::new(Matrix4::IDENTITY, 1.7, None).confidence, 1.0);
        assert_eq!(SharedAnchor::new(Matrix4::IDENTITY, -0.2, None).confidence, 0.0);
    }

    #[test]
    fn test_fresh_ids() {
        let a = SharedAnchor::new(Matrix4::IDENTITY, 0.5, None);
        let b = SharedAnchor::new(Matrix4::IDENTITY, 0.5, None);
        assert_ne!(a.id, b.id);
        assert_eq!(a.world_map_len(), 0);
    }
}
