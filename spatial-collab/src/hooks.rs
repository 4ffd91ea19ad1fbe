//! Seams to the device: where poses come from and where opaque data goes.

use std::sync::RwLock;

use spatial_core::{Matrix4, SharedAnchor};

use crate::transport::PeerInfo;

/// Source of the local device pose used when capturing an anchor.
pub trait PoseProvider: Send + Sync {
    /// Current device pose, or `None` while tracking is unavailable.
    fn current_pose(&self) -> Option<Matrix4>;

    /// Device world map to attach to a new anchor.
    fn world_map(&self) -> Option<Vec<u8>> {
        None
    }
}

/// Receives data the session forwards without interpreting.
pub trait SessionObserver: Send + Sync {
    /// An opaque blob arrived from `from`.
    fn on_opaque_blob(&self, _data: &[u8], _from: &PeerInfo) {}

    /// The shared anchor changed (captured locally or received).
    fn on_anchor(&self, _anchor: &SharedAnchor) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl SessionObserver for NullObserver {}

/// Fixed pose, settable at runtime (headless nodes and tests).
#[derive(Debug, Default)]
pub struct StaticPoseProvider {
    pose: RwLock<Option<Matrix4>>,
    world_map: RwLock<Option<Vec<u8>>>,
}

impl StaticPoseProvider {
    pub fn new(pose: Option<Matrix4>) -> Self {
        Self {
            pose: RwLock::new(pose),
            world_map: RwLock::new(None),
        }
    }

    pub fn with_world_map(self, world_map: Vec<u8>) -> Self {
        self.set_world_map(Some(world_map));
        self
    }

    pub fn set_pose(&self, pose: Option<Matrix4>) {
        match self.pose.write() {
            Ok(mut guard) => *guard = pose,
            Err(poisoned) => *poisoned.into_inner() = pose,
        }
    }

    pub fn set_world_map(&self, world_map: Option<Vec<u8>>) {
        match self.world_map.write() {
            Ok(mut guard) => *guard = world_map,
            Err(poisoned) => *poisoned.into_inner() = world_map,
        }
    }
}

impl PoseProvider for StaticPoseProvider {
    fn current_pose(&self) -> Option<Matrix4> {
        self.pose.read().ok().and_then(|pose| *pose)
    }

    fn world_map(&self) -> Option<Vec<u8>> {
        self.world_map.read().ok().and_then(|map| map.clone())
    }
}
