//! # spatial-core: data model for shared spatial diagrams
//!
//! Pure types with no I/O: the math primitives, the diagram/element model
//! and the shared world anchor. The synchronization engine lives in
//! `spatial-collab`.

pub mod anchor;
pub mod diagram;
pub mod math;

pub use anchor::SharedAnchor;
pub use diagram::{filenames_match, Color, Diagram, Element, ElementKind};
pub use math::{Matrix4, Pose, PoseUpdate, Quat, Vec3};

use std::time::SystemTime;

/// Milliseconds since the Unix epoch (0 if the clock is before it).
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
