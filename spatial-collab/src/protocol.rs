//! Envelope wire format for every synchronized fact.
//!
//! Wire format (JSON, adjacently tagged):
//! ```text
//! { "type": "diagram", "payload": { "id": "…", "filename": "tree", … } }
//! ```
//!
//! Pose data travels as individual scalars (the anchor matrix as 16
//! column-major floats) so heterogeneous receivers need no shared binary
//! layout. Opaque blobs (device world maps, AR collaboration data) travel
//! as base64 strings and are passed through unchanged.

use serde::{Deserialize, Serialize};
use spatial_core::{Diagram, Matrix4, Quat, SharedAnchor, Vec3};
use thiserror::Error;
use uuid::Uuid;

/// Anchor payload: the full shared anchor, world map included.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnchorPayload {
    pub anchor_id: Uuid,
    /// 4×4 pose, column-major.
    pub transform: [f32; 16],
    pub confidence: f32,
    pub timestamp_ms: u64,
    #[serde(default, with = "opt_base64", skip_serializing_if = "Option::is_none")]
    pub world_map: Option<Vec<u8>>,
}

impl AnchorPayload {
    pub fn from_anchor(anchor: &SharedAnchor) -> Self {
        Self {
            anchor_id: anchor.id,
            transform: anchor.transform.flatten(),
            confidence: anchor.confidence,
            timestamp_ms: anchor.timestamp_ms,
            world_map: anchor.world_map.clone(),
        }
    }

    pub fn to_anchor(&self) -> SharedAnchor {
        SharedAnchor {
            id: self.anchor_id,
            transform: Matrix4::from_flat(&self.transform),
            confidence: self.confidence,
            timestamp_ms: self.timestamp_ms,
            world_map: self.world_map.clone(),
        }
    }
}

/// Pose-only alignment, used where the world map is too large to carry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignmentPayload {
    pub anchor_id: Uuid,
    pub transform: [f32; 16],
    pub confidence: f32,
    pub timestamp_ms: u64,
    /// Display name of the device that produced the alignment.
    pub source: String,
}

impl AlignmentPayload {
    pub fn from_anchor(anchor: &SharedAnchor, source: impl Into<String>) -> Self {
        Self {
            anchor_id: anchor.id,
            transform: anchor.transform.flatten(),
            confidence: anchor.confidence,
            timestamp_ms: anchor.timestamp_ms,
            source: source.into(),
        }
    }
}

/// Partial pose change for a diagram. Absent fields are left untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformUpdate {
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagram_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Vec3>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orientation: Option<Quat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementMove {
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagram_id: Option<Uuid>,
    pub element_id: String,
    pub position: Vec3,
    /// Host clock at the edit, so every replica carries the same timestamp.
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoveDiagram {
    /// The filename as requested by the host; receivers apply fuzzy matching.
    pub filename: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpaqueBlob {
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEnded {
    /// Display name of the host that ended the session.
    pub host: String,
    pub reason: String,
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantLeft {
    pub peer_name: String,
    pub timestamp_ms: u64,
}

/// One unit of network traffic: exactly one synchronized fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Envelope {
    Anchor(AnchorPayload),
    CoordinateAlignment(AlignmentPayload),
    Diagram(Diagram),
    TransformUpdate(TransformUpdate),
    ElementMove(ElementMove),
    Remove(RemoveDiagram),
    OpaqueBlob(OpaqueBlob),
    SessionEnded(SessionEnded),
    ParticipantLeft(ParticipantLeft),
}

impl Envelope {
    /// Wire tag of this variant.
    pub fn tag(&self) -> &'static str {
        match self {
            Envelope::Anchor(_) => "anchor",
            Envelope::CoordinateAlignment(_) => "coordinate_alignment",
            Envelope::Diagram(_) => "diagram",
            Envelope::TransformUpdate(_) => "transform_update",
            Envelope::ElementMove(_) => "element_move",
            Envelope::Remove(_) => "remove",
            Envelope::OpaqueBlob(_) => "opaque_blob",
            Envelope::SessionEnded(_) => "session_ended",
            Envelope::ParticipantLeft(_) => "participant_left",
        }
    }

    /// Serialize to wire bytes.
    ///
    /// JSON has no representation for NaN or infinity, so non-finite pose
    /// scalars are rejected here rather than silently becoming `null`.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        if !self.is_finite() {
            return Err(CodecError::NonFinite(self.tag()));
        }
        serde_json::to_vec(self).map_err(|e| CodecError::Encoding(e.to_string()))
    }

    /// Deserialize from wire bytes. Unknown tags and mismatched payloads fail.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Decoding(e.to_string()))
    }

    fn is_finite(&self) -> bool {
        let flat_ok = |t: &[f32; 16]| t.iter().all(|v| v.is_finite());
        match self {
            Envelope::Anchor(a) => flat_ok(&a.transform) && a.confidence.is_finite(),
            Envelope::CoordinateAlignment(a) => flat_ok(&a.transform) && a.confidence.is_finite(),
            Envelope::Diagram(d) => {
                d.pose.map_or(true, |p| p.is_finite())
                    && d.elements.iter().all(|e| e.position.is_finite() && e.color.is_finite())
            }
            Envelope::TransformUpdate(t) => {
                t.position.map_or(true, |p| p.is_finite())
                    && t.orientation.map_or(true, |q| q.is_finite())
                    && t.scale.map_or(true, |s| s.is_finite())
            }
            Envelope::ElementMove(m) => m.position.is_finite(),
            Envelope::Remove(_)
            | Envelope::OpaqueBlob(_)
            | Envelope::SessionEnded(_)
            | Envelope::ParticipantLeft(_) => true,
        }
    }
}

/// Codec errors. Callers log and drop; never fatal to a session.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CodecError {
    #[error("Encoding error: {0}")]
    Encoding(String),
    #[error("Non-finite value in {0} envelope")]
    NonFinite(&'static str),
    #[error("Decoding error: {0}")]
    Decoding(String),
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text.as_bytes()).map_err(serde::de::Error::custom)
    }
}

mod opt_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(text) => STANDARD
                .decode(text.as_bytes())
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}
