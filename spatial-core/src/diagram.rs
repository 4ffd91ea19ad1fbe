//! Shared diagrams: positioned, typed visual elements placed in the common frame.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::anchor::SharedAnchor;
use crate::math::{Matrix4, Pose, Vec3};

/// RGBA color, components in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Color {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl Color {
    pub fn rgba(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }

    pub fn to_array(&self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }

    pub fn is_finite(&self) -> bool {
        self.to_array().iter().all(|c| c.is_finite())
    }
}

impl Default for Color {
    fn default() -> Self {
        Self { r: 0.26, g: 0.52, b: 0.96, a: 1.0 }
    }
}

/// Shape descriptor of an element.
///
/// Unknown kinds from newer peers decode as `Other` instead of failing the
/// whole diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementKind {
    Box,
    Sphere,
    Cylinder,
    Text,
    Edge,
    #[serde(other)]
    Other,
}

/// A single visual element inside a diagram.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    /// Unique within the owning diagram.
    pub id: String,
    pub kind: ElementKind,
    pub color: Color,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Local position relative to the diagram pose.
    pub position: Vec3,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_id: Option<String>,
}

impl Element {
    pub fn node(id: impl Into<String>, kind: ElementKind, position: Vec3) -> Self {
        Self {
            id: id.into(),
            kind,
            color: Color::default(),
            label: None,
            position,
            from_id: None,
            to_id: None,
        }
    }

    pub fn edge(id: impl Into<String>, from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: ElementKind::Edge,
            color: Color::default(),
            label: None,
            position: Vec3::ZERO,
            from_id: Some(from.into()),
            to_id: Some(to.into()),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_color(mut self, color: Color) -> Self {
        self.color = color;
        self
    }

    pub fn is_edge(&self) -> bool {
        self.from_id.is_some() || self.to_id.is_some()
    }
}

/// A shared diagram. Treated as a value: edits build a new element list and
/// swap it in rather than mutating elements in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagram {
    /// Stable across edits, never reused.
    pub id: Uuid,
    /// Lookup key used by higher layers; unique among shared diagrams.
    pub filename: String,
    pub elements: Vec<Element>,
    /// Milliseconds since the Unix epoch, refreshed on structural edit.
    pub timestamp_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pose: Option<Pose>,
}

impl Diagram {
    pub fn new(filename: impl Into<String>, elements: Vec<Element>, pose: Option<Pose>) -> Self {
        Self {
            id: Uuid::new_v4(),
            filename: filename.into(),
            elements,
            timestamp_ms: crate::now_ms(),
            pose,
        }
    }

    pub fn element(&self, element_id: &str) -> Option<&Element> {
        self.elements.iter().find(|e| e.id == element_id)
    }

    /// Copy of this diagram with one element's position replaced.
    ///
    /// Returns `None` when the element does not exist.
    pub fn with_element_position(&self, element_id: &str, position: Vec3, timestamp_ms: u64) -> Option<Diagram> {
        if self.element(element_id).is_none() {
            return None;
        }
        let elements = self
            .elements
            .iter()
            .map(|e| {
                if e.id == element_id {
                    Element { position, ..e.clone() }
                } else {
                    e.clone()
                }
            })
            .collect();
        Some(Diagram {
            elements,
            timestamp_ms,
            ..self.clone()
        })
    }

    /// Edge elements whose endpoints are missing from this diagram.
    /// These are skipped by the renderer, never treated as errors.
    pub fn dangling_edges(&self) -> Vec<&Element> {
        let exists = |id: &Option<String>| match id {
            Some(id) => self.elements.iter().any(|e| &e.id == id),
            None => false,
        };
        self.elements
            .iter()
            .filter(|e| e.is_edge() && !(exists(&e.from_id) && exists(&e.to_id)))
            .collect()
    }

    /// World transform of the diagram: anchor transform composed with pose.
    pub fn world_transform(&self, anchor: Option<&SharedAnchor>) -> Option<Matrix4> {
        let local = Matrix4::from_pose(&self.pose?);
        Some(match anchor {
            Some(anchor) => anchor.transform.mul(&local),
            None => local,
        })
    }
}

/// Fuzzy filename identity: equal, or either is a prefix of the other.
///
/// Upstream tooling appends suffixes (e.g. `tree_1699999999`) when it
/// renames temporary files, so `tree` and `tree_1699999999` are the same
/// diagram. An empty name never matches.
// TODO: switch callers to diagram ids once upstream stops renaming files.
pub fn filenames_match(requested: &str, candidate: &str) -> bool {
    if requested.is_empty() || candidate.is_empty() {
        return false;
    }
    requested == candidate || candidate.starts_with(requested) || requested.starts_with(candidate)
}
