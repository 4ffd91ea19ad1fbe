//! Spatial math primitives shared by the diagram model and the anchor layer.
//!
//! Matrices are column-major: `columns[c][r]`. The flattened form used on the
//! wire and on disk is the 16 scalars of column 0, then column 1, and so on.

use serde::{Deserialize, Serialize};

/// 3-component vector in meters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const ZERO: Vec3 = Vec3 { x: 0.0, y: 0.0, z: 0.0 };

    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    /// Euclidean distance to another point.
    pub fn distance(&self, other: &Vec3) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

impl Default for Vec3 {
    fn default() -> Self {
        Self::ZERO
    }
}

/// Unit quaternion orientation (x, y, z imaginary; w real).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quat {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

impl Quat {
    pub const IDENTITY: Quat = Quat { x: 0.0, y: 0.0, z: 0.0, w: 1.0 };

    pub fn new(x: f32, y: f32, z: f32, w: f32) -> Self {
        Self { x, y, z, w }
    }

    /// Rotation of `angle` radians around the +Y axis.
    pub fn from_yaw(angle: f32) -> Self {
        let half = angle * 0.5;
        Self { x: 0.0, y: half.sin(), z: 0.0, w: half.cos() }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite() && self.w.is_finite()
    }
}

impl Default for Quat {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// 4×4 rigid / uniform-scale transform, column-major.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Matrix4 {
    pub columns: [[f32; 4]; 4],
}

impl Matrix4 {
    pub const IDENTITY: Matrix4 = Matrix4 {
        columns: [
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ],
    };

    /// Flatten to 16 scalars, column by column.
    pub fn flatten(&self) -> [f32; 16] {
        let mut out = [0.0; 16];
        for (c, column) in self.columns.iter().enumerate() {
            out[c * 4..c * 4 + 4].copy_from_slice(column);
        }
        out
    }

    /// Rebuild from the flattened column-major form. No renormalization.
    pub fn from_flat(values: &[f32; 16]) -> Self {
        let mut columns = [[0.0; 4]; 4];
        for (c, column) in columns.iter_mut().enumerate() {
            column.copy_from_slice(&values[c * 4..c * 4 + 4]);
        }
        Self { columns }
    }

    pub fn from_translation(t: Vec3) -> Self {
        let mut m = Self::IDENTITY;
        m.columns[3] = [t.x, t.y, t.z, 1.0];
        m
    }

    /// Translation · rotation · uniform scale.
    pub fn from_pose(pose: &Pose) -> Self {
        let Quat { x, y, z, w } = pose.orientation;
        let s = pose.scale;
        Self {
            columns: [
                [
                    (1.0 - 2.0 * (y * y + z * z)) * s,
                    (2.0 * (x * y + z * w)) * s,
                    (2.0 * (x * z - y * w)) * s,
                    0.0,
                ],
                [
                    (2.0 * (x * y - z * w)) * s,
                    (1.0 - 2.0 * (x * x + z * z)) * s,
                    (2.0 * (y * z + x * w)) * s,
                    0.0,
                ],
                [
                    (2.0 * (x * z + y * w)) * s,
                    (2.0 * (y * z - x * w)) * s,
                    (1.0 - 2.0 * (x * x + y * y)) * s,
                    0.0,
                ],
                [pose.position.x, pose.position.y, pose.position.z, 1.0],
            ],
        }
    }

    pub fn translation(&self) -> Vec3 {
        let t = self.columns[3];
        Vec3::new(t[0], t[1], t[2])
    }

    pub fn mul(&self, rhs: &Matrix4) -> Matrix4 {
        let mut columns = [[0.0; 4]; 4];
        for (c, out) in columns.iter_mut().enumerate() {
            for (r, cell) in out.iter_mut().enumerate() {
                *cell = (0..4).map(|k| self.columns[k][r] * rhs.columns[c][k]).sum();
            }
        }
        Matrix4 { columns }
    }

    pub fn is_finite(&self) -> bool {
        self.columns.iter().flatten().all(|v| v.is_finite())
    }
}

impl Default for Matrix4 {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Placement of a diagram relative to the shared anchor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub position: Vec3,
    pub orientation: Quat,
    /// Uniform scale factor.
    pub scale: f32,
}

impl Pose {
    pub const IDENTITY: Pose = Pose {
        position: Vec3::ZERO,
        orientation: Quat::IDENTITY,
        scale: 1.0,
    };

    pub fn at(position: Vec3) -> Self {
        Self { position, ..Self::IDENTITY }
    }

    /// Overwrite only the fields present in `update`.
    pub fn apply(&mut self, update: &PoseUpdate) {
        if let Some(position) = update.position {
            self.position = position;
        }
        if let Some(orientation) = update.orientation {
            self.orientation = orientation;
        }
        if let Some(scale) = update.scale {
            self.scale = scale;
        }
    }

    pub fn is_finite(&self) -> bool {
        self.position.is_finite() && self.orientation.is_finite() && self.scale.is_finite()
    }
}

impl Default for Pose {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Partial pose change. Absent fields leave the target untouched.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PoseUpdate {
    pub position: Option<Vec3>,
    pub orientation: Option<Quat>,
    pub scale: Option<f32>,
}

impl PoseUpdate {
    pub fn position(position: Vec3) -> Self {
        Self { position: Some(position), ..Self::default() }
    }

    pub fn is_empty(&self) -> bool {
        self.position.is_none() && self.orientation.is_none() && self.scale.is_none()
    }

    pub fn is_finite(&self) -> bool {
        self.position.map_or(true, |p| p.is_finite())
            && self.orientation.map_or(true, |q| q.is_finite())
            && self.scale.map_or(true, |s| s.is_finite())
    }
}

impl From<Pose> for PoseUpdate {
    fn from(pose: Pose) -> Self {
        Self {
            position: Some(pose.position),
            orientation: Some(pose.orientation),
            scale: Some(pose.scale),
        }
    }
}
