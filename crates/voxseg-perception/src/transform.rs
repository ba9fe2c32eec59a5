//! Pose Resolver.
//!
//! Converts a translation + quaternion [`Pose`] into a 4×4 homogeneous
//! [`TransformationMatrix`], and composes chains of resolved poses into a
//! single camera extrinsics matrix.
//!
//! Quaternions are not assumed to be unit length: [`resolve`] normalises
//! them first and rejects near-zero quaternions with
//! [`VoxsegError::DegeneratePose`] instead of producing a collapsed matrix.
//!
//! # Example
//!
//! ```rust
//! use voxseg_perception::transform::{resolve, Pose, Quaternion, Vec3};
//!
//! let pose = Pose::new(Vec3::new(1.0, 2.0, 3.0), Quaternion::identity());
//! let m = resolve(&pose).unwrap();
//! assert_eq!(m.translation(), [1.0, 2.0, 3.0]);
//! assert_eq!(m.m[3], [0.0, 0.0, 0.0, 1.0]);
//! ```

use serde::{Deserialize, Serialize};
use voxseg_types::{TransformationMatrix, VoxsegError};

/// Quaternions with a norm below this are rejected as degenerate.
pub const QUATERNION_NORM_EPSILON: f32 = 1e-6;

// ────────────────────────────────────────────────────────────────────────────
// Primitive types
// ────────────────────────────────────────────────────────────────────────────

/// A 3-D translation vector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn zero() -> Self {
        Self::new(0.0, 0.0, 0.0)
    }
}

/// A rotation quaternion (w, x, y, z convention), not necessarily unit length.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quaternion {
    pub w: f32,
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Quaternion {
    pub fn new(w: f32, x: f32, y: f32, z: f32) -> Self {
        Self { w, x, y, z }
    }

    /// Build from ROS `geometry_msgs` ordering `(x, y, z, w)`.
    pub fn from_xyzw(x: f32, y: f32, z: f32, w: f32) -> Self {
        Self::new(w, x, y, z)
    }

    /// The identity rotation.
    pub fn identity() -> Self {
        Self::new(1.0, 0.0, 0.0, 0.0)
    }

    /// Euclidean norm.
    pub fn norm(self) -> f32 {
        (self.w * self.w + self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    /// Scale to unit length.
    ///
    /// Fails with [`VoxsegError::DegeneratePose`] when the norm is below
    /// [`QUATERNION_NORM_EPSILON`] or not finite.
    pub fn normalized(self) -> Result<Self, VoxsegError> {
        let norm = self.norm();
        if !norm.is_finite() || norm < QUATERNION_NORM_EPSILON {
            return Err(VoxsegError::DegeneratePose { norm });
        }
        Ok(Self::new(
            self.w / norm,
            self.x / norm,
            self.y / norm,
            self.z / norm,
        ))
    }

    /// 3×3 rotation block of a unit quaternion.
    fn rotation_block(self) -> [[f32; 3]; 3] {
        let Self { w, x, y, z } = self;
        [
            [
                1.0 - 2.0 * (y * y + z * z),
                2.0 * (x * y - w * z),
                2.0 * (x * z + w * y),
            ],
            [
                2.0 * (x * y + w * z),
                1.0 - 2.0 * (x * x + z * z),
                2.0 * (y * z - w * x),
            ],
            [
                2.0 * (x * z - w * y),
                2.0 * (y * z + w * x),
                1.0 - 2.0 * (x * x + y * y),
            ],
        ]
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Pose
// ────────────────────────────────────────────────────────────────────────────

/// A rigid-body pose: the child frame expressed in the parent frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub translation: Vec3,
    pub rotation: Quaternion,
}

impl Pose {
    pub fn new(translation: Vec3, rotation: Quaternion) -> Self {
        Self {
            translation,
            rotation,
        }
    }

    /// Build from a `[tx, ty, tz, qx, qy, qz, qw]` array.
    pub fn from_array(pose: [f32; 7]) -> Self {
        let [tx, ty, tz, qx, qy, qz, qw] = pose;
        Self::new(
            Vec3::new(tx, ty, tz),
            Quaternion::from_xyzw(qx, qy, qz, qw),
        )
    }
}

/// Resolve a [`Pose`] into a homogeneous [`TransformationMatrix`].
///
/// Pure; safe to call from any thread.
pub fn resolve(pose: &Pose) -> Result<TransformationMatrix, VoxsegError> {
    let r = pose.rotation.normalized()?.rotation_block();
    let t = pose.translation;
    Ok(TransformationMatrix::new([
        [r[0][0], r[0][1], r[0][2], t.x],
        [r[1][0], r[1][1], r[1][2], t.y],
        [r[2][0], r[2][1], r[2][2], t.z],
        [0.0, 0.0, 0.0, 1.0],
    ]))
}

/// Compose a chain of transforms ordered from the world side to the sensor
/// side: `chain[0] · chain[1] · … · chain[n-1]`.
///
/// An empty chain yields the identity.
pub fn compose_chain<'a, I>(chain: I) -> TransformationMatrix
where
    I: IntoIterator<Item = &'a TransformationMatrix>,
{
    chain
        .into_iter()
        .fold(TransformationMatrix::identity(), |acc, t| acc.compose(t))
}
