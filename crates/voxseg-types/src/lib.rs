//! `voxseg-types` – shared data model for the VoxSeg ingestion pipeline.
//!
//! Everything that crosses a crate boundary lives here: decoded images,
//! [`Frame`]s, [`TransformationMatrix`], the semantic [`Vocabulary`], the
//! [`LabelGrid`] returned by a reconstruction engine and its wire form
//! [`VoxelGridMsg`], plus the crate-wide [`VoxsegError`].

use std::collections::BTreeMap;
use std::ops::Mul;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Sensor timestamp in seconds.
pub type Stamp = f64;

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// Error type shared by every VoxSeg crate.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum VoxsegError {
    /// A pose quaternion was too close to zero to be normalised.
    #[error("Degenerate pose: quaternion norm {norm} is below epsilon")]
    DegeneratePose { norm: f32 },

    /// An image or depth payload could not be decoded.
    #[error("Decode Error: {0}")]
    Decode(String),

    /// A compute request arrived before any class or prompt was configured.
    #[error("No vocabulary configured: publish classes or prompts first")]
    NoVocabularyConfigured,

    #[error("Shape mismatch: expected {expected} elements, got {actual}")]
    ShapeMismatch { expected: usize, actual: usize },

    /// The reconstruction engine reported a failure.
    #[error("Reconstruction Engine Error: {0}")]
    Engine(String),

    #[error("Channel Error: {0}")]
    Channel(String),

    /// The compute-request service is no longer running.
    #[error("Compute service unavailable")]
    ServiceUnavailable,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

// ────────────────────────────────────────────────────────────────────────────
// Images
// ────────────────────────────────────────────────────────────────────────────

/// An undecoded image exactly as delivered by the transport.
///
/// `encoding` follows the ROS naming (`"rgb8"`, `"bgr8"`, `"32FC1"`, …).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawImage {
    pub width: u32,
    pub height: u32,
    pub encoding: String,
    pub data: Vec<u8>,
}

/// A decoded, tightly packed RGB24 image.
#[derive(Debug, Clone, PartialEq)]
pub struct RgbImage {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl RgbImage {
    /// Wrap an RGB24 buffer, checking that it holds `width * height * 3` bytes.
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Result<Self, VoxsegError> {
        let expected = width as usize * height as usize * 3;
        if data.len() != expected {
            return Err(VoxsegError::ShapeMismatch {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Raw RGB24 bytes, row-major.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The `[r, g, b]` triple at column `x`, row `y`.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = (y as usize * self.width as usize + x as usize) * 3;
        Some([self.data[i], self.data[i + 1], self.data[i + 2]])
    }
}

/// A decoded depth image in metres.
#[derive(Debug, Clone, PartialEq)]
pub struct DepthImage {
    width: u32,
    height: u32,
    data: Vec<f32>,
}

impl DepthImage {
    /// Wrap a depth buffer, checking that it holds `width * height` values.
    pub fn new(width: u32, height: u32, data: Vec<f32>) -> Result<Self, VoxsegError> {
        let expected = width as usize * height as usize;
        if data.len() != expected {
            return Err(VoxsegError::ShapeMismatch {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn depth(&self, x: u32, y: u32) -> Option<f32> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.data
            .get(y as usize * self.width as usize + x as usize)
            .copied()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// TransformationMatrix
// ────────────────────────────────────────────────────────────────────────────

/// A 4×4 homogeneous rigid transform, stored row-major.
///
/// Composition follows the right-to-left convention:
/// `T_a_to_c = T_b_to_c.compose(T_a_to_b)`, i.e. `compose` is plain matrix
/// multiplication `self · rhs`, and `rhs` is applied to a point first.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TransformationMatrix {
    pub m: [[f32; 4]; 4],
}

impl TransformationMatrix {
    pub fn new(m: [[f32; 4]; 4]) -> Self {
        Self { m }
    }

    /// The identity transform.
    pub fn identity() -> Self {
        let mut m = [[0.0; 4]; 4];
        for (i, row) in m.iter_mut().enumerate() {
            row[i] = 1.0;
        }
        Self { m }
    }

    /// Build from 16 row-major values, as carried by the `cam_extrinsics`
    /// field of a frame bundle.
    pub fn from_row_major(values: &[f32]) -> Result<Self, VoxsegError> {
        if values.len() != 16 {
            return Err(VoxsegError::ShapeMismatch {
                expected: 16,
                actual: values.len(),
            });
        }
        let mut m = [[0.0; 4]; 4];
        for (i, v) in values.iter().enumerate() {
            m[i / 4][i % 4] = *v;
        }
        Ok(Self { m })
    }

    pub fn to_row_major(&self) -> [f32; 16] {
        let mut out = [0.0; 16];
        for (i, v) in out.iter_mut().enumerate() {
            *v = self.m[i / 4][i % 4];
        }
        out
    }

    /// Matrix product `self · rhs`: apply `rhs` first, then `self`.
    pub fn compose(&self, rhs: &Self) -> Self {
        let mut m = [[0.0; 4]; 4];
        for (r, row) in m.iter_mut().enumerate() {
            for (c, cell) in row.iter_mut().enumerate() {
                *cell = (0..4).map(|k| self.m[r][k] * rhs.m[k][c]).sum();
            }
        }
        Self { m }
    }

    /// The translation column.
    pub fn translation(&self) -> [f32; 3] {
        [self.m[0][3], self.m[1][3], self.m[2][3]]
    }

    /// Transform a point (`w = 1`).
    pub fn transform_point(&self, p: [f32; 3]) -> [f32; 3] {
        let mut out = [0.0; 3];
        for (r, o) in out.iter_mut().enumerate() {
            *o = self.m[r][0] * p[0] + self.m[r][1] * p[1] + self.m[r][2] * p[2] + self.m[r][3];
        }
        out
    }
}

impl Default for TransformationMatrix {
    fn default() -> Self {
        Self::identity()
    }
}

impl Mul for TransformationMatrix {
    type Output = Self;

    fn mul(self, rhs: Self) -> Self {
        self.compose(&rhs)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Frame
// ────────────────────────────────────────────────────────────────────────────

/// One time-aligned tuple of RGB image, depth image and camera extrinsics.
///
/// Immutable once constructed.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    rgb: RgbImage,
    depth: DepthImage,
    extrinsics: TransformationMatrix,
}

impl Frame {
    pub fn new(rgb: RgbImage, depth: DepthImage, extrinsics: TransformationMatrix) -> Self {
        Self {
            rgb,
            depth,
            extrinsics,
        }
    }

    pub fn rgb(&self) -> &RgbImage {
        &self.rgb
    }

    pub fn depth(&self) -> &DepthImage {
        &self.depth
    }

    pub fn extrinsics(&self) -> &TransformationMatrix {
        &self.extrinsics
    }

    pub fn into_parts(self) -> (RgbImage, DepthImage, TransformationMatrix) {
        (self.rgb, self.depth, self.extrinsics)
    }
}

/// An RGB/depth pair that arrives already matched with its extrinsics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameBundle {
    pub rgb_image: RawImage,
    pub depth_image: RawImage,
    /// Row-major 4×4 camera extrinsics.
    pub cam_extrinsics: Vec<f32>,
}

// ────────────────────────────────────────────────────────────────────────────
// Vocabulary
// ────────────────────────────────────────────────────────────────────────────

/// The active semantic vocabulary used to label voxels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Vocabulary {
    /// A flat list of class names.
    Classes(Vec<String>),
    /// Group key → ordered prompts describing that group.
    Prompts(BTreeMap<String, Vec<String>>),
}

impl Vocabulary {
    /// Number of labels a query against this vocabulary can produce.
    pub fn len(&self) -> usize {
        match self {
            Vocabulary::Classes(classes) => classes.len(),
            Vocabulary::Prompts(prompts) => prompts.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Class-update message as published by clients.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClassUpdate {
    #[serde(default)]
    pub classes: Vec<String>,
    #[serde(default)]
    pub prompts: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub use_prompts: bool,
}

impl ClassUpdate {
    /// Select the authoritative representation.
    ///
    /// Returns `None` when the selected side is empty; the other side is
    /// never consulted.
    pub fn into_vocabulary(self) -> Option<Vocabulary> {
        let vocabulary = if self.use_prompts {
            Vocabulary::Prompts(self.prompts)
        } else {
            Vocabulary::Classes(self.classes)
        };
        (!vocabulary.is_empty()).then_some(vocabulary)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Voxel grids
// ────────────────────────────────────────────────────────────────────────────

/// Label value meaning "no class / unknown".
pub const UNKNOWN_LABEL: i32 = -1;

/// Offset a label into the unsigned wire range: `-1 → 0`, `254 → 255`.
///
/// Labels outside `[-1, 254]` are clamped.
pub fn encode_label(label: i32) -> u8 {
    label.saturating_add(1).clamp(0, u8::MAX as i32) as u8
}

/// Inverse of [`encode_label`] for every label in `[-1, 254]`.
pub fn decode_label(byte: u8) -> i32 {
    i32::from(byte) - 1
}

/// A dense 3-D array of class indices.
///
/// Storage order is x-major with z varying fastest:
/// `index = (x * size_y + y) * size_z + z`.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelGrid {
    size: [u32; 3],
    labels: Vec<i32>,
}

impl LabelGrid {
    /// Wrap a flat label buffer laid out in x-major / z-fastest order.
    pub fn new(size: [u32; 3], labels: Vec<i32>) -> Result<Self, VoxsegError> {
        let expected = size.iter().map(|&s| s as usize).product();
        if labels.len() != expected {
            return Err(VoxsegError::ShapeMismatch {
                expected,
                actual: labels.len(),
            });
        }
        Ok(Self { size, labels })
    }

    /// A grid where every voxel carries `label`.
    pub fn filled(size: [u32; 3], label: i32) -> Self {
        let len = size.iter().map(|&s| s as usize).product();
        Self {
            size,
            labels: vec![label; len],
        }
    }

    /// `[size_x, size_y, size_z]`.
    pub fn size(&self) -> [u32; 3] {
        self.size
    }

    pub fn labels(&self) -> &[i32] {
        &self.labels
    }

    /// Flat index of voxel `(x, y, z)`.
    pub fn index(&self, x: u32, y: u32, z: u32) -> Option<usize> {
        let [sx, sy, sz] = self.size;
        if x >= sx || y >= sy || z >= sz {
            return None;
        }
        Some((x as usize * sy as usize + y as usize) * sz as usize + z as usize)
    }

    pub fn get(&self, x: u32, y: u32, z: u32) -> Option<i32> {
        self.index(x, y, z).map(|i| self.labels[i])
    }

    pub fn set(&mut self, x: u32, y: u32, z: u32, label: i32) -> bool {
        match self.index(x, y, z) {
            Some(i) => {
                self.labels[i] = label;
                true
            }
            None => false,
        }
    }
}

/// Answer to one compute request.
#[derive(Debug, Clone, PartialEq)]
pub struct VoxelGridResult {
    pub labels: LabelGrid,
    /// World position of voxel `(0, 0, 0)`.
    pub origin: [f32; 3],
    /// Per-axis voxel edge length.
    pub resolution: [f32; 3],
}

/// Serialised voxel grid returned to compute-request callers.
///
/// `data` holds one [`encode_label`]ed byte per voxel in the same
/// x-major / z-fastest order as [`LabelGrid`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoxelGridMsg {
    pub data: Vec<u8>,
    pub origin: [f32; 3],
    pub resolutions: [f32; 3],
    pub size_x: u32,
    pub size_y: u32,
    pub size_z: u32,
}

impl VoxelGridMsg {
    /// Recover the signed label grid.
    pub fn decode_labels(&self) -> Result<LabelGrid, VoxsegError> {
        LabelGrid::new(
            [self.size_x, self.size_y, self.size_z],
            self.data.iter().copied().map(decode_label).collect(),
        )
    }
}

impl From<&VoxelGridResult> for VoxelGridMsg {
    fn from(result: &VoxelGridResult) -> Self {
        let [size_x, size_y, size_z] = result.labels.size();
        Self {
            data: result.labels.labels().iter().copied().map(encode_label).collect(),
            origin: result.origin,
            resolutions: result.resolution,
            size_x,
            size_y,
            size_z,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_codec_roundtrips_full_range() {
        for label in -1..=254 {
            assert_eq!(decode_label(encode_label(label)), label, "label {label}");
        }
        assert_eq!(encode_label(UNKNOWN_LABEL), 0);
    }

    #[test]
    fn label_codec_clamps_out_of_range() {
        assert_eq!(encode_label(-7), 0);
        assert_eq!(encode_label(255), 255);
        assert_eq!(encode_label(i32::MAX), 255);
    }

    #[test]
    fn label_grid_is_z_fastest() {
        let grid = LabelGrid::new([2, 3, 4], (0..24).collect()).unwrap();
        assert_eq!(grid.get(0, 0, 1), Some(1));
        assert_eq!(grid.get(0, 1, 0), Some(4));
        assert_eq!(grid.get(1, 0, 0), Some(12));
        assert_eq!(grid.get(1, 2, 3), Some(23));
        assert_eq!(grid.get(2, 0, 0), None);
    }

    #[test]
    fn label_grid_rejects_wrong_length() {
        let err = LabelGrid::new([2, 2, 2], vec![0; 7]).unwrap_err();
        assert_eq!(
            err,
            VoxsegError::ShapeMismatch {
                expected: 8,
                actual: 7
            }
        );
    }

    #[test]
    fn voxel_grid_msg_encodes_and_decodes_grid() {
        let mut labels = LabelGrid::filled([2, 1, 2], UNKNOWN_LABEL);
        labels.set(1, 0, 1, 3);
        let result = VoxelGridResult {
            labels: labels.clone(),
            origin: [0.0, -1.0, 0.5],
            resolution: [0.1, 0.1, 0.2],
        };
        let msg = VoxelGridMsg::from(&result);
        assert_eq!(msg.data, vec![0, 0, 0, 4]);
        assert_eq!((msg.size_x, msg.size_y, msg.size_z), (2, 1, 2));
        assert_eq!(msg.resolutions, [0.1, 0.1, 0.2]);
        assert_eq!(msg.decode_labels().unwrap(), labels);
    }

    #[test]
    fn voxel_grid_msg_json_field_names() {
        let msg = VoxelGridMsg {
            data: vec![1, 2],
            origin: [0.0; 3],
            resolutions: [1.0; 3],
            size_x: 2,
            size_y: 1,
            size_z: 1,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["size_x"], 2);
        assert!(json.get("resolutions").is_some());
    }

    #[test]
    fn class_update_selects_one_representation() {
        let mut prompts = BTreeMap::new();
        prompts.insert("chair".to_string(), vec!["a wooden chair".to_string()]);
        let update = ClassUpdate {
            classes: vec!["table".to_string(), "floor".to_string()],
            prompts: prompts.clone(),
            use_prompts: true,
        };
        assert_eq!(update.into_vocabulary(), Some(Vocabulary::Prompts(prompts)));

        let update = ClassUpdate {
            classes: vec!["table".to_string()],
            prompts: BTreeMap::new(),
            use_prompts: false,
        };
        assert_eq!(
            update.into_vocabulary(),
            Some(Vocabulary::Classes(vec!["table".to_string()]))
        );
    }

    #[test]
    fn class_update_with_empty_selected_side_is_unset() {
        let update = ClassUpdate {
            classes: vec!["table".to_string()],
            prompts: BTreeMap::new(),
            use_prompts: true,
        };
        assert_eq!(update.into_vocabulary(), None);
        assert_eq!(ClassUpdate::default().into_vocabulary(), None);
    }

    #[test]
    fn class_update_deserialises_with_missing_fields() {
        let update: ClassUpdate = serde_json::from_str(r#"{"classes": ["wall"]}"#).unwrap();
        assert!(!update.use_prompts);
        assert!(update.prompts.is_empty());
    }

    #[test]
    fn matrix_compose_applies_right_operand_first() {
        let mut shift = TransformationMatrix::identity();
        shift.m[0][3] = 1.0;
        // 90° about z.
        let rot = TransformationMatrix::new([
            [0.0, -1.0, 0.0, 0.0],
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ]);
        // Shift then rotate: (0,0,0) → (1,0,0) → (0,1,0).
        let p = rot.compose(&shift).transform_point([0.0, 0.0, 0.0]);
        assert!((p[0]).abs() < 1e-6 && (p[1] - 1.0).abs() < 1e-6);
        // Rotate then shift: (0,0,0) → (0,0,0) → (1,0,0).
        let p = (shift * rot).transform_point([0.0, 0.0, 0.0]);
        assert!((p[0] - 1.0).abs() < 1e-6 && p[1].abs() < 1e-6);
    }

    #[test]
    fn matrix_row_major_roundtrip_and_validation() {
        let values: Vec<f32> = (0..16).map(|v| v as f32).collect();
        let m = TransformationMatrix::from_row_major(&values).unwrap();
        assert_eq!(m.m[1][2], 6.0);
        assert_eq!(m.translation(), [3.0, 7.0, 11.0]);
        assert_eq!(m.to_row_major().to_vec(), values);
        assert!(TransformationMatrix::from_row_major(&values[..12]).is_err());
    }

    #[test]
    fn images_validate_buffer_length() {
        assert!(RgbImage::new(2, 2, vec![0; 12]).is_ok());
        assert!(RgbImage::new(2, 2, vec![0; 11]).is_err());
        let depth = DepthImage::new(2, 1, vec![0.5, 1.5]).unwrap();
        assert_eq!(depth.depth(1, 0), Some(1.5));
        assert_eq!(depth.depth(2, 0), None);
    }

    #[test]
    fn error_display() {
        assert!(VoxsegError::NoVocabularyConfigured
            .to_string()
            .contains("No vocabulary"));
        let err = VoxsegError::DegeneratePose { norm: 0.0 };
        assert!(err.to_string().contains("Degenerate pose"));
    }
}
