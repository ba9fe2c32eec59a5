//! Reconstruction engine contract.
//!
//! The volumetric update and voxel classification live outside this
//! workspace; VoxSeg only drives them through [`ReconstructionEngine`].

use tracing::debug;
use voxseg_perception::BatchTensors;
use voxseg_types::{LabelGrid, UNKNOWN_LABEL, VoxsegError, Vocabulary};

/// A 3-D semantic reconstruction that can be updated and queried.
///
/// All calls are made while the world lock is held, so implementations
/// never see concurrent access.
pub trait ReconstructionEngine: Send {
    /// Integrate a batch of frames into the world.
    fn apply_update(&mut self, batch: BatchTensors);

    /// Label every voxel with an index into `vocabulary`, or
    /// [`UNKNOWN_LABEL`] where no class applies.
    ///
    /// Voxels observed by fewer than `min_points_per_voxel` points should be
    /// reported as unknown.
    fn query(
        &mut self,
        vocabulary: &Vocabulary,
        min_points_per_voxel: u32,
    ) -> Result<LabelGrid, VoxsegError>;

    /// World position of voxel `(0, 0, 0)`.
    fn origin(&self) -> [f32; 3];

    /// Per-axis voxel size.
    fn resolution(&self) -> [f32; 3];

    /// Return to the empty initial state.
    fn reset(&mut self);
}

/// Stand-in engine with a fixed grid that never classifies anything.
///
/// Lets the node run end to end (ingestion, batching, requests) before a
/// real reconstruction backend is linked.
#[derive(Debug, Clone)]
pub struct EmptyWorld {
    grid_size: [u32; 3],
    origin: [f32; 3],
    resolution: [f32; 3],
    updates: usize,
    frames: usize,
}

impl EmptyWorld {
    pub fn new(grid_size: [u32; 3], origin: [f32; 3], resolution: [f32; 3]) -> Self {
        Self {
            grid_size,
            origin,
            resolution,
            updates: 0,
            frames: 0,
        }
    }

    /// World updates applied since the last reset.
    pub fn updates(&self) -> usize {
        self.updates
    }

    /// Frames integrated since the last reset.
    pub fn frames(&self) -> usize {
        self.frames
    }
}

impl ReconstructionEngine for EmptyWorld {
    fn apply_update(&mut self, batch: BatchTensors) {
        self.updates += 1;
        self.frames += batch.len();
        debug!(frames = batch.len(), total = self.frames, "empty world updated");
    }

    fn query(
        &mut self,
        _vocabulary: &Vocabulary,
        _min_points_per_voxel: u32,
    ) -> Result<LabelGrid, VoxsegError> {
        Ok(LabelGrid::filled(self.grid_size, UNKNOWN_LABEL))
    }

    fn origin(&self) -> [f32; 3] {
        self.origin
    }

    fn resolution(&self) -> [f32; 3] {
        self.resolution
    }

    fn reset(&mut self) {
        self.updates = 0;
        self.frames = 0;
    }
}
