//! Batch Accumulator.
//!
//! Buffers synchronized [`Frame`]s until they are handed to the
//! reconstruction engine as one world update.
//!
//! With a `batch_size` set, [`BatchAccumulator::append`] flushes on its own
//! once that many frames are pending and returns the batch to the caller.
//! Without one ("manual mode") frames accumulate until
//! [`BatchAccumulator::flush`] is called.
//!
//! # Example
//!
//! ```rust
//! use std::num::NonZeroUsize;
//! use voxseg_perception::batch::BatchAccumulator;
//!
//! let mut acc = BatchAccumulator::new(NonZeroUsize::new(2));
//! assert!(acc.flush().is_none());
//! assert_eq!(acc.pending(), 0);
//! ```

use std::num::NonZeroUsize;

use voxseg_types::{DepthImage, Frame, RgbImage, TransformationMatrix};

/// Flushed frames split into the engine's update inputs.
///
/// The three vectors are index-aligned and in append order.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchTensors {
    pub images: Vec<RgbImage>,
    pub depths: Vec<DepthImage>,
    pub camera_locations: Vec<TransformationMatrix>,
}

impl BatchTensors {
    fn from_frames(frames: Vec<Frame>) -> Self {
        let mut images = Vec::with_capacity(frames.len());
        let mut depths = Vec::with_capacity(frames.len());
        let mut camera_locations = Vec::with_capacity(frames.len());
        for frame in frames {
            let (rgb, depth, extrinsics) = frame.into_parts();
            images.push(rgb);
            depths.push(depth);
            camera_locations.push(extrinsics);
        }
        Self {
            images,
            depths,
            camera_locations,
        }
    }

    /// Number of frames in the batch.
    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

/// FIFO buffer of frames awaiting a world update.
#[derive(Debug, Default)]
pub struct BatchAccumulator {
    frames: Vec<Frame>,
    batch_size: Option<NonZeroUsize>,
}

impl BatchAccumulator {
    /// `batch_size = None` selects manual mode.
    pub fn new(batch_size: Option<NonZeroUsize>) -> Self {
        Self {
            frames: Vec::new(),
            batch_size,
        }
    }

    pub fn batch_size(&self) -> Option<NonZeroUsize> {
        self.batch_size
    }

    /// Frames appended since the last flush or reset.
    pub fn pending(&self) -> usize {
        self.frames.len()
    }

    /// Add a frame.
    ///
    /// Returns the whole pending batch when this append reaches
    /// `batch_size`; the accumulator is then empty again.
    pub fn append(&mut self, frame: Frame) -> Option<BatchTensors> {
        self.frames.push(frame);
        match self.batch_size {
            Some(size) if self.frames.len() >= size.get() => self.flush(),
            _ => None,
        }
    }

    /// Take every pending frame, or `None` when nothing is pending.
    pub fn flush(&mut self) -> Option<BatchTensors> {
        if self.frames.is_empty() {
            return None;
        }
        Some(BatchTensors::from_frames(std::mem::take(&mut self.frames)))
    }

    /// Discard pending frames without producing a batch.
    pub fn reset(&mut self) {
        self.frames.clear();
    }
}
