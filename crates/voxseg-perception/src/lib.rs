//! `voxseg-perception` – turns independent sensor streams into batches.
//!
//! # Modules
//!
//! - [`transform`] – Pose Resolver: [`resolve`][transform::resolve] turns a
//!   translation + quaternion [`Pose`][transform::Pose] into a 4×4
//!   [`TransformationMatrix`][voxseg_types::TransformationMatrix].
//! - [`decode`] – [`ImageDecoder`][decode::ImageDecoder] contract and the
//!   [`PassthroughDecoder`][decode::PassthroughDecoder] for raw ROS encodings.
//! - [`sync`] – [`FrameSynchronizer`][sync::FrameSynchronizer]: approximate
//!   time matching of RGB, depth and pose channels into
//!   [`Frame`][voxseg_types::Frame]s.
//! - [`batch`] – [`BatchAccumulator`][batch::BatchAccumulator]: buffers frames
//!   and hands them out as [`BatchTensors`][batch::BatchTensors], either on
//!   demand or every `batch_size` frames.

pub mod batch;
pub mod decode;
pub mod sync;
pub mod transform;

pub use batch::{BatchAccumulator, BatchTensors};
pub use decode::{ImageDecoder, PassthroughDecoder};
pub use sync::{ChannelId, FrameSynchronizer, SensorMessage, SensorPayload, SyncConfig, SyncStats};
pub use transform::{Pose, Quaternion, Vec3, resolve};
