//! `voxseg-server` – the VoxSeg world and the node that serves it.
//!
//! # Modules
//!
//! - [`engine`] – [`ReconstructionEngine`][engine::ReconstructionEngine],
//!   the contract the external 3-D reconstruction fulfils, plus the
//!   [`EmptyWorld`][engine::EmptyWorld] stand-in.
//! - [`server`] – [`VoxelServer`][server::VoxelServer]: batch accumulator,
//!   engine and class registry under one lock. Serves compute requests,
//!   class updates and resets.
//! - [`node`] – [`VoxsegNode`][node::VoxsegNode]: subscribes to the
//!   [`SensorBus`][voxseg_middleware::SensorBus], runs the frame
//!   synchronizer and answers [`ComputeClient`][node::ComputeClient]
//!   requests.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing] with optional
//!   OTLP export.

pub mod engine;
pub mod node;
pub mod server;
pub mod telemetry;

pub use engine::{EmptyWorld, ReconstructionEngine};
pub use node::{ComputeClient, NodeConfig, VoxsegNode};
pub use server::{DEFAULT_MIN_POINTS_IN_VOXEL, IngestOutcome, ServerConfig, VoxelServer};
pub use telemetry::{TracerProviderGuard, init_tracing};
