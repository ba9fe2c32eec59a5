//! `voxseg-middleware` – input transport inside the process.
//!
//! Transport adapters (ROS bridges, replay tools, tests) publish decoded
//! sensor messages, class updates, frame bundles and reset signals onto the
//! [`SensorBus`]; the VoxSeg node subscribes to the topics it serves.
//!
//! # Modules
//!
//! - [`bus`] – typed, topic-based publish/subscribe bus built on Tokio
//!   broadcast channels.

pub mod bus;

pub use bus::{BusPayload, Envelope, SensorBus, Topic, TopicReceiver};
