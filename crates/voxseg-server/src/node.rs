//! [`VoxsegNode`] – wires the [`SensorBus`] and compute requests to the
//! synchronizer and the [`VoxelServer`].
//!
//! One Tokio task per input topic pulls messages off the bus in order:
//!
//! | Task | Input | Action |
//! |---|---|---|
//! | sensor | [`Topic::Sensor`] | synchronizer → `ingest` |
//! | bundle | [`Topic::FrameBundle`] | decode → `ingest` |
//! | classes | [`Topic::Classes`] | `update_classes` |
//! | reset | [`Topic::Reset`] | `reset` |
//! | compute | [`ComputeClient`] requests | `handle_request` → reply |
//!
//! Anything that takes the synchronizer or world lock runs on
//! `spawn_blocking`, so a long engine update never stalls the reactor. The
//! synchronizer lock is released before the world lock is taken: matching a
//! new frame does not wait for a compute request.
//!
//! # Example
//!
//! ```rust,no_run
//! use voxseg_middleware::SensorBus;
//! use voxseg_perception::PassthroughDecoder;
//! use voxseg_server::engine::EmptyWorld;
//! use voxseg_server::node::{NodeConfig, VoxsegNode};
//!
//! # async fn run() -> Result<(), voxseg_types::VoxsegError> {
//! let bus = SensorBus::default();
//! let world = EmptyWorld::new([64, 64, 32], [0.0; 3], [0.05; 3]);
//! let (node, client) = VoxsegNode::spawn(NodeConfig::default(), world, PassthroughDecoder, &bus)?;
//! let grid = client.request().await?;
//! node.shutdown();
//! # Ok(())
//! # }
//! ```

use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use voxseg_middleware::{BusPayload, Envelope, SensorBus, Topic, TopicReceiver};
use voxseg_perception::{FrameSynchronizer, ImageDecoder, SensorMessage, SyncConfig, SyncStats};
use voxseg_types::{Frame, FrameBundle, TransformationMatrix, VoxelGridMsg, VoxsegError};

use crate::engine::ReconstructionEngine;
use crate::server::{IngestOutcome, ServerConfig, VoxelServer};

/// Default number of compute requests that may wait for the world lock.
const DEFAULT_REQUEST_QUEUE: usize = 16;

type Reply = oneshot::Sender<Result<VoxelGridMsg, VoxsegError>>;

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Configuration bundle for [`VoxsegNode`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NodeConfig {
    pub server: ServerConfig,
    pub sync: SyncConfig,
    /// Capacity of the compute-request queue.
    pub request_queue: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            sync: SyncConfig::default(),
            request_queue: DEFAULT_REQUEST_QUEUE,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ComputeClient
// ─────────────────────────────────────────────────────────────────────────────

/// Cheap, cloneable handle for issuing compute requests.
#[derive(Clone, Debug)]
pub struct ComputeClient {
    tx: mpsc::Sender<Reply>,
}

impl ComputeClient {
    /// Ask for the current voxel grid and wait for the answer.
    ///
    /// There is no internal timeout; wrap the call in
    /// `tokio::time::timeout` if the caller needs one.
    ///
    /// # Errors
    ///
    /// [`VoxsegError::ServiceUnavailable`] once the node has shut down, or
    /// the error produced while serving the request.
    pub async fn request(&self) -> Result<VoxelGridMsg, VoxsegError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(reply_tx)
            .await
            .map_err(|_| VoxsegError::ServiceUnavailable)?;
        reply_rx.await.map_err(|_| VoxsegError::ServiceUnavailable)?
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// VoxsegNode
// ─────────────────────────────────────────────────────────────────────────────

/// The running ingestion/query node.
pub struct VoxsegNode<E, D> {
    server: VoxelServer<E>,
    synchronizer: Arc<Mutex<FrameSynchronizer<D>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl<E, D> VoxsegNode<E, D>
where
    E: ReconstructionEngine + 'static,
    D: ImageDecoder + Clone + 'static,
{
    /// Subscribe to `bus` and start serving.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// [`VoxsegError::InvalidConfig`] if the synchronizer settings are
    /// rejected.
    pub fn spawn(
        config: NodeConfig,
        engine: E,
        decoder: D,
        bus: &SensorBus,
    ) -> Result<(Self, ComputeClient), VoxsegError> {
        let synchronizer = Arc::new(Mutex::new(FrameSynchronizer::new(
            config.sync,
            decoder.clone(),
        )?));
        let server = VoxelServer::new(config.server, engine);
        let (tx, rx) = mpsc::channel(config.request_queue.max(1));

        let tasks = vec![
            tokio::spawn(sensor_loop(
                bus.subscribe_to(Topic::Sensor),
                Arc::clone(&synchronizer),
                server.clone(),
            )),
            tokio::spawn(bundle_loop(
                bus.subscribe_to(Topic::FrameBundle),
                decoder,
                server.clone(),
            )),
            tokio::spawn(classes_loop(bus.subscribe_to(Topic::Classes), server.clone())),
            tokio::spawn(reset_loop(bus.subscribe_to(Topic::Reset), server.clone())),
            tokio::spawn(compute_loop(rx, server.clone())),
        ];

        info!(
            batch_size = ?config.server.batch_size,
            slop = config.sync.slop,
            pose_channels = config.sync.pose_channels,
            "voxseg node started"
        );

        Ok((
            Self {
                server,
                synchronizer,
                tasks,
            },
            ComputeClient { tx },
        ))
    }

    /// Handle to the world aggregate.
    pub fn server(&self) -> &VoxelServer<E> {
        &self.server
    }

    pub fn sync_stats(&self) -> SyncStats {
        match self.synchronizer.lock() {
            Ok(sync) => sync.stats(),
            Err(poisoned) => poisoned.into_inner().stats(),
        }
    }

    /// Stop every task. Requests already waiting get
    /// [`VoxsegError::ServiceUnavailable`].
    pub fn shutdown(self) {
        for task in &self.tasks {
            task.abort();
        }
        info!("voxseg node stopped");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Task bodies
// ─────────────────────────────────────────────────────────────────────────────

/// Run `f` on the blocking pool; a panic is logged and yields `None`.
async fn blocking<R, F>(what: &'static str, f: F) -> Option<R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(r) => Some(r),
        Err(e) => {
            warn!(task = what, error = %e, "blocking task failed");
            None
        }
    }
}

fn log_ingest(source: &str, outcome: IngestOutcome) {
    match outcome {
        IngestOutcome::Buffered { pending } => debug!(source, pending, "frame buffered"),
        IngestOutcome::Flushed { frames } => debug!(source, frames, "frame completed a batch"),
    }
}

fn synchronize<E, D>(
    synchronizer: &Mutex<FrameSynchronizer<D>>,
    server: &VoxelServer<E>,
    source: &str,
    msg: SensorMessage,
) where
    E: ReconstructionEngine,
    D: ImageDecoder,
{
    let channel = msg.channel();
    let stamp = msg.stamp;
    let matched = {
        let mut sync = match synchronizer.lock() {
            Ok(sync) => sync,
            Err(poisoned) => poisoned.into_inner(),
        };
        sync.push(msg)
    };
    match matched {
        Ok(Some(frame)) => log_ingest(source, server.ingest(frame)),
        Ok(None) => {}
        Err(e) => warn!(source, ?channel, stamp, error = %e, "sensor message discarded"),
    }
}

async fn sensor_loop<E, D>(
    mut rx: TopicReceiver,
    synchronizer: Arc<Mutex<FrameSynchronizer<D>>>,
    server: VoxelServer<E>,
) where
    E: ReconstructionEngine + 'static,
    D: ImageDecoder + 'static,
{
    while let Some(Envelope {
        source, payload, ..
    }) = rx.recv().await
    {
        let BusPayload::Sensor(msg) = payload else {
            continue;
        };
        let synchronizer = Arc::clone(&synchronizer);
        let server = server.clone();
        blocking("sensor", move || {
            synchronize(&synchronizer, &server, &source, msg)
        })
        .await;
    }
    debug!("sensor topic closed");
}

fn bundle_to_frame<D: ImageDecoder>(
    decoder: &D,
    bundle: &FrameBundle,
) -> Result<Frame, VoxsegError> {
    let extrinsics = TransformationMatrix::from_row_major(&bundle.cam_extrinsics)?;
    let rgb = decoder.decode_rgb(&bundle.rgb_image)?;
    let depth = decoder.decode_depth(&bundle.depth_image)?;
    Ok(Frame::new(rgb, depth, extrinsics))
}

async fn bundle_loop<E, D>(mut rx: TopicReceiver, decoder: D, server: VoxelServer<E>)
where
    E: ReconstructionEngine + 'static,
    D: ImageDecoder + Clone + 'static,
{
    while let Some(Envelope {
        source, payload, ..
    }) = rx.recv().await
    {
        let BusPayload::FrameBundle(bundle) = payload else {
            continue;
        };
        let decoder = decoder.clone();
        let server = server.clone();
        blocking("bundle", move || match bundle_to_frame(&decoder, &bundle) {
            Ok(frame) => log_ingest(&source, server.ingest(frame)),
            Err(e) => warn!(source, error = %e, "frame bundle discarded"),
        })
        .await;
    }
    debug!("frame bundle topic closed");
}

async fn classes_loop<E>(mut rx: TopicReceiver, server: VoxelServer<E>)
where
    E: ReconstructionEngine + 'static,
{
    while let Some(envelope) = rx.recv().await {
        let BusPayload::Classes(update) = envelope.payload else {
            continue;
        };
        let server = server.clone();
        blocking("classes", move || server.update_classes(update)).await;
    }
    debug!("classes topic closed");
}

async fn reset_loop<E>(mut rx: TopicReceiver, server: VoxelServer<E>)
where
    E: ReconstructionEngine + 'static,
{
    while let Some(envelope) = rx.recv().await {
        if !matches!(envelope.payload, BusPayload::Reset) {
            continue;
        }
        debug!(source = %envelope.source, id = %envelope.id, "reset requested");
        let server = server.clone();
        blocking("reset", move || server.reset()).await;
    }
    debug!("reset topic closed");
}

async fn compute_loop<E>(mut rx: mpsc::Receiver<Reply>, server: VoxelServer<E>)
where
    E: ReconstructionEngine + 'static,
{
    while let Some(reply) = rx.recv().await {
        let server = server.clone();
        let result = blocking("compute", move || server.handle_request())
            .await
            .unwrap_or_else(|| Err(VoxsegError::Engine("compute request panicked".to_string())));
        if reply.send(result).is_err() {
            debug!("compute requester went away before the reply");
        }
    }
    debug!("compute request queue closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::num::NonZeroUsize;
    use std::time::Duration;
    use voxseg_perception::{PassthroughDecoder, Pose, Quaternion, Vec3};
    use voxseg_types::{ClassUpdate, RawImage};

    use crate::engine::EmptyWorld;

    fn rgb_raw() -> RawImage {
        RawImage {
            width: 1,
            height: 1,
            encoding: "bgr8".to_string(),
            data: vec![1, 2, 3],
        }
    }

    fn depth_raw() -> RawImage {
        RawImage {
            width: 1,
            height: 1,
            encoding: "32FC1".to_string(),
            data: 1.5f32.to_le_bytes().to_vec(),
        }
    }

    fn world() -> EmptyWorld {
        EmptyWorld::new([2, 2, 1], [0.0; 3], [0.25; 3])
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    fn publish(bus: &SensorBus, payload: BusPayload) {
        bus.publish_payload("test", payload).expect("node subscribed");
    }

    #[tokio::test]
    async fn synchronized_frames_reach_the_world_on_request() {
        let bus = SensorBus::default();
        let config = NodeConfig {
            sync: SyncConfig {
                pose_channels: 1,
                ..SyncConfig::default()
            },
            ..NodeConfig::default()
        };
        let (node, client) = VoxsegNode::spawn(config, world(), PassthroughDecoder, &bus).unwrap();

        publish(&bus, BusPayload::Sensor(SensorMessage::rgb(1.00, rgb_raw())));
        publish(&bus, BusPayload::Sensor(SensorMessage::depth(1.04, depth_raw())));
        publish(
            &bus,
            BusPayload::Sensor(SensorMessage::pose(
                1.02,
                0,
                Pose::new(Vec3::new(0.0, 0.0, 1.0), Quaternion::identity()),
            )),
        );
        publish(
            &bus,
            BusPayload::Classes(ClassUpdate {
                classes: vec!["chair".to_string()],
                ..Default::default()
            }),
        );

        wait_for(|| node.server().pending_frames() == 1 && node.server().vocabulary().is_some())
            .await;

        let grid = client.request().await.unwrap();
        assert_eq!(grid.data, vec![0; 4]);
        assert_eq!(grid.resolutions, [0.25; 3]);
        assert_eq!(node.server().with_engine(|w| w.frames()), 1);
        assert_eq!(node.sync_stats().matched, 1);
        node.shutdown();
    }

    #[tokio::test]
    async fn request_without_vocabulary_is_reported_to_caller() {
        let bus = SensorBus::default();
        let (node, client) =
            VoxsegNode::spawn(NodeConfig::default(), world(), PassthroughDecoder, &bus).unwrap();
        assert_eq!(
            client.request().await.unwrap_err(),
            VoxsegError::NoVocabularyConfigured
        );
        node.shutdown();
    }

    #[tokio::test]
    async fn bundles_bypass_the_synchronizer_and_auto_flush() {
        let bus = SensorBus::default();
        let config = NodeConfig {
            server: ServerConfig {
                batch_size: NonZeroUsize::new(2),
                ..ServerConfig::default()
            },
            ..NodeConfig::default()
        };
        let (node, _client) = VoxsegNode::spawn(config, world(), PassthroughDecoder, &bus).unwrap();

        let bundle = FrameBundle {
            rgb_image: rgb_raw(),
            depth_image: depth_raw(),
            cam_extrinsics: TransformationMatrix::identity().to_row_major().to_vec(),
        };
        let broken = FrameBundle {
            cam_extrinsics: vec![1.0; 9],
            ..bundle.clone()
        };
        publish(&bus, BusPayload::FrameBundle(Box::new(bundle.clone())));
        publish(&bus, BusPayload::FrameBundle(Box::new(broken)));
        publish(&bus, BusPayload::FrameBundle(Box::new(bundle)));

        wait_for(|| node.server().with_engine(|w| w.updates()) == 1).await;
        assert_eq!(node.server().with_engine(|w| w.frames()), 2);
        assert_eq!(node.server().pending_frames(), 0);
        node.shutdown();
    }

    #[tokio::test]
    async fn reset_signal_clears_world_and_vocabulary() {
        let bus = SensorBus::default();
        let (node, client) =
            VoxsegNode::spawn(NodeConfig::default(), world(), PassthroughDecoder, &bus).unwrap();

        publish(
            &bus,
            BusPayload::Classes(ClassUpdate {
                classes: vec!["table".to_string()],
                ..Default::default()
            }),
        );
        publish(&bus, BusPayload::Sensor(SensorMessage::rgb(2.0, rgb_raw())));
        publish(&bus, BusPayload::Sensor(SensorMessage::depth(2.0, depth_raw())));
        wait_for(|| node.server().pending_frames() == 1 && node.server().vocabulary().is_some())
            .await;

        publish(&bus, BusPayload::Reset);
        wait_for(|| node.server().vocabulary().is_none()).await;

        assert_eq!(node.server().pending_frames(), 0);
        assert_eq!(
            client.request().await.unwrap_err(),
            VoxsegError::NoVocabularyConfigured
        );
        assert_eq!(node.server().with_engine(|w| w.updates()), 0);
        node.shutdown();
    }

    #[tokio::test]
    async fn client_errors_after_shutdown() {
        let bus = SensorBus::default();
        let (node, client) =
            VoxsegNode::spawn(NodeConfig::default(), world(), PassthroughDecoder, &bus).unwrap();
        node.shutdown();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            client.request().await.unwrap_err(),
            VoxsegError::ServiceUnavailable
        );
    }

    #[test]
    fn invalid_sync_config_fails_to_spawn() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let bus = SensorBus::default();
            let config = NodeConfig {
                sync: SyncConfig {
                    queue_size: 0,
                    ..SyncConfig::default()
                },
                ..NodeConfig::default()
            };
            let result = VoxsegNode::spawn(config, world(), PassthroughDecoder, &bus);
            assert!(matches!(result, Err(VoxsegError::InvalidConfig(_))));
        });
    }
}
