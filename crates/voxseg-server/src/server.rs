//! [`VoxelServer`] – the world aggregate and everything that touches it.
//!
//! The batch accumulator, the reconstruction engine and the class registry
//! live together in one [`WorldState`] behind a single mutex. Every
//! operation on them takes that lock for its whole duration:
//!
//! - **ingest** – append a synchronized frame; an automatic flush at
//!   `batch_size` applies the batch to the engine before the lock is
//!   released.
//! - **compute request** – Flushing → Querying → Encoding. Pending frames
//!   are applied first so a request never observes a world that omits
//!   ingested frames, then the engine is queried with the registry's
//!   vocabulary and the labels are encoded for the wire.
//! - **class update** – replaces the registry wholesale.
//! - **reset** – clears accumulator, registry and engine atomically.
//!
//! Because all four serialize on the same lock, a request racing an
//! automatic flush or a reset sees the world either fully before or fully
//! after it.
//!
//! # Example
//!
//! ```rust
//! use voxseg_server::engine::EmptyWorld;
//! use voxseg_server::server::{ServerConfig, VoxelServer};
//! use voxseg_types::{ClassUpdate, VoxsegError};
//!
//! let server = VoxelServer::new(ServerConfig::default(), EmptyWorld::new([2, 2, 2], [0.0; 3], [0.1; 3]));
//! assert_eq!(server.handle_request().unwrap_err(), VoxsegError::NoVocabularyConfigured);
//!
//! server.update_classes(ClassUpdate { classes: vec!["chair".into()], ..Default::default() });
//! let grid = server.handle_request().unwrap();
//! assert_eq!(grid.data, vec![0; 8]);
//! ```

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, info_span, warn};
use voxseg_perception::BatchAccumulator;
use voxseg_types::{ClassUpdate, Frame, Vocabulary, VoxelGridMsg, VoxelGridResult, VoxsegError};

use crate::engine::ReconstructionEngine;

/// Default minimum number of points a voxel needs before it is classified.
pub const DEFAULT_MIN_POINTS_IN_VOXEL: u32 = 3;

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Configuration bundle for [`VoxelServer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerConfig {
    /// Frames per automatic world update; `None` flushes only on request.
    pub batch_size: Option<NonZeroUsize>,
    /// Passed to every engine query to suppress single-observation voxels.
    pub min_points_in_voxel: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            batch_size: None,
            min_points_in_voxel: DEFAULT_MIN_POINTS_IN_VOXEL,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// State
// ─────────────────────────────────────────────────────────────────────────────

/// Where a compute request currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPhase {
    Idle,
    Flushing,
    Querying,
    Encoding,
}

/// Result of handing one frame to [`VoxelServer::ingest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// The frame is waiting in the accumulator.
    Buffered { pending: usize },
    /// The frame completed a batch which was applied to the engine.
    Flushed { frames: usize },
}

struct WorldState<E> {
    accumulator: BatchAccumulator,
    engine: E,
    /// `None` until a usable class update arrives, and again after reset.
    vocabulary: Option<Vocabulary>,
    phase: RequestPhase,
}

impl<E: ReconstructionEngine> WorldState<E> {
    fn enter(&mut self, phase: RequestPhase) {
        debug!(from = ?self.phase, to = ?phase, "compute request phase");
        self.phase = phase;
    }

    fn run_request(&mut self, min_points: u32) -> Result<VoxelGridMsg, VoxsegError> {
        self.enter(RequestPhase::Flushing);
        if let Some(batch) = self.accumulator.flush() {
            info!(frames = batch.len(), "flushing pending frames before query");
            self.engine.apply_update(batch);
        }

        self.enter(RequestPhase::Querying);
        let vocabulary = self
            .vocabulary
            .as_ref()
            .ok_or(VoxsegError::NoVocabularyConfigured)?;
        let labels = self.engine.query(vocabulary, min_points)?;

        self.enter(RequestPhase::Encoding);
        let result = VoxelGridResult {
            labels,
            origin: self.engine.origin(),
            resolution: self.engine.resolution(),
        };
        Ok(VoxelGridMsg::from(&result))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// VoxelServer
// ─────────────────────────────────────────────────────────────────────────────

/// Shared handle to the world aggregate. Clones share the same state.
pub struct VoxelServer<E> {
    state: Arc<Mutex<WorldState<E>>>,
    min_points_in_voxel: u32,
}

impl<E> Clone for VoxelServer<E> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            min_points_in_voxel: self.min_points_in_voxel,
        }
    }
}

impl<E: ReconstructionEngine> VoxelServer<E> {
    pub fn new(config: ServerConfig, engine: E) -> Self {
        Self {
            state: Arc::new(Mutex::new(WorldState {
                accumulator: BatchAccumulator::new(config.batch_size),
                engine,
                vocabulary: None,
                phase: RequestPhase::Idle,
            })),
            min_points_in_voxel: config.min_points_in_voxel,
        }
    }

    fn lock(&self) -> MutexGuard<'_, WorldState<E>> {
        // Every operation leaves the state consistent before it can panic
        // inside the engine, so a poisoned lock is still usable.
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => {
                warn!("world lock poisoned by a panicked operation; recovering");
                self.state.clear_poison();
                let mut state = poisoned.into_inner();
                state.phase = RequestPhase::Idle;
                state
            }
        }
    }

    /// Append a synchronized frame, applying a full batch to the engine when
    /// `batch_size` is reached.
    pub fn ingest(&self, frame: Frame) -> IngestOutcome {
        let mut state = self.lock();
        match state.accumulator.append(frame) {
            Some(batch) => {
                let frames = batch.len();
                info!(frames, "batch size reached; updating world");
                state.engine.apply_update(batch);
                IngestOutcome::Flushed { frames }
            }
            None => IngestOutcome::Buffered {
                pending: state.accumulator.pending(),
            },
        }
    }

    /// Flush, query and encode the current world.
    ///
    /// # Errors
    ///
    /// [`VoxsegError::NoVocabularyConfigured`] when no classes or prompts
    /// are registered (pending frames are still applied), or whatever the
    /// engine's query reports.
    pub fn handle_request(&self) -> Result<VoxelGridMsg, VoxsegError> {
        let span = info_span!("compute_request");
        let _enter = span.enter();

        let mut state = self.lock();
        let result = state.run_request(self.min_points_in_voxel);
        state.enter(RequestPhase::Idle);
        match &result {
            Ok(grid) => info!(
                size_x = grid.size_x,
                size_y = grid.size_y,
                size_z = grid.size_z,
                "compute request served"
            ),
            Err(e) => warn!(error = %e, "compute request failed"),
        }
        result
    }

    /// Replace the registry with the representation selected by
    /// `update.use_prompts`.
    ///
    /// An update whose selected side is empty leaves the registry unset.
    pub fn update_classes(&self, update: ClassUpdate) {
        let use_prompts = update.use_prompts;
        let vocabulary = update.into_vocabulary();
        match &vocabulary {
            Some(v) => info!(use_prompts, entries = v.len(), "vocabulary replaced"),
            None => warn!(use_prompts, "class update is empty; vocabulary unset"),
        }
        self.lock().vocabulary = vocabulary;
    }

    /// Clear pending frames, the registry and the engine in one step.
    pub fn reset(&self) {
        let mut state = self.lock();
        let dropped = state.accumulator.pending();
        state.accumulator.reset();
        state.vocabulary = None;
        state.engine.reset();
        info!(dropped_frames = dropped, "world has been reset");
    }

    /// Frames waiting for the next flush.
    pub fn pending_frames(&self) -> usize {
        self.lock().accumulator.pending()
    }

    /// Snapshot of the registry.
    pub fn vocabulary(&self) -> Option<Vocabulary> {
        self.lock().vocabulary.clone()
    }

    /// Run `f` against the engine while holding the world lock.
    pub fn with_engine<R>(&self, f: impl FnOnce(&E) -> R) -> R {
        f(&self.lock().engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::thread;
    use voxseg_perception::BatchTensors;
    use voxseg_types::{DepthImage, LabelGrid, RgbImage, TransformationMatrix, decode_label};

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Update(Vec<u8>),
        Query(Vocabulary, u32),
        Reset,
    }

    /// Records every call; `query` labels voxel `i` with `i - 1`.
    #[derive(Default)]
    struct RecordingEngine {
        calls: Vec<Call>,
    }

    impl RecordingEngine {
        fn applied_frames(&self) -> Vec<u8> {
            self.calls
                .iter()
                .filter_map(|c| match c {
                    Call::Update(tags) => Some(tags.clone()),
                    _ => None,
                })
                .flatten()
                .collect()
        }
    }

    impl ReconstructionEngine for RecordingEngine {
        fn apply_update(&mut self, batch: BatchTensors) {
            self.calls.push(Call::Update(
                batch.images.iter().map(|img| img.data()[0]).collect(),
            ));
        }

        fn query(
            &mut self,
            vocabulary: &Vocabulary,
            min_points_per_voxel: u32,
        ) -> Result<LabelGrid, VoxsegError> {
            self.calls
                .push(Call::Query(vocabulary.clone(), min_points_per_voxel));
            LabelGrid::new([1, 2, 2], vec![-1, 0, 1, 2])
        }

        fn origin(&self) -> [f32; 3] {
            [1.0, 2.0, 3.0]
        }

        fn resolution(&self) -> [f32; 3] {
            [0.1, 0.2, 0.3]
        }

        fn reset(&mut self) {
            self.calls.push(Call::Reset);
        }
    }

    fn frame(tag: u8) -> Frame {
        Frame::new(
            RgbImage::new(1, 1, vec![tag; 3]).unwrap(),
            DepthImage::new(1, 1, vec![1.0]).unwrap(),
            TransformationMatrix::identity(),
        )
    }

    fn classes(names: &[&str]) -> ClassUpdate {
        ClassUpdate {
            classes: names.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn server(batch_size: Option<usize>) -> VoxelServer<RecordingEngine> {
        let config = ServerConfig {
            batch_size: batch_size.and_then(NonZeroUsize::new),
            min_points_in_voxel: 5,
        };
        VoxelServer::new(config, RecordingEngine::default())
    }

    #[test]
    fn request_flushes_pending_frames_before_query() {
        let server = server(None);
        server.update_classes(classes(&["chair"]));
        for tag in 1..=3 {
            assert_eq!(
                server.ingest(frame(tag)),
                IngestOutcome::Buffered {
                    pending: tag as usize
                }
            );
        }

        server.handle_request().unwrap();

        let calls = server.with_engine(|e| e.calls.clone());
        assert_eq!(
            calls,
            vec![
                Call::Update(vec![1, 2, 3]),
                Call::Query(Vocabulary::Classes(vec!["chair".to_string()]), 5),
            ]
        );
        assert_eq!(server.pending_frames(), 0);
    }

    #[test]
    fn request_without_pending_frames_skips_update() {
        let server = server(None);
        server.update_classes(classes(&["chair"]));
        server.handle_request().unwrap();
        let calls = server.with_engine(|e| e.calls.clone());
        assert_eq!(calls.len(), 1);
        assert!(matches!(calls[0], Call::Query(..)));
    }

    #[test]
    fn response_is_offset_and_carries_geometry() {
        let server = server(None);
        server.update_classes(classes(&["a", "b", "c"]));
        let grid = server.handle_request().unwrap();
        assert_eq!(grid.data, vec![0, 1, 2, 3]);
        assert_eq!((grid.size_x, grid.size_y, grid.size_z), (1, 2, 2));
        assert_eq!(grid.origin, [1.0, 2.0, 3.0]);
        assert_eq!(grid.resolutions, [0.1, 0.2, 0.3]);
        assert_eq!(decode_label(grid.data[0]), -1);
    }

    #[test]
    fn request_without_vocabulary_fails_but_applies_frames() {
        let server = server(None);
        server.ingest(frame(9));
        assert_eq!(
            server.handle_request().unwrap_err(),
            VoxsegError::NoVocabularyConfigured
        );
        let calls = server.with_engine(|e| e.calls.clone());
        assert_eq!(calls, vec![Call::Update(vec![9])]);
    }

    #[test]
    fn prompts_are_used_when_selected() {
        let server = server(None);
        let mut prompts = BTreeMap::new();
        prompts.insert("seat".to_string(), vec!["chair".to_string(), "stool".to_string()]);
        server.update_classes(ClassUpdate {
            classes: vec!["ignored".to_string()],
            prompts: prompts.clone(),
            use_prompts: true,
        });
        server.handle_request().unwrap();
        let calls = server.with_engine(|e| e.calls.clone());
        assert_eq!(calls, vec![Call::Query(Vocabulary::Prompts(prompts), 5)]);
    }

    #[test]
    fn class_update_replaces_wholesale() {
        let server = server(None);
        server.update_classes(classes(&["a", "b"]));
        server.update_classes(classes(&["c"]));
        assert_eq!(
            server.vocabulary(),
            Some(Vocabulary::Classes(vec!["c".to_string()]))
        );
        server.update_classes(ClassUpdate::default());
        assert_eq!(server.vocabulary(), None);
    }

    #[test]
    fn auto_flush_applies_batch_on_ingest() {
        let server = server(Some(2));
        assert_eq!(server.ingest(frame(1)), IngestOutcome::Buffered { pending: 1 });
        assert_eq!(server.ingest(frame(2)), IngestOutcome::Flushed { frames: 2 });
        assert_eq!(server.pending_frames(), 0);
        let calls = server.with_engine(|e| e.calls.clone());
        assert_eq!(calls, vec![Call::Update(vec![1, 2])]);
    }

    #[test]
    fn reset_clears_everything() {
        let server = server(Some(10));
        server.update_classes(classes(&["chair"]));
        server.ingest(frame(1));
        server.ingest(frame(2));

        server.reset();

        assert_eq!(server.pending_frames(), 0);
        assert_eq!(server.vocabulary(), None);
        assert_eq!(
            server.handle_request().unwrap_err(),
            VoxsegError::NoVocabularyConfigured
        );
        let calls = server.with_engine(|e| e.calls.clone());
        assert_eq!(calls, vec![Call::Reset]);
    }

    #[test]
    fn concurrent_requests_and_auto_flushes_apply_each_frame_once() {
        const FRAMES: u8 = 60;
        let server = server(Some(4));
        server.update_classes(classes(&["chair"]));

        let ingest = {
            let server = server.clone();
            thread::spawn(move || {
                for tag in 0..FRAMES {
                    server.ingest(frame(tag));
                }
            })
        };
        let requests: Vec<_> = (0..3)
            .map(|_| {
                let server = server.clone();
                thread::spawn(move || {
                    for _ in 0..10 {
                        server.handle_request().unwrap();
                    }
                })
            })
            .collect();

        ingest.join().unwrap();
        for handle in requests {
            handle.join().unwrap();
        }
        server.handle_request().unwrap();

        let applied = server.with_engine(|e| e.applied_frames());
        assert_eq!(applied, (0..FRAMES).collect::<Vec<_>>());
        // No update is ever empty.
        let calls = server.with_engine(|e| e.calls.clone());
        assert!(
            calls
                .iter()
                .all(|c| !matches!(c, Call::Update(tags) if tags.is_empty()))
        );
    }

    #[test]
    fn poisoned_lock_is_recovered() {
        struct PanickingEngine;
        impl ReconstructionEngine for PanickingEngine {
            fn apply_update(&mut self, _batch: BatchTensors) {}
            fn query(&mut self, _: &Vocabulary, _: u32) -> Result<LabelGrid, VoxsegError> {
                panic!("engine crashed");
            }
            fn origin(&self) -> [f32; 3] {
                [0.0; 3]
            }
            fn resolution(&self) -> [f32; 3] {
                [1.0; 3]
            }
            fn reset(&mut self) {}
        }

        let server = VoxelServer::new(ServerConfig::default(), PanickingEngine);
        server.update_classes(classes(&["chair"]));
        let crashed = {
            let server = server.clone();
            thread::spawn(move || server.handle_request()).join()
        };
        assert!(crashed.is_err());

        server.ingest(frame(1));
        assert_eq!(server.pending_frames(), 1);
        server.reset();
        assert_eq!(server.vocabulary(), None);
    }
}
