//! Frame Synchronizer.
//!
//! Matches near-simultaneous messages that arrive independently on the RGB,
//! depth and up to [`MAX_POSE_CHANNELS`] pose channels into a single
//! [`Frame`].
//!
//! Each channel keeps a bounded history of un-matched messages in arrival
//! order. On every arrival the synchronizer searches the other channels for
//! the message closest in time to the newcomer (within `slop`, ties going to
//! the earliest arrival). If that tuple spans more than `slop`, the tightest
//! tuple that still contains the newcomer is taken instead. A matched tuple
//! is removed from the histories and turned into a [`Frame`].
//!
//! Matching is best effort: a message that falls off the end of its full
//! history is silently discarded. Histories are bounded per channel only,
//! so a channel running late or a single wild stamp never evicts messages
//! on another channel.
//!
//! # Pose composition
//!
//! Pose channels are ordered from the world side to the sensor side, e.g.
//! slot 0 = `base` in `odom`, slot 1 = `camera` in `base`. The frame
//! extrinsics are `P0 · P1 · … · Pn-1`; with no pose channels they are the
//! identity.
//!
//! # Example
//!
//! ```rust
//! use voxseg_perception::decode::PassthroughDecoder;
//! use voxseg_perception::sync::{FrameSynchronizer, SensorMessage, SyncConfig};
//! use voxseg_types::RawImage;
//!
//! let mut sync = FrameSynchronizer::new(SyncConfig::default(), PassthroughDecoder).unwrap();
//! let rgb = RawImage { width: 1, height: 1, encoding: "rgb8".into(), data: vec![1, 2, 3] };
//! let depth = RawImage { width: 1, height: 1, encoding: "32FC1".into(), data: 2.0f32.to_le_bytes().to_vec() };
//!
//! assert!(sync.push(SensorMessage::rgb(1.00, rgb)).unwrap().is_none());
//! let frame = sync.push(SensorMessage::depth(1.04, depth)).unwrap();
//! assert!(frame.is_some());
//! ```

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};
use voxseg_types::{Frame, RawImage, Stamp, TransformationMatrix, VoxsegError};

use crate::decode::ImageDecoder;
use crate::transform::{Pose, compose_chain, resolve};

/// Maximum number of auxiliary pose channels.
pub const MAX_POSE_CHANNELS: usize = 3;

/// Absorbs float noise when comparing stamp differences against `slop`.
const STAMP_EPSILON: f64 = 1e-9;

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

/// Synchronizer tuning.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Maximum stamp spread (seconds) of a matched tuple.
    pub slop: f64,
    /// Per-channel history capacity.
    pub queue_size: usize,
    /// Number of pose channels that must take part in every match.
    pub pose_channels: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            slop: 0.1,
            queue_size: 100,
            pose_channels: 0,
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<(), VoxsegError> {
        if !(self.slop.is_finite() && self.slop >= 0.0) {
            return Err(VoxsegError::InvalidConfig(format!(
                "slop must be a non-negative number, got {}",
                self.slop
            )));
        }
        if self.queue_size == 0 {
            return Err(VoxsegError::InvalidConfig(
                "queue_size must be at least 1".to_string(),
            ));
        }
        if self.pose_channels > MAX_POSE_CHANNELS {
            return Err(VoxsegError::InvalidConfig(format!(
                "at most {MAX_POSE_CHANNELS} pose channels are supported, got {}",
                self.pose_channels
            )));
        }
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Messages
// ────────────────────────────────────────────────────────────────────────────

/// Logical input channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelId {
    Rgb,
    Depth,
    /// Pose channel by slot, `0..MAX_POSE_CHANNELS`.
    Pose(usize),
}

impl ChannelId {
    fn index(self) -> usize {
        match self {
            ChannelId::Rgb => 0,
            ChannelId::Depth => 1,
            ChannelId::Pose(slot) => 2 + slot,
        }
    }
}

/// Payload of one sensor message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SensorPayload {
    Rgb(RawImage),
    Depth(RawImage),
    Pose { slot: usize, pose: Pose },
}

/// A timestamped message on one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorMessage {
    pub stamp: Stamp,
    pub payload: SensorPayload,
}

impl SensorMessage {
    pub fn rgb(stamp: Stamp, image: RawImage) -> Self {
        Self {
            stamp,
            payload: SensorPayload::Rgb(image),
        }
    }

    pub fn depth(stamp: Stamp, image: RawImage) -> Self {
        Self {
            stamp,
            payload: SensorPayload::Depth(image),
        }
    }

    pub fn pose(stamp: Stamp, slot: usize, pose: Pose) -> Self {
        Self {
            stamp,
            payload: SensorPayload::Pose { slot, pose },
        }
    }

    pub fn channel(&self) -> ChannelId {
        match self.payload {
            SensorPayload::Rgb(_) => ChannelId::Rgb,
            SensorPayload::Depth(_) => ChannelId::Depth,
            SensorPayload::Pose { slot, .. } => ChannelId::Pose(slot),
        }
    }
}

/// Counters for observing synchronizer behaviour.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub received: u64,
    pub matched: u64,
    /// Pushed out of a full history without being matched.
    pub evicted: u64,
    /// Rejected on arrival or discarded after matching (bad pose, decode error).
    pub rejected: u64,
}

// ────────────────────────────────────────────────────────────────────────────
// MatchQueue
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct Entry<T> {
    stamp: Stamp,
    seq: u64,
    item: T,
}

/// Per-channel bounded histories plus the matching search.
///
/// Generic over the stored item so the search can be exercised without
/// images.
#[derive(Debug)]
pub struct MatchQueue<T> {
    channels: Vec<VecDeque<Entry<T>>>,
    slop: f64,
    queue_size: usize,
    next_seq: u64,
    evicted: u64,
}

impl<T> MatchQueue<T> {
    pub fn new(channel_count: usize, slop: f64, queue_size: usize) -> Self {
        Self {
            channels: (0..channel_count).map(|_| VecDeque::new()).collect(),
            slop,
            queue_size,
            next_seq: 0,
            evicted: 0,
        }
    }

    /// Number of un-matched messages held for `channel`.
    pub fn pending(&self, channel: usize) -> usize {
        self.channels.get(channel).map_or(0, VecDeque::len)
    }

    /// Insert a message and try to complete a tuple around it.
    ///
    /// Returns the matched items in channel order. An out-of-range
    /// `channel` is ignored and yields `None`.
    pub fn push(&mut self, channel: usize, stamp: Stamp, item: T) -> Option<Vec<T>> {
        let queue_size = self.queue_size;
        let history = self.channels.get_mut(channel)?;
        while history.len() >= queue_size {
            if let Some(old) = history.pop_front() {
                debug!(channel, stamp = old.stamp, "history full; dropping oldest message");
                self.evicted += 1;
            }
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        history.push_back(Entry { stamp, seq, item });

        let chosen = self
            .nearest(channel, seq, stamp)
            .or_else(|| self.tightest(channel, seq, stamp))?;
        self.take(chosen)
    }

    fn within_slop(&self, spread: f64) -> bool {
        spread <= self.slop + STAMP_EPSILON
    }

    /// Per channel, the in-slop message closest to the anchor (earliest
    /// arrival on ties). `None` if a channel has no candidate or the tuple
    /// spans more than `slop`.
    fn nearest(&self, anchor_channel: usize, anchor_seq: u64, anchor: Stamp) -> Option<Vec<u64>> {
        let mut chosen = Vec::with_capacity(self.channels.len());
        let (mut lo, mut hi) = (anchor, anchor);
        for (channel, history) in self.channels.iter().enumerate() {
            if channel == anchor_channel {
                chosen.push(anchor_seq);
                continue;
            }
            let best = history
                .iter()
                .filter(|e| self.within_slop((e.stamp - anchor).abs()))
                .min_by(|a, b| {
                    (a.stamp - anchor)
                        .abs()
                        .total_cmp(&(b.stamp - anchor).abs())
                        .then(a.seq.cmp(&b.seq))
                })?;
            lo = lo.min(best.stamp);
            hi = hi.max(best.stamp);
            chosen.push(best.seq);
        }

        if !self.within_slop(hi - lo) {
            trace!(spread = hi - lo, "nearest candidates exceed slop");
            return None;
        }
        Some(chosen)
    }

    /// The lowest-spread tuple containing the anchor, if one fits in `slop`.
    ///
    /// Tries every buffered stamp in `[anchor - slop, anchor]` as the
    /// tuple's lower edge and takes, per channel, the earliest stamp at or
    /// above it.
    fn tightest(&self, anchor_channel: usize, anchor_seq: u64, anchor: Stamp) -> Option<Vec<u64>> {
        let floors = self
            .channels
            .iter()
            .enumerate()
            .filter(|(channel, _)| *channel != anchor_channel)
            .flat_map(|(_, history)| history.iter().map(|e| e.stamp))
            .filter(|&s| s <= anchor && self.within_slop(anchor - s))
            .chain(std::iter::once(anchor));

        let mut best: Option<(f64, Vec<u64>)> = None;
        'floors: for lo in floors {
            let mut chosen = Vec::with_capacity(self.channels.len());
            let mut hi = anchor;
            for (channel, history) in self.channels.iter().enumerate() {
                if channel == anchor_channel {
                    chosen.push(anchor_seq);
                    continue;
                }
                let Some(pick) = history
                    .iter()
                    .filter(|e| e.stamp >= lo)
                    .min_by(|a, b| a.stamp.total_cmp(&b.stamp).then(a.seq.cmp(&b.seq)))
                else {
                    continue 'floors;
                };
                hi = hi.max(pick.stamp);
                chosen.push(pick.seq);
            }
            let spread = hi - lo;
            if self.within_slop(spread) && best.as_ref().is_none_or(|(s, _)| spread < *s) {
                best = Some((spread, chosen));
            }
        }
        best.map(|(spread, chosen)| {
            trace!(spread, "tightest tuple chosen over nearest candidates");
            chosen
        })
    }

    fn take(&mut self, chosen: Vec<u64>) -> Option<Vec<T>> {
        let mut items = Vec::with_capacity(chosen.len());
        for (history, seq) in self.channels.iter_mut().zip(chosen) {
            let pos = history.iter().position(|e| e.seq == seq)?;
            items.push(history.remove(pos)?.item);
        }
        Some(items)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// FrameSynchronizer
// ────────────────────────────────────────────────────────────────────────────

/// What a channel history holds; poses are resolved on arrival.
#[derive(Debug)]
enum Held {
    Rgb(RawImage),
    Depth(RawImage),
    Pose(TransformationMatrix),
}

/// Matches RGB, depth and pose messages into [`Frame`]s.
///
/// Not internally synchronised: wrap it in a mutex (or own it from a single
/// task) when several channel handlers feed it concurrently.
pub struct FrameSynchronizer<D> {
    queue: MatchQueue<Held>,
    decoder: D,
    pose_channels: usize,
    received: u64,
    matched: u64,
    rejected: u64,
}

impl<D: ImageDecoder> FrameSynchronizer<D> {
    /// Build a synchronizer; fails if `config` does not validate.
    pub fn new(config: SyncConfig, decoder: D) -> Result<Self, VoxsegError> {
        config.validate()?;
        Ok(Self {
            queue: MatchQueue::new(2 + config.pose_channels, config.slop, config.queue_size),
            decoder,
            pose_channels: config.pose_channels,
            received: 0,
            matched: 0,
            rejected: 0,
        })
    }

    /// Feed one message.
    ///
    /// Returns `Ok(Some(frame))` when the message completed a tuple and
    /// `Ok(None)` when it was stored for later matching.
    ///
    /// # Errors
    ///
    /// An `Err` means this message (or the tuple it completed) was
    /// discarded: [`VoxsegError::DegeneratePose`] for an unusable pose,
    /// [`VoxsegError::Decode`] for a malformed image, or
    /// [`VoxsegError::Channel`] for an unknown pose slot or a non-finite
    /// stamp. Other histories are untouched and matching continues.
    pub fn push(&mut self, msg: SensorMessage) -> Result<Option<Frame>, VoxsegError> {
        self.received += 1;
        let channel = msg.channel();

        let held = match self.admit(msg.stamp, msg.payload) {
            Ok(held) => held,
            Err(e) => {
                self.rejected += 1;
                return Err(e);
            }
        };

        let Some(items) = self.queue.push(channel.index(), msg.stamp, held) else {
            return Ok(None);
        };
        self.matched += 1;

        match self.build_frame(items) {
            Ok(frame) => {
                debug!(stamp = msg.stamp, ?channel, "synchronized frame emitted");
                Ok(Some(frame))
            }
            Err(e) => {
                self.rejected += 1;
                Err(e)
            }
        }
    }

    fn admit(&self, stamp: Stamp, payload: SensorPayload) -> Result<Held, VoxsegError> {
        if !stamp.is_finite() {
            return Err(VoxsegError::Channel(format!("non-finite stamp {stamp}")));
        }
        Ok(match payload {
            SensorPayload::Rgb(image) => Held::Rgb(image),
            SensorPayload::Depth(image) => Held::Depth(image),
            SensorPayload::Pose { slot, pose } => {
                if slot >= self.pose_channels {
                    return Err(VoxsegError::Channel(format!(
                        "pose slot {slot} not configured ({} pose channels)",
                        self.pose_channels
                    )));
                }
                Held::Pose(resolve(&pose)?)
            }
        })
    }

    fn build_frame(&self, items: Vec<Held>) -> Result<Frame, VoxsegError> {
        let mut rgb = None;
        let mut depth = None;
        let mut poses = Vec::with_capacity(self.pose_channels);
        // Items arrive in channel order, so poses stay in slot order.
        for item in items {
            match item {
                Held::Rgb(image) => rgb = Some(image),
                Held::Depth(image) => depth = Some(image),
                Held::Pose(m) => poses.push(m),
            }
        }
        let (Some(rgb), Some(depth)) = (rgb, depth) else {
            return Err(VoxsegError::Channel(
                "matched tuple is missing an image".to_string(),
            ));
        };

        let rgb = self.decoder.decode_rgb(&rgb)?;
        let depth = self.decoder.decode_depth(&depth)?;
        Ok(Frame::new(rgb, depth, compose_chain(&poses)))
    }

    /// Number of un-matched messages held for `channel`.
    pub fn pending(&self, channel: ChannelId) -> usize {
        self.queue.pending(channel.index())
    }

    pub fn stats(&self) -> SyncStats {
        SyncStats {
            received: self.received,
            matched: self.matched,
            evicted: self.queue.evicted,
            rejected: self.rejected,
        }
    }
}
