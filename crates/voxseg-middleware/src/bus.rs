//! Typed, topic-based publish/subscribe bus for VoxSeg inputs.
//!
//! Uses [`tokio::sync::broadcast`] channels so every subscriber sees every
//! message and a slow subscriber never blocks the publishers.
//!
//! # Topics
//!
//! | Topic | Traffic |
//! |---|---|
//! | [`Topic::Sensor`] | Timestamped RGB, depth and pose messages |
//! | [`Topic::FrameBundle`] | Pre-paired RGB + depth + extrinsics |
//! | [`Topic::Classes`] | Vocabulary updates |
//! | [`Topic::Reset`] | World reset signals |
//!
//! Delivery is best effort: a subscriber that falls more than `capacity`
//! messages behind loses the oldest ones and logs a warning.

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::warn;
use uuid::Uuid;
use voxseg_perception::SensorMessage;
use voxseg_types::{ClassUpdate, FrameBundle, VoxsegError};

/// Default channel capacity.
const DEFAULT_CAPACITY: usize = 256;

/// Routing lanes on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Sensor,
    FrameBundle,
    Classes,
    Reset,
}

/// Message body carried by an [`Envelope`].
#[derive(Debug, Clone)]
pub enum BusPayload {
    Sensor(SensorMessage),
    FrameBundle(Box<FrameBundle>),
    Classes(ClassUpdate),
    Reset,
}

impl BusPayload {
    /// The lane this payload travels on.
    pub fn topic(&self) -> Topic {
        match self {
            BusPayload::Sensor(_) => Topic::Sensor,
            BusPayload::FrameBundle(_) => Topic::FrameBundle,
            BusPayload::Classes(_) => Topic::Classes,
            BusPayload::Reset => Topic::Reset,
        }
    }
}

/// A bus message with delivery metadata.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub id: Uuid,
    pub received_at: DateTime<Utc>,
    /// e.g. `"ros::/camera/rgb"`
    pub source: String,
    pub payload: BusPayload,
}

impl Envelope {
    pub fn new(source: impl Into<String>, payload: BusPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            received_at: Utc::now(),
            source: source.into(),
            payload,
        }
    }
}

/// Shared input bus. Clones share the same channels.
#[derive(Clone, Debug)]
pub struct SensorBus {
    sensor: broadcast::Sender<Envelope>,
    frame_bundle: broadcast::Sender<Envelope>,
    classes: broadcast::Sender<Envelope>,
    reset: broadcast::Sender<Envelope>,
}

impl SensorBus {
    /// Create a bus; `capacity` applies to every topic independently.
    pub fn new(capacity: usize) -> Self {
        let (sensor, _) = broadcast::channel(capacity);
        let (frame_bundle, _) = broadcast::channel(capacity);
        let (classes, _) = broadcast::channel(capacity);
        let (reset, _) = broadcast::channel(capacity);
        Self {
            sensor,
            frame_bundle,
            classes,
            reset,
        }
    }

    /// Publish on the topic matching the envelope's payload.
    ///
    /// Returns the number of subscribers that were handed the message, or
    /// [`VoxsegError::Channel`] when nobody is listening on that topic.
    pub fn publish(&self, envelope: Envelope) -> Result<usize, VoxsegError> {
        let topic = envelope.payload.topic();
        self.topic_sender(topic)
            .send(envelope)
            .map_err(|_| VoxsegError::Channel(format!("No subscribers for topic {topic:?}")))
    }

    /// Shorthand for `publish(Envelope::new(source, payload))`.
    pub fn publish_payload(
        &self,
        source: impl Into<String>,
        payload: BusPayload,
    ) -> Result<usize, VoxsegError> {
        self.publish(Envelope::new(source, payload))
    }

    pub fn subscribe_to(&self, topic: Topic) -> TopicReceiver {
        TopicReceiver {
            topic,
            receiver: self.topic_sender(topic).subscribe(),
        }
    }

    fn topic_sender(&self, topic: Topic) -> &broadcast::Sender<Envelope> {
        match topic {
            Topic::Sensor => &self.sensor,
            Topic::FrameBundle => &self.frame_bundle,
            Topic::Classes => &self.classes,
            Topic::Reset => &self.reset,
        }
    }
}

impl Default for SensorBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// An async receiver bound to one [`Topic`].
pub struct TopicReceiver {
    topic: Topic,
    receiver: broadcast::Receiver<Envelope>,
}

impl TopicReceiver {
    /// Wait for the next message on this topic.
    ///
    /// Skips over lag (logging how many messages were lost) and returns
    /// `None` once every publisher is gone.
    pub async fn recv(&mut self) -> Option<Envelope> {
        loop {
            match self.receiver.recv().await {
                Ok(envelope) => return Some(envelope),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(topic = ?self.topic, lagged_by = n, "bus subscriber lagged; messages dropped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }
}
