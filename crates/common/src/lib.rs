/// Common types shared by every pipeline stage
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

pub mod kind;

pub use kind::{DataKind, Port};

/// Errors raised while resolving kinds and channels
#[derive(Debug, Error)]
pub enum KindError {
    #[error("Unknown channel: {0}")]
    UnknownChannel(String),

    #[error("Unknown data kind: {0}")]
    UnknownKind(String),
}

/// Identifier of a tracklet within a video
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrackletId {
    pub video_id: String,
    pub serial_number: i32,
}

impl TrackletId {
    pub fn new(video_id: impl Into<String>, serial_number: i32) -> Self {
        Self {
            video_id: video_id.into(),
            serial_number,
        }
    }
}

impl fmt::Display for TrackletId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.video_id, self.serial_number)
    }
}

/// One located pedestrian patch within a frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,

    /// Raw BGR pixels of the patch (may be empty once sampled out)
    #[serde(default)]
    pub patch_data: Vec<u8>,
}

/// Sequence of bounding boxes following one pedestrian through a video
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tracklet {
    pub id: TrackletId,
    pub start_frame_index: u32,

    /// Number of tracklets found in the same video
    pub num_tracklets: u32,

    pub samples: Vec<BoundingBox>,
}

impl Tracklet {
    pub fn new(id: TrackletId, start_frame_index: u32) -> Self {
        Self {
            id,
            start_frame_index,
            num_tracklets: 1,
            samples: Vec::new(),
        }
    }

    /// Keep at most `max_samples` evenly spaced samples.
    ///
    /// Applied before publishing so tracklets stay well under the bus
    /// message limit.
    pub fn sample(&mut self, max_samples: usize) {
        let len = self.samples.len();
        if max_samples == 0 {
            self.samples.clear();
            return;
        }
        if len <= max_samples {
            return;
        }

        let mut kept = Vec::with_capacity(max_samples);
        for i in 0..max_samples {
            kept.push(self.samples[i * len / max_samples].clone());
        }
        self.samples = kept;
    }

    /// Total bytes of patch data carried by this tracklet
    #[must_use]
    pub fn patch_bytes(&self) -> usize {
        self.samples.iter().map(|s| s.patch_data.len()).sum()
    }
}

/// Attribute recognition result, keyed by attribute name
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Attributes {
    pub tracklet_id: Option<TrackletId>,
    pub scores: BTreeMap<String, f32>,
}

/// Re-identification feature vector
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Feature {
    pub tracklet_id: Option<TrackletId>,
    pub vector: Vec<f32>,
}

/// Re-identification ranking of candidate tracklets for one query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdRank {
    pub query: TrackletId,
    pub candidates: Vec<TrackletId>,
}

/// A tracklet together with its recognized attributes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PedestrianInfo {
    pub tracklet: Tracklet,
    pub attributes: Attributes,
}

/// Parameters of a user command
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CommandParams {
    pub command: String,
    pub params: BTreeMap<String, String>,
}

impl CommandParams {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            params: BTreeMap::new(),
        }
    }

    /// Add a parameter
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Look up a parameter
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }
}

/// Request to stop tracking a task
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TermSignal {
    pub task_id: String,
}
