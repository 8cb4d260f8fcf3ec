//! Data kinds and the bus channels they map to

use crate::KindError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Category of data flowing between stages.
///
/// Every kind owns exactly one bus channel; [`DataKind::channel`] and
/// [`DataKind::from_channel`] are inverses of each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataKind {
    /// Pedestrian attribute vectors
    Attributes,
    /// User commands consumed by the message handler
    Command,
    /// Re-identification ranking results
    IdRank,
    /// Pedestrian tracklets
    Tracklet,
    /// Tracklet identifiers
    TrackletId,
    /// Tracklet together with its attributes
    TrackletAttr,
    /// Textual references such as video URLs
    Url,
    /// Raw decoded frames
    FrameArray,
    /// Re-identification feature vectors
    ReidFeature,
    /// Login parameters for web cameras
    WebcamLoginParam,
    /// Termination signals carrying a task id
    TermSig,
    /// Produced by sink stages that emit nothing
    NoOutput,
}

impl DataKind {
    /// Every kind, in declaration order
    pub const ALL: [DataKind; 12] = [
        DataKind::Attributes,
        DataKind::Command,
        DataKind::IdRank,
        DataKind::Tracklet,
        DataKind::TrackletId,
        DataKind::TrackletAttr,
        DataKind::Url,
        DataKind::FrameArray,
        DataKind::ReidFeature,
        DataKind::WebcamLoginParam,
        DataKind::TermSig,
        DataKind::NoOutput,
    ];

    /// Name of the bus channel carrying this kind
    #[must_use]
    pub const fn channel(self) -> &'static str {
        match self {
            Self::Attributes => "attributes",
            Self::Command => "command",
            Self::IdRank => "idrank",
            Self::Tracklet => "tracklet",
            Self::TrackletId => "tracklet-id",
            Self::TrackletAttr => "tracklet-attr",
            Self::Url => "url",
            Self::FrameArray => "frame-array",
            Self::ReidFeature => "reid-feature",
            Self::WebcamLoginParam => "webcam-login-param",
            Self::TermSig => "term-sig",
            Self::NoOutput => "none",
        }
    }

    /// Resolve the kind owning a channel
    pub fn from_channel(channel: &str) -> Result<Self, KindError> {
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.channel() == channel)
            .ok_or_else(|| KindError::UnknownChannel(channel.to_string()))
    }

    /// Whether envelopes of this kind end the task's journey
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::NoOutput | Self::TermSig)
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.channel())
    }
}

impl FromStr for DataKind {
    type Err = KindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_channel(s).map_err(|_| KindError::UnknownKind(s.to_string()))
    }
}

/// Named input socket of a stage.
///
/// A stage declares the set of ports it accepts; plans bind each port to
/// exactly one node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Port {
    /// Name of the owning stage socket
    pub stage: String,

    /// Kind of data accepted on this port
    pub kind: DataKind,
}

impl Port {
    /// Create a new port
    pub fn new(stage: impl Into<String>, kind: DataKind) -> Self {
        Self {
            stage: stage.into(),
            kind,
        }
    }

    /// Channel envelopes for this port travel on
    #[must_use]
    pub fn channel(&self) -> &'static str {
        self.kind.channel()
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.stage, self.kind)
    }
}
