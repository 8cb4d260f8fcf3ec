//! Command planner
//!
//! Maps each user command to the stage topology that serves it. The plan is
//! built once per command and copied into every task envelope.

use serde_json::Value;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;
use video_pipeline_common::{CommandParams, DataKind, Port, TrackletId};
use video_pipeline_core::{ExecutionPlan, NodeId, PlanError};

/// Keys of command parameters
pub mod params {
    /// Bulk store directory holding the videos to process
    pub const VIDEO_URL: &str = "video-url";
    /// Tracker configuration name, attached to the tracking node
    pub const TRACKING_CONF_FILE: &str = "tracking-conf-file";
    /// Serial number of the stored tracklet to start from
    pub const TRACKLET_INDEX: &str = "tracklet-serial-num";
}

/// Stage names, also used as plan node names
pub mod stages {
    pub const TRACKING: &str = "pedestrian-tracking";
    pub const ATTR_RECOG: &str = "pedestrian-attr-recog";
    pub const REID: &str = "pedestrian-reid-using-attr";
    pub const REID_FEATURE: &str = "pedestrian-reid-feature-extraction";
    pub const TRACKLET_SAVING: &str = "tracklet-saving";
    pub const ATTR_SAVING: &str = "attr-saving";
    pub const IDRANK_SAVING: &str = "idrank-saving";
    pub const REID_FEATURE_SAVING: &str = "reid-feature-saving";
}

/// Input ports of the pipeline stages
pub mod ports {
    use video_pipeline_common::{DataKind, Port};

    pub fn video_url_for_tracking() -> Port {
        Port::new("hdfs-video-url-for-pedestrian-tracking", DataKind::Url)
    }

    pub fn tracklet_for_attr_recog() -> Port {
        Port::new("pedestrian-tracklet-for-attr-recog", DataKind::Tracklet)
    }

    pub fn tracklet_for_reid() -> Port {
        Port::new("pedestrian-tracklet-for-reid", DataKind::Tracklet)
    }

    pub fn attr_for_reid() -> Port {
        Port::new("pedestrian-attr-for-reid", DataKind::Attributes)
    }

    pub fn tracklet_attr_for_reid() -> Port {
        Port::new("pedestrian-tracklet-attr-for-reid", DataKind::TrackletAttr)
    }

    pub fn tracklet_for_reid_feature() -> Port {
        Port::new(
            "pedestrian-tracklet-for-reid-feature-extraction",
            DataKind::Tracklet,
        )
    }

    pub fn tracklet_for_saving() -> Port {
        Port::new("pedestrian-tracklet-for-saving", DataKind::Tracklet)
    }

    pub fn attr_for_saving() -> Port {
        Port::new("pedestrian-attr-for-saving", DataKind::Attributes)
    }

    pub fn idrank_for_saving() -> Port {
        Port::new("pedestrian-idrank-for-saving", DataKind::IdRank)
    }

    pub fn reid_feature_for_saving() -> Port {
        Port::new("pedestrian-reid-feature-for-saving", DataKind::ReidFeature)
    }
}

/// Bulk store layout of saved results
pub mod keys {
    use video_pipeline_common::TrackletId;

    pub fn tracklet(id: &TrackletId) -> String {
        format!("tracklets/{}/{}", id.video_id, id.serial_number)
    }

    pub fn attributes(id: &TrackletId) -> String {
        format!("attributes/{}/{}", id.video_id, id.serial_number)
    }

    pub fn idrank(id: &TrackletId) -> String {
        format!("idranks/{}/{}", id.video_id, id.serial_number)
    }

    pub fn reid_feature(id: &TrackletId) -> String {
        format!("reid-features/{}/{}", id.video_id, id.serial_number)
    }
}

#[derive(Error, Debug)]
pub enum PlanningError {
    #[error("Unsupported command: {0}")]
    UnsupportedCommand(String),

    #[error("Missing parameter: {0}")]
    MissingParam(&'static str),

    #[error("Invalid value '{value}' for parameter {name}")]
    InvalidParam { name: &'static str, value: String },

    #[error("Malformed plan: {0}")]
    Plan(#[from] PlanError),
}

/// Commands accepted on the command channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandType {
    Track,
    TrackAttrRecog,
    TrackReid,
    TrackAttrRecogReid,
    TrackAttrRecogReidFeature,
    AttrRecog,
    AttrRecogReid,
    Reid,
}

impl CommandType {
    pub const ALL: [CommandType; 8] = [
        CommandType::Track,
        CommandType::TrackAttrRecog,
        CommandType::TrackReid,
        CommandType::TrackAttrRecogReid,
        CommandType::TrackAttrRecogReidFeature,
        CommandType::AttrRecog,
        CommandType::AttrRecogReid,
        CommandType::Reid,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Track => "track",
            Self::TrackAttrRecog => "track-attrrecog",
            Self::TrackReid => "track-reid",
            Self::TrackAttrRecogReid => "track-attrrecog-reid",
            Self::TrackAttrRecogReidFeature => "track-attrrecog-reidfeature",
            Self::AttrRecog => "attrrecog",
            Self::AttrRecogReid => "attrrecog-reid",
            Self::Reid => "reid",
        }
    }

    /// What the first envelope of each task carries
    #[must_use]
    pub const fn entry(self) -> EntryInput {
        match self {
            Self::AttrRecog | Self::AttrRecogReid => EntryInput::StoredTracklet,
            Self::Reid => EntryInput::StoredPedestrian,
            _ => EntryInput::VideoUrl,
        }
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandType {
    type Err = PlanningError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| PlanningError::UnsupportedCommand(s.to_string()))
    }
}

/// Initial input of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryInput {
    /// URL of the video itself
    VideoUrl,
    /// URL of a tracklet saved by an earlier run
    StoredTracklet,
    /// A saved tracklet joined with its saved attributes
    StoredPedestrian,
}

/// Plan for one command plus the ports its tasks enter through
#[derive(Debug, Clone)]
pub struct Topology {
    pub command: CommandType,
    pub plan: ExecutionPlan,
    pub entry_ports: Vec<Port>,
}

impl Topology {
    #[must_use]
    pub fn entry(&self) -> EntryInput {
        self.command.entry()
    }
}

/// File name of `path` without its extension
#[must_use]
pub fn video_stem(path: &str) -> &str {
    Path::new(path)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(path)
}

/// Tracklet a stored-input command starts from, for the video at `video_path`
pub fn entry_tracklet_id(
    video_path: &str,
    params: &CommandParams,
) -> Result<TrackletId, PlanningError> {
    let raw = params
        .get(params::TRACKLET_INDEX)
        .ok_or(PlanningError::MissingParam(params::TRACKLET_INDEX))?;
    let serial = raw.parse().map_err(|_| PlanningError::InvalidParam {
        name: params::TRACKLET_INDEX,
        value: raw.to_string(),
    })?;
    Ok(TrackletId::new(video_stem(video_path), serial))
}

struct PlanBuilder {
    plan: ExecutionPlan,
}

impl PlanBuilder {
    fn new() -> Self {
        Self {
            plan: ExecutionPlan::new(),
        }
    }

    fn node(&mut self, name: &str, kind: DataKind) -> NodeId {
        self.plan.add_named_node(name, kind, None)
    }

    fn tracking(&mut self, params: &CommandParams) -> NodeId {
        let conf = params
            .get(params::TRACKING_CONF_FILE)
            .map(|c| Value::String(c.to_string()));
        self.plan
            .add_named_node(stages::TRACKING, DataKind::Tracklet, conf)
    }

    fn saving(&mut self, name: &str) -> NodeId {
        self.node(name, DataKind::NoOutput)
    }

    fn wire(&mut self, from: NodeId, to: NodeId, port: Port) -> Result<(), PlanError> {
        let port = self.plan.create_input_port(to, port)?;
        self.plan.output_to(from, port)
    }

    fn entry(&mut self, node: NodeId, port: Port) -> Result<Port, PlanError> {
        self.plan.create_input_port(node, port)
    }
}

/// Build the topology serving `command`
pub fn plan_command(
    command: CommandType,
    params: &CommandParams,
) -> Result<Topology, PlanningError> {
    let mut b = PlanBuilder::new();

    let entry_ports = match command {
        CommandType::Track => {
            let tracking = b.tracking(params);
            let tracklet_saving = b.saving(stages::TRACKLET_SAVING);
            b.wire(tracking, tracklet_saving, ports::tracklet_for_saving())?;
            vec![b.entry(tracking, ports::video_url_for_tracking())?]
        }
        CommandType::TrackAttrRecog => {
            let tracking = b.tracking(params);
            let attr = b.node(stages::ATTR_RECOG, DataKind::Attributes);
            let tracklet_saving = b.saving(stages::TRACKLET_SAVING);
            let attr_saving = b.saving(stages::ATTR_SAVING);
            b.wire(tracking, attr, ports::tracklet_for_attr_recog())?;
            b.wire(tracking, tracklet_saving, ports::tracklet_for_saving())?;
            b.wire(attr, attr_saving, ports::attr_for_saving())?;
            vec![b.entry(tracking, ports::video_url_for_tracking())?]
        }
        CommandType::TrackReid => {
            let tracking = b.tracking(params);
            let feature = b.node(stages::REID_FEATURE, DataKind::ReidFeature);
            let tracklet_saving = b.saving(stages::TRACKLET_SAVING);
            let feature_saving = b.saving(stages::REID_FEATURE_SAVING);
            b.wire(tracking, feature, ports::tracklet_for_reid_feature())?;
            b.wire(tracking, tracklet_saving, ports::tracklet_for_saving())?;
            b.wire(feature, feature_saving, ports::reid_feature_for_saving())?;
            vec![b.entry(tracking, ports::video_url_for_tracking())?]
        }
        CommandType::TrackAttrRecogReid => {
            let tracking = b.tracking(params);
            let attr = b.node(stages::ATTR_RECOG, DataKind::Attributes);
            let reid = b.node(stages::REID, DataKind::IdRank);
            let tracklet_saving = b.saving(stages::TRACKLET_SAVING);
            let attr_saving = b.saving(stages::ATTR_SAVING);
            let idrank_saving = b.saving(stages::IDRANK_SAVING);
            b.wire(tracking, attr, ports::tracklet_for_attr_recog())?;
            b.wire(tracking, reid, ports::tracklet_for_reid())?;
            b.wire(attr, reid, ports::attr_for_reid())?;
            b.wire(tracking, tracklet_saving, ports::tracklet_for_saving())?;
            b.wire(attr, attr_saving, ports::attr_for_saving())?;
            b.wire(reid, idrank_saving, ports::idrank_for_saving())?;
            vec![b.entry(tracking, ports::video_url_for_tracking())?]
        }
        CommandType::TrackAttrRecogReidFeature => {
            let tracking = b.tracking(params);
            let attr = b.node(stages::ATTR_RECOG, DataKind::Attributes);
            let feature = b.node(stages::REID_FEATURE, DataKind::ReidFeature);
            let tracklet_saving = b.saving(stages::TRACKLET_SAVING);
            let attr_saving = b.saving(stages::ATTR_SAVING);
            let feature_saving = b.saving(stages::REID_FEATURE_SAVING);
            b.wire(tracking, attr, ports::tracklet_for_attr_recog())?;
            b.wire(tracking, feature, ports::tracklet_for_reid_feature())?;
            b.wire(tracking, tracklet_saving, ports::tracklet_for_saving())?;
            b.wire(attr, attr_saving, ports::attr_for_saving())?;
            b.wire(feature, feature_saving, ports::reid_feature_for_saving())?;
            vec![b.entry(tracking, ports::video_url_for_tracking())?]
        }
        CommandType::AttrRecog => {
            let attr = b.node(stages::ATTR_RECOG, DataKind::Attributes);
            let attr_saving = b.saving(stages::ATTR_SAVING);
            b.wire(attr, attr_saving, ports::attr_for_saving())?;
            vec![b.entry(attr, ports::tracklet_for_attr_recog())?]
        }
        CommandType::AttrRecogReid => {
            let attr = b.node(stages::ATTR_RECOG, DataKind::Attributes);
            let reid = b.node(stages::REID, DataKind::IdRank);
            let attr_saving = b.saving(stages::ATTR_SAVING);
            let idrank_saving = b.saving(stages::IDRANK_SAVING);
            b.wire(attr, reid, ports::attr_for_reid())?;
            b.wire(attr, attr_saving, ports::attr_for_saving())?;
            b.wire(reid, idrank_saving, ports::idrank_for_saving())?;
            vec![
                b.entry(attr, ports::tracklet_for_attr_recog())?,
                b.entry(reid, ports::tracklet_for_reid())?,
            ]
        }
        CommandType::Reid => {
            let reid = b.node(stages::REID, DataKind::IdRank);
            let idrank_saving = b.saving(stages::IDRANK_SAVING);
            b.wire(reid, idrank_saving, ports::idrank_for_saving())?;
            vec![b.entry(reid, ports::tracklet_attr_for_reid())?]
        }
    };

    b.plan.validate()?;
    Ok(Topology {
        command,
        plan: b.plan,
        entry_ports,
    })
}
