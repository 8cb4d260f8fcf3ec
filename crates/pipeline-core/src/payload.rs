//! Envelope payloads
//!
//! A closed tagged union over everything a stage can emit. The variant name
//! travels with the data, so receivers decode it without outside hints.

use serde::{Deserialize, Serialize};
use video_pipeline_common::{
    Attributes, CommandParams, DataKind, Feature, IdRank, PedestrianInfo, TermSignal, Tracklet,
};

/// How a spilled payload was written to the bulk store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpillFormat {
    /// The payload's raw bytes
    Raw,
    /// The JSON encoding of the whole payload
    Json,
}

/// Pointer to a payload parked in the bulk store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadRef {
    pub path: String,
    pub format: SpillFormat,
    pub size: u64,
}

/// Data carried by an envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Payload {
    /// Textual reference, usually a video location
    Url(String),
    Tracklet(Tracklet),
    Attributes(Attributes),
    Feature(Feature),
    IdRank(IdRank),
    PedestrianInfo(PedestrianInfo),
    Command(CommandParams),
    Terminate(TermSignal),
    /// Opaque bytes such as encoded frames, base64 on the wire
    Blob(#[serde(with = "base64_serde")] Vec<u8>),
    /// Payload moved to the bulk store
    Reference(PayloadRef),
}

impl Payload {
    /// Kind of data this payload carries, if it maps to one
    #[must_use]
    pub fn kind(&self) -> Option<DataKind> {
        match self {
            Self::Url(_) => Some(DataKind::Url),
            Self::Tracklet(_) => Some(DataKind::Tracklet),
            Self::Attributes(_) => Some(DataKind::Attributes),
            Self::Feature(_) => Some(DataKind::ReidFeature),
            Self::IdRank(_) => Some(DataKind::IdRank),
            Self::PedestrianInfo(_) => Some(DataKind::TrackletAttr),
            Self::Command(_) => Some(DataKind::Command),
            Self::Terminate(_) => Some(DataKind::TermSig),
            Self::Blob(_) => Some(DataKind::FrameArray),
            Self::Reference(_) => None,
        }
    }

    /// Variant name, for logs
    #[must_use]
    pub fn variant_name(&self) -> &'static str {
        match self {
            Self::Url(_) => "url",
            Self::Tracklet(_) => "tracklet",
            Self::Attributes(_) => "attributes",
            Self::Feature(_) => "feature",
            Self::IdRank(_) => "id_rank",
            Self::PedestrianInfo(_) => "pedestrian_info",
            Self::Command(_) => "command",
            Self::Terminate(_) => "terminate",
            Self::Blob(_) => "blob",
            Self::Reference(_) => "reference",
        }
    }

    #[must_use]
    pub fn as_reference(&self) -> Option<&PayloadRef> {
        match self {
            Self::Reference(r) => Some(r),
            _ => None,
        }
    }

    /// Bytes to write when spilling this payload.
    ///
    /// Blobs are stored verbatim so readers of the bulk store see the
    /// original bytes; everything else is stored as JSON.
    pub fn to_spill(&self) -> Result<(Vec<u8>, SpillFormat), serde_json::Error> {
        match self {
            Self::Blob(bytes) => Ok((bytes.clone(), SpillFormat::Raw)),
            other => Ok((serde_json::to_vec(other)?, SpillFormat::Json)),
        }
    }

    /// Rebuild a payload from spilled bytes
    pub fn from_spill(bytes: Vec<u8>, format: SpillFormat) -> Result<Self, serde_json::Error> {
        match format {
            SpillFormat::Raw => Ok(Self::Blob(bytes)),
            SpillFormat::Json => serde_json::from_slice(&bytes),
        }
    }
}

impl From<Tracklet> for Payload {
    fn from(tracklet: Tracklet) -> Self {
        Self::Tracklet(tracklet)
    }
}

impl From<Attributes> for Payload {
    fn from(attributes: Attributes) -> Self {
        Self::Attributes(attributes)
    }
}

impl From<Feature> for Payload {
    fn from(feature: Feature) -> Self {
        Self::Feature(feature)
    }
}

impl From<IdRank> for Payload {
    fn from(rank: IdRank) -> Self {
        Self::IdRank(rank)
    }
}

/// Base64 wire form for blob payloads
mod base64_serde {
    use base64::{engine::general_purpose, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        general_purpose::STANDARD
            .decode(&s)
            .map_err(serde::de::Error::custom)
    }
}
