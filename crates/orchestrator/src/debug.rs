//! Stand-in stages
//!
//! Deterministic fakes of the tracking, attribute recognition and
//! re-identification algorithms, plus the stages that save results to the
//! bulk store. They let the demo binary and the tests drive whole topologies
//! without any model.

use crate::planner::{keys, ports, stages, video_stem};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};
use video_pipeline_common::{
    Attributes, BoundingBox, Feature, IdRank, Port, Tracklet, TrackletId,
};
use video_pipeline_core::{
    Broadcast, BroadcastPool, Payload, ResourceRegistry, Singleton, Stage, StageContext,
    StageError,
};
use video_pipeline_storage::{ObjectStorage, StorageError};

fn storage_error(err: StorageError) -> StageError {
    if err.is_transient() {
        StageError::Transient(err.to_string())
    } else {
        StageError::Fatal(err.to_string())
    }
}

fn unexpected(stage: &str, payload: &Payload) -> StageError {
    StageError::InvalidInput(format!(
        "{} cannot process {} payloads",
        stage,
        payload.variant_name()
    ))
}

async fn load_tracklet(storage: &dyn ObjectStorage, url: &str) -> Result<Tracklet, StageError> {
    let bytes = storage.retrieve_file(url).await.map_err(storage_error)?;
    serde_json::from_slice(&bytes)
        .map_err(|e| StageError::InvalidInput(format!("{url} is not a tracklet: {e}")))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct TrackerConf {
    tracklets: u32,
    frames_per_tracklet: u32,
    patch_bytes: usize,
}

impl Default for TrackerConf {
    fn default() -> Self {
        Self {
            tracklets: 3,
            frames_per_tracklet: 40,
            patch_bytes: 64,
        }
    }
}

/// Fake pedestrian tracker.
///
/// Tracker configurations are broadcast from the bulk store directory
/// [`FakeTracker::CONF_PREFIX`]; the tracking node's exec parameter names
/// the configuration to use. Each configured tracklet becomes one result.
pub struct FakeTracker {
    storage: Arc<dyn ObjectStorage>,
    confs: Broadcast<BroadcastPool>,
    max_samples: usize,
}

impl FakeTracker {
    pub const CONF_PREFIX: &'static str = "conf/tracking/";

    pub fn new(storage: Arc<dyn ObjectStorage>, max_samples: usize) -> Self {
        Self {
            storage,
            confs: Broadcast::new(),
            max_samples,
        }
    }

    /// Reload configurations on next use
    pub async fn reload_confs(&self) {
        self.confs.invalidate().await;
    }

    async fn conf(&self, name: Option<&str>) -> Result<TrackerConf, StageError> {
        let storage = Arc::clone(&self.storage);
        let pool = self
            .confs
            .get_or_load(|| async move {
                Ok(BroadcastPool::from_storage(storage.as_ref(), Self::CONF_PREFIX).await?)
            })
            .await
            .map_err(|e| StageError::Transient(e.to_string()))?;

        match name.and_then(|n| pool.get(n)) {
            Some(bytes) => serde_json::from_slice(bytes)
                .map_err(|e| StageError::InvalidInput(format!("bad tracking conf: {e}"))),
            None => Ok(TrackerConf::default()),
        }
    }
}

#[async_trait]
impl Stage for FakeTracker {
    fn name(&self) -> &str {
        stages::TRACKING
    }

    fn input_ports(&self) -> Vec<Port> {
        vec![ports::video_url_for_tracking()]
    }

    async fn process(&self, ctx: &StageContext, payload: &Payload) -> Result<Vec<Payload>, StageError> {
        let Payload::Url(video) = payload else {
            return Err(unexpected(self.name(), payload));
        };
        let conf = self.conf(ctx.exec_param_str()).await?;
        let video_id = video_stem(video);

        let mut results = Vec::with_capacity(conf.tracklets as usize);
        for serial in 0..conf.tracklets {
            let mut tracklet = Tracklet::new(TrackletId::new(video_id, serial as i32), serial * 10);
            tracklet.num_tracklets = conf.tracklets;
            tracklet.samples = (0..conf.frames_per_tracklet)
                .map(|frame| BoundingBox {
                    x: (frame * 4) as i32,
                    y: (serial * 8) as i32,
                    width: 32,
                    height: 64,
                    patch_data: vec![serial as u8; conf.patch_bytes],
                })
                .collect();
            tracklet.sample(self.max_samples);
            results.push(Payload::Tracklet(tracklet));
        }

        info!(task_id = %ctx.task_id, video = %video, tracklets = results.len(), "Tracked video");
        Ok(results)
    }
}

struct AttrModel {
    attributes: Vec<&'static str>,
}

impl AttrModel {
    fn recognize(&self, tracklet: &Tracklet) -> Attributes {
        let seed = tracklet.id.serial_number.unsigned_abs() as usize + tracklet.samples.len();
        let scores = self
            .attributes
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let score = ((seed * 31 + i * 17) % 100) as f32 / 100.0;
                (name.to_string(), score)
            })
            .collect();
        Attributes {
            tracklet_id: Some(tracklet.id.clone()),
            scores,
        }
    }
}

/// Fake attribute recognizer.
///
/// Accepts tracklets inline or as bulk store URLs of saved tracklets.
pub struct FakeAttrRecognizer {
    storage: Arc<dyn ObjectStorage>,
    model: Singleton<AttrModel>,
}

impl FakeAttrRecognizer {
    pub fn new(storage: Arc<dyn ObjectStorage>) -> Self {
        Self {
            storage,
            model: Singleton::new("attr-recog-model", || AttrModel {
                attributes: vec!["gender-male", "age-adult", "backpack", "hat", "long-hair"],
            }),
        }
    }
}

#[async_trait]
impl Stage for FakeAttrRecognizer {
    fn name(&self) -> &str {
        stages::ATTR_RECOG
    }

    fn input_ports(&self) -> Vec<Port> {
        vec![ports::tracklet_for_attr_recog()]
    }

    async fn process(&self, ctx: &StageContext, payload: &Payload) -> Result<Vec<Payload>, StageError> {
        let tracklet = match payload {
            Payload::Tracklet(t) => t.clone(),
            Payload::Url(url) => load_tracklet(self.storage.as_ref(), url).await?,
            other => return Err(unexpected(self.name(), other)),
        };
        let model = self
            .model
            .get()
            .map_err(|e| StageError::Fatal(e.to_string()))?;

        debug!(task_id = %ctx.task_id, tracklet = %tracklet.id, "Recognizing attributes");
        Ok(vec![Payload::Attributes(model.recognize(&tracklet))])
    }
}

/// Fake re-identification feature extractor
#[derive(Debug, Default)]
/// Embedding weights shared by every feature extractor in the process
struct ReidModel {
    offsets: Vec<f32>,
}

impl ReidModel {
    fn load(dimension: usize) -> Self {
        info!(dimension, "Loading re-id feature model");
        Self {
            offsets: (0..dimension).map(|i| i as f32).collect(),
        }
    }

    fn embed(&self, tracklet: &Tracklet) -> Vec<f32> {
        let base = tracklet.id.serial_number as f32;
        let dimension = self.offsets.len() as f32;
        self.offsets.iter().map(|o| (base + o) / dimension).collect()
    }
}

/// Fake re-id feature extractor backed by a process-wide model
pub struct FakeReidFeatureExtractor;

impl FakeReidFeatureExtractor {
    pub const DIMENSION: usize = 8;

    /// Registry name of the shared model
    pub const MODEL: &'static str = "reid-feature-model";
}

#[async_trait]
impl Stage for FakeReidFeatureExtractor {
    fn name(&self) -> &str {
        stages::REID_FEATURE
    }

    fn input_ports(&self) -> Vec<Port> {
        vec![ports::tracklet_for_reid_feature()]
    }

    async fn process(&self, _ctx: &StageContext, payload: &Payload) -> Result<Vec<Payload>, StageError> {
        let Payload::Tracklet(tracklet) = payload else {
            return Err(unexpected(self.name(), payload));
        };
        let model = ResourceRegistry::global()
            .get_or_init(Self::MODEL, || Ok(ReidModel::load(Self::DIMENSION)))
            .map_err(|err| StageError::Fatal(err.to_string()))?;
        Ok(vec![Payload::Feature(Feature {
            tracklet_id: Some(tracklet.id.clone()),
            vector: model.embed(tracklet),
        })])
    }
}

#[derive(Default)]
struct PendingPedestrian {
    tracklet: Option<Tracklet>,
    attributes: Option<Attributes>,
}

/// Fake re-identification ranker.
///
/// Takes either a joined tracklet and attributes, or the two separately on
/// their own ports. Separate halves are buffered per task and tracklet until
/// both have arrived.
pub struct FakeReidRanker {
    storage: Arc<dyn ObjectStorage>,
    pending: Mutex<HashMap<(String, TrackletId), PendingPedestrian>>,
}

impl FakeReidRanker {
    pub const CANDIDATES: i32 = 3;

    pub fn new(storage: Arc<dyn ObjectStorage>) -> Self {
        Self {
            storage,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Pedestrians waiting for their other half
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn rank(tracklet: &Tracklet, attributes: &Attributes) -> IdRank {
        let offset = attributes.scores.len() as i32;
        let candidates = (1..=Self::CANDIDATES)
            .map(|k| TrackletId::new(tracklet.id.video_id.clone(), tracklet.id.serial_number + offset + k))
            .collect();
        IdRank {
            query: tracklet.id.clone(),
            candidates,
        }
    }

    fn join(
        &self,
        task_id: &str,
        id: TrackletId,
        tracklet: Option<Tracklet>,
        attributes: Option<Attributes>,
    ) -> Vec<Payload> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let key = (task_id.to_string(), id);
        let entry = pending.entry(key.clone()).or_default();
        if tracklet.is_some() {
            entry.tracklet = tracklet;
        }
        if attributes.is_some() {
            entry.attributes = attributes;
        }

        match (&entry.tracklet, &entry.attributes) {
            (Some(t), Some(a)) => {
                let rank = Self::rank(t, a);
                pending.remove(&key);
                vec![Payload::IdRank(rank)]
            }
            _ => Vec::new(),
        }
    }
}

#[async_trait]
impl Stage for FakeReidRanker {
    fn name(&self) -> &str {
        stages::REID
    }

    fn input_ports(&self) -> Vec<Port> {
        vec![
            ports::tracklet_for_reid(),
            ports::attr_for_reid(),
            ports::tracklet_attr_for_reid(),
        ]
    }

    async fn process(&self, ctx: &StageContext, payload: &Payload) -> Result<Vec<Payload>, StageError> {
        match payload {
            Payload::PedestrianInfo(info) => {
                Ok(vec![Payload::IdRank(Self::rank(&info.tracklet, &info.attributes))])
            }
            Payload::Tracklet(t) => Ok(self.join(&ctx.task_id, t.id.clone(), Some(t.clone()), None)),
            Payload::Url(url) => {
                let t = load_tracklet(self.storage.as_ref(), url).await?;
                Ok(self.join(&ctx.task_id, t.id.clone(), Some(t), None))
            }
            Payload::Attributes(a) => {
                let id = a.tracklet_id.clone().ok_or_else(|| {
                    StageError::InvalidInput("attributes without a tracklet id".to_string())
                })?;
                Ok(self.join(&ctx.task_id, id, None, Some(a.clone())))
            }
            other => Err(unexpected(self.name(), other)),
        }
    }
}

/// Writes each received result to the bulk store as JSON
pub struct SavingStage {
    name: &'static str,
    port: Port,
    storage: Arc<dyn ObjectStorage>,
}

impl SavingStage {
    pub fn tracklets(storage: Arc<dyn ObjectStorage>) -> Self {
        Self {
            name: stages::TRACKLET_SAVING,
            port: ports::tracklet_for_saving(),
            storage,
        }
    }

    pub fn attributes(storage: Arc<dyn ObjectStorage>) -> Self {
        Self {
            name: stages::ATTR_SAVING,
            port: ports::attr_for_saving(),
            storage,
        }
    }

    pub fn idranks(storage: Arc<dyn ObjectStorage>) -> Self {
        Self {
            name: stages::IDRANK_SAVING,
            port: ports::idrank_for_saving(),
            storage,
        }
    }

    pub fn reid_features(storage: Arc<dyn ObjectStorage>) -> Self {
        Self {
            name: stages::REID_FEATURE_SAVING,
            port: ports::reid_feature_for_saving(),
            storage,
        }
    }

    fn missing_id() -> StageError {
        StageError::InvalidInput("result without a tracklet id".to_string())
    }
}

#[async_trait]
impl Stage for SavingStage {
    fn name(&self) -> &str {
        self.name
    }

    fn input_ports(&self) -> Vec<Port> {
        vec![self.port.clone()]
    }

    async fn process(&self, ctx: &StageContext, payload: &Payload) -> Result<Vec<Payload>, StageError> {
        let (key, bytes) = match payload {
            Payload::Tracklet(t) => (keys::tracklet(&t.id), serde_json::to_vec(t)),
            Payload::Attributes(a) => {
                let id = a.tracklet_id.as_ref().ok_or_else(Self::missing_id)?;
                (keys::attributes(id), serde_json::to_vec(a))
            }
            Payload::IdRank(r) => (keys::idrank(&r.query), serde_json::to_vec(r)),
            Payload::Feature(f) => {
                let id = f.tracklet_id.as_ref().ok_or_else(Self::missing_id)?;
                (keys::reid_feature(id), serde_json::to_vec(f))
            }
            other => return Err(unexpected(self.name, other)),
        };
        let bytes = bytes.map_err(|e| StageError::Fatal(e.to_string()))?;

        self.storage
            .store_file(&key, &bytes)
            .await
            .map_err(storage_error)?;
        debug!(task_id = %ctx.task_id, key = %key, "Saved result");
        Ok(Vec::new())
    }
}

/// Every stand-in stage, ready to host in one demultiplexer
pub fn all_stages(storage: Arc<dyn ObjectStorage>, max_samples: usize) -> Vec<Arc<dyn Stage>> {
    vec![
        Arc::new(FakeTracker::new(Arc::clone(&storage), max_samples)),
        Arc::new(FakeAttrRecognizer::new(Arc::clone(&storage))),
        Arc::new(FakeReidFeatureExtractor),
        Arc::new(FakeReidRanker::new(Arc::clone(&storage))),
        Arc::new(SavingStage::tracklets(Arc::clone(&storage))),
        Arc::new(SavingStage::attributes(Arc::clone(&storage))),
        Arc::new(SavingStage::idranks(Arc::clone(&storage))),
        Arc::new(SavingStage::reid_features(storage)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use video_pipeline_common::{DataKind, PedestrianInfo};
    use video_pipeline_storage::InMemoryObjectStorage;

    fn ctx(port: Port, exec_param: Option<&str>) -> StageContext {
        StageContext {
            task_id: "T1".to_string(),
            node: "node".to_string(),
            port,
            exec_param: exec_param.map(|p| serde_json::Value::String(p.to_string())),
            tag: None,
        }
    }

    fn tracklet(serial: i32) -> Tracklet {
        Tracklet::new(TrackletId::new("cam1", serial), 0)
    }

    #[tokio::test]
    async fn test_tracker_uses_broadcast_conf() {
        let storage = Arc::new(InMemoryObjectStorage::new());
        storage
            .store_file(
                "conf/tracking/cam1.conf",
                br#"{"tracklets": 2, "frames_per_tracklet": 30}"#,
            )
            .await
            .unwrap();
        let tracker = FakeTracker::new(storage, 5);

        let out = tracker
            .process(
                &ctx(ports::video_url_for_tracking(), Some("cam1.conf")),
                &Payload::Url("videos/cam1.mp4".into()),
            )
            .await
            .unwrap();

        assert_eq!(out.len(), 2);
        let Payload::Tracklet(t) = &out[1] else {
            panic!("expected a tracklet");
        };
        assert_eq!(t.id, TrackletId::new("cam1", 1));
        assert_eq!(t.num_tracklets, 2);
        assert_eq!(t.samples.len(), 5);

        // Second task reuses the loaded pool
        tracker
            .process(
                &ctx(ports::video_url_for_tracking(), None),
                &Payload::Url("videos/cam2.mp4".into()),
            )
            .await
            .unwrap();
        assert_eq!(tracker.confs.loads(), 1);
    }

    #[tokio::test]
    async fn test_tracker_rejects_non_url() {
        let tracker = FakeTracker::new(Arc::new(InMemoryObjectStorage::new()), 5);
        let err = tracker
            .process(&ctx(ports::video_url_for_tracking(), None), &Payload::Blob(vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_attr_recognizer_loads_saved_tracklet() {
        let storage = Arc::new(InMemoryObjectStorage::new());
        let saved = tracklet(4);
        storage
            .store_file(&keys::tracklet(&saved.id), &serde_json::to_vec(&saved).unwrap())
            .await
            .unwrap();
        let recognizer = FakeAttrRecognizer::new(storage);

        let out = recognizer
            .process(
                &ctx(ports::tracklet_for_attr_recog(), None),
                &Payload::Url(keys::tracklet(&saved.id)),
            )
            .await
            .unwrap();
        let Payload::Attributes(attrs) = &out[0] else {
            panic!("expected attributes");
        };
        assert_eq!(attrs.tracklet_id.as_ref(), Some(&saved.id));
        assert_eq!(attrs.scores.len(), 5);

        let missing = recognizer
            .process(
                &ctx(ports::tracklet_for_attr_recog(), None),
                &Payload::Url("tracklets/none/0".into()),
            )
            .await;
        assert!(missing.is_err());
    }

    #[tokio::test]
    async fn test_feature_extractor_shares_registered_model() {
        let extractor = FakeReidFeatureExtractor;
        let port = ports::tracklet_for_reid_feature();

        let out = extractor
            .process(&ctx(port.clone(), None), &Payload::Tracklet(tracklet(4)))
            .await
            .unwrap();
        assert!(ResourceRegistry::global().contains(FakeReidFeatureExtractor::MODEL));

        let Payload::Feature(feature) = &out[0] else {
            panic!("expected a feature, got {out:?}");
        };
        assert_eq!(feature.vector.len(), FakeReidFeatureExtractor::DIMENSION);
        assert_eq!(feature.vector[0], 0.5);
        assert_eq!(feature.tracklet_id, Some(TrackletId::new("cam1", 4)));

        let again = FakeReidFeatureExtractor
            .process(&ctx(port, None), &Payload::Tracklet(tracklet(4)))
            .await
            .unwrap();
        assert_eq!(again, out);
    }

    #[tokio::test]
    async fn test_ranker_joins_halves() {
        let ranker = FakeReidRanker::new(Arc::new(InMemoryObjectStorage::new()));
        let t = tracklet(1);
        let attrs = Attributes {
            tracklet_id: Some(t.id.clone()),
            ..Attributes::default()
        };

        let first = ranker
            .process(&ctx(ports::tracklet_for_reid(), None), &Payload::Tracklet(t.clone()))
            .await
            .unwrap();
        assert!(first.is_empty());
        assert_eq!(ranker.pending(), 1);

        let second = ranker
            .process(&ctx(ports::attr_for_reid(), None), &Payload::Attributes(attrs))
            .await
            .unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].kind(), Some(DataKind::IdRank));
        assert_eq!(ranker.pending(), 0);
    }

    #[tokio::test]
    async fn test_ranker_accepts_joined_input() {
        let ranker = FakeReidRanker::new(Arc::new(InMemoryObjectStorage::new()));
        let info = PedestrianInfo {
            tracklet: tracklet(2),
            attributes: Attributes::default(),
        };
        let out = ranker
            .process(&ctx(ports::tracklet_attr_for_reid(), None), &Payload::PedestrianInfo(info))
            .await
            .unwrap();
        let Payload::IdRank(rank) = &out[0] else {
            panic!("expected an id rank");
        };
        assert_eq!(rank.query, TrackletId::new("cam1", 2));
        assert_eq!(rank.candidates.len(), FakeReidRanker::CANDIDATES as usize);
    }

    #[tokio::test]
    async fn test_saving_stage_writes_json() {
        let storage = Arc::new(InMemoryObjectStorage::new());
        let saver = SavingStage::tracklets(storage.clone());
        let t = tracklet(9);

        let out = saver
            .process(&ctx(ports::tracklet_for_saving(), None), &Payload::Tracklet(t.clone()))
            .await
            .unwrap();
        assert!(out.is_empty());

        let bytes = storage.retrieve_file("tracklets/cam1/9").await.unwrap();
        let saved: Tracklet = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(saved, t);

        let err = SavingStage::attributes(storage)
            .process(
                &ctx(ports::attr_for_saving(), None),
                &Payload::Attributes(Attributes::default()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::InvalidInput(_)));
    }

    #[test]
    fn test_all_stages_have_distinct_ports() {
        let stages = all_stages(Arc::new(InMemoryObjectStorage::new()), 4);
        let mut ports: Vec<Port> = stages.iter().flat_map(|s| s.input_ports()).collect();
        let total = ports.len();
        ports.sort_by_key(|p| p.to_string());
        ports.dedup();
        assert_eq!(ports.len(), total);
        assert_eq!(stages.len(), 8);
    }
}
