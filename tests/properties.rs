//! Invariants of plans, envelopes, retries and shared resources

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use video_pipeline::common::{
    Attributes, BoundingBox, CommandParams, DataKind, Feature, IdRank, PedestrianInfo, Port,
    TermSignal, Tracklet, TrackletId,
};
use video_pipeline::pipeline::{
    BackoffPolicy, ExecutionPlan, Payload, PayloadRef, PlanError, RobustExecutor, Singleton,
    SpillFormat, StageError, TaskEnvelope,
};

fn two_node_plan() -> (ExecutionPlan, Port) {
    let mut plan = ExecutionPlan::new();
    let a = plan.add_named_node("tracking", DataKind::Tracklet, Some(serde_json::json!("cam.conf")));
    let b = plan.add_named_node("saving", DataKind::NoOutput, None);
    let a_in = plan
        .create_input_port(a, Port::new("video-for-tracking", DataKind::Url))
        .unwrap();
    let b_in = plan
        .create_input_port(b, Port::new("tracklet-for-saving", DataKind::Tracklet))
        .unwrap();
    plan.output_to(a, b_in).unwrap();
    (plan, a_in)
}

#[test]
fn executed_flag_flips_at_most_once() {
    let (mut plan, _) = two_node_plan();
    assert!(plan.mark_executed(0).unwrap());
    assert!(!plan.mark_executed(0).unwrap());
    assert!(plan.node(0).unwrap().executed());
    assert!(!plan.node(1).unwrap().executed());
}

#[test]
fn change_current_node_rejects_unbound_port() {
    let (plan, a_in) = two_node_plan();
    let mut envelope = TaskEnvelope::new("T1", plan, vec![a_in], Payload::Url("u".into())).unwrap();
    let stray = Port::new("nobody", DataKind::Attributes);

    assert_eq!(
        envelope.change_current_node(stray.clone()),
        Err(PlanError::PortUnbound(stray))
    );
}

#[test]
fn envelope_round_trips_every_payload_variant() {
    let id = TrackletId::new("cam1", 4);
    let mut tracklet = Tracklet::new(id.clone(), 12);
    tracklet.samples.push(BoundingBox {
        x: 1,
        y: 2,
        width: 3,
        height: 4,
        patch_data: vec![9, 8, 7],
    });
    let mut attributes = Attributes {
        tracklet_id: Some(id.clone()),
        ..Attributes::default()
    };
    attributes.scores.insert("backpack".into(), 0.75);

    let payloads = vec![
        Payload::Url("video://cam1/clip1".into()),
        Payload::Tracklet(tracklet.clone()),
        Payload::Attributes(attributes.clone()),
        Payload::Feature(Feature {
            tracklet_id: Some(id.clone()),
            vector: vec![0.5, -1.25],
        }),
        Payload::IdRank(IdRank {
            query: id.clone(),
            candidates: vec![TrackletId::new("cam2", 1)],
        }),
        Payload::PedestrianInfo(PedestrianInfo {
            tracklet,
            attributes,
        }),
        Payload::Command(CommandParams::new("track").with_param("video-url", "videos/")),
        Payload::Terminate(TermSignal {
            task_id: "T9".into(),
        }),
        Payload::Blob(vec![0, 255, 1]),
        Payload::Reference(PayloadRef {
            path: "T1/tracking".into(),
            format: SpillFormat::Json,
            size: 42,
        }),
    ];

    for payload in payloads {
        let (mut plan, a_in) = two_node_plan();
        plan.mark_executed(0).unwrap();
        let mut envelope = TaskEnvelope::new("T1", plan, vec![a_in], payload)
            .unwrap()
            .with_tag("track");
        envelope.lineage = "tracking#2".into();

        let bytes = envelope.to_bytes().unwrap();
        let decoded = TaskEnvelope::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, envelope);
        assert_eq!(decoded.to_bytes().unwrap(), bytes);
    }
}

#[tokio::test]
async fn always_failing_work_runs_max_attempts_times() {
    const MAX_ATTEMPTS: u32 = 4;
    let executor = RobustExecutor::new(MAX_ATTEMPTS, BackoffPolicy::none());
    let invocations = AtomicUsize::new(0);

    let result: Result<(), StageError> = executor
        .execute("always failing", || async {
            let n = invocations.fetch_add(1, Ordering::SeqCst) + 1;
            Err(StageError::Transient(format!("failure {n}")))
        })
        .await;

    assert_eq!(invocations.load(Ordering::SeqCst), MAX_ATTEMPTS as usize);
    assert_eq!(result, Err(StageError::Transient(format!("failure {MAX_ATTEMPTS}"))));
}

#[tokio::test]
async fn fatal_errors_are_not_retried() {
    let executor = RobustExecutor::new(5, BackoffPolicy::none());
    let invocations = AtomicUsize::new(0);

    let result: Result<(), StageError> = executor
        .execute("fatal", || async {
            invocations.fetch_add(1, Ordering::SeqCst);
            Err(StageError::Fatal("model missing".into()))
        })
        .await;

    assert!(result.is_err());
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
}

#[test]
fn singleton_factory_runs_once_under_contention() {
    const THREADS: usize = 32;
    let built = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&built);
    let singleton = Arc::new(Singleton::new("detector", move || {
        counter.fetch_add(1, Ordering::SeqCst);
        thread::sleep(std::time::Duration::from_millis(10));
        vec![1.0f32; 1024]
    }));
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let singleton = Arc::clone(&singleton);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                singleton.get().unwrap()
            })
        })
        .collect();
    let instances: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(built.load(Ordering::SeqCst), 1);
    assert!(instances.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
}
