//! End-to-end scenarios of the pipeline substrate
//!
//! Run: cargo test --test scenarios

mod common;

use common::{memory_storage, worker, FixedStage};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use video_pipeline::common::{DataKind, Port, Tracklet, TrackletId};
use video_pipeline::pipeline::{
    BackoffPolicy, BusMessage, Demultiplexer, ExecutionPlan, HandleOutcome, InMemoryBus, Payload,
    RobustExecutor, StageError, StageRuntime, TaskEnvelope,
};

fn tr1() -> Payload {
    Payload::Tracklet(Tracklet::new(TrackletId::new("TR1", 0), 0))
}

#[tokio::test]
async fn fan_out_reaches_every_downstream_port() {
    let mut plan = ExecutionPlan::new();
    let a = plan.add_named_node("NodeA", DataKind::Tracklet, None);
    let b = plan.add_named_node("NodeB", DataKind::Attributes, None);
    let c = plan.add_named_node("NodeC", DataKind::IdRank, None);
    let a_in = plan
        .create_input_port(a, Port::new("NodeA-video", DataKind::Url))
        .unwrap();
    let b_in = plan
        .create_input_port(b, Port::new("NodeB-attr-recog", DataKind::Tracklet))
        .unwrap();
    let c_in = plan
        .create_input_port(c, Port::new("NodeC-reid", DataKind::Tracklet))
        .unwrap();
    plan.output_to(a, b_in.clone()).unwrap();
    plan.output_to(a, c_in.clone()).unwrap();
    plan.validate().unwrap();

    let bus = Arc::new(InMemoryBus::new(1_000_000));
    let stage = FixedStage::new("NodeA", a_in.clone(), vec![tr1()]);
    let runtime = StageRuntime::new(stage.clone(), worker(Arc::clone(&bus), memory_storage()));

    let envelope = TaskEnvelope::new(
        "T1",
        plan,
        vec![a_in],
        Payload::Url("video://cam1/clip1".into()),
    )
    .unwrap();
    let outcomes = runtime.handle(&envelope, "url").await;
    assert_eq!(
        outcomes,
        vec![HandleOutcome::Completed {
            published: 2,
            spilled: 0
        }]
    );

    let published: Vec<TaskEnvelope> = bus
        .published_on("tracklet")
        .iter()
        .map(|m| TaskEnvelope::from_bytes(&m.bytes).unwrap())
        .collect();
    assert_eq!(published.len(), 2);
    assert_eq!(published[0].destinations, vec![b_in]);
    assert_eq!(published[1].destinations, vec![c_in]);
    for env in &published {
        assert_eq!(env.task_id, "T1");
        assert_eq!(env.payload, tr1());
        assert!(env.plan.node(a).unwrap().executed());
        assert!(!env.plan.node(b).unwrap().executed());
    }
    assert_eq!(stage.calls(), 1);
}

#[tokio::test]
async fn oversize_payload_is_offloaded_and_resolved() {
    const ORIGINAL_SIZE: usize = 2_000_000;

    let mut plan = ExecutionPlan::new();
    let a = plan.add_named_node("NodeA", DataKind::FrameArray, None);
    let b = plan.add_named_node("NodeB", DataKind::NoOutput, None);
    let a_in = plan
        .create_input_port(a, Port::new("NodeA-video", DataKind::Url))
        .unwrap();
    let b_in = plan
        .create_input_port(b, Port::new("NodeB-frames", DataKind::FrameArray))
        .unwrap();
    plan.output_to(a, b_in.clone()).unwrap();

    let bus = Arc::new(InMemoryBus::new(1_000_000));
    let storage = memory_storage();
    let original = vec![0xA5u8; ORIGINAL_SIZE];
    let stage = FixedStage::new("NodeA", a_in.clone(), vec![Payload::Blob(original.clone())]);
    let worker = worker(Arc::clone(&bus), Arc::clone(&storage));
    let runtime = StageRuntime::new(stage, worker.clone());

    let envelope = TaskEnvelope::new("T1", plan, vec![a_in], Payload::Url("video://cam1/clip1".into())).unwrap();
    let outcomes = runtime.handle(&envelope, "url").await;
    assert_eq!(
        outcomes,
        vec![HandleOutcome::Completed {
            published: 1,
            spilled: 1
        }]
    );
    assert_eq!(bus.rejected(), 1);

    let message = &bus.published_on("frame-array")[0];
    assert!(message.bytes.len() <= 1_000_000);
    let downstream = TaskEnvelope::from_bytes(&message.bytes).unwrap();
    assert_eq!(downstream.destinations, vec![b_in]);
    let reference = downstream.payload.as_reference().unwrap();
    assert_eq!(reference.path, "T1/NodeA");
    assert_eq!(reference.size, ORIGINAL_SIZE as u64);

    assert_eq!(storage.retrieve_file("T1/NodeA").await.unwrap(), original);
    let resolved = worker
        .offloader
        .resolve(&worker.executor, downstream.payload)
        .await
        .unwrap();
    assert_eq!(resolved, Payload::Blob(original));
}

#[tokio::test]
async fn executor_succeeds_on_third_attempt() {
    let executor = RobustExecutor::new(3, BackoffPolicy::none());
    let invocations = AtomicU32::new(0);

    let result = executor
        .execute("flaky", || async {
            let attempt = invocations.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt < 3 {
                Err(StageError::Transient(format!("attempt {attempt} failed")))
            } else {
                Ok("done")
            }
        })
        .await;

    assert_eq!(result, Ok("done"));
    assert_eq!(invocations.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn demultiplexer_routes_only_to_destination_stage() {
    let s1_port = Port::new("S1", DataKind::Attributes);
    let s2_port = Port::new("S2", DataKind::Attributes);

    let mut plan = ExecutionPlan::new();
    let s1 = plan.add_named_node("S1", DataKind::NoOutput, None);
    let s2 = plan.add_named_node("S2", DataKind::NoOutput, None);
    plan.create_input_port(s1, s1_port.clone()).unwrap();
    plan.create_input_port(s2, s2_port.clone()).unwrap();

    let bus = Arc::new(InMemoryBus::new(1_000_000));
    let stage1 = FixedStage::new("S1", s1_port, Vec::new());
    let stage2 = FixedStage::new("S2", s2_port.clone(), Vec::new());
    let demux = Demultiplexer::new(worker(bus, memory_storage()))
        .with_stage(stage1.clone())
        .with_stage(stage2.clone());
    assert_eq!(demux.channels(), vec!["attributes", "term-sig"]);

    let envelope = TaskEnvelope::new("T1", plan, vec![s2_port], Payload::Url("x".into())).unwrap();
    let outcomes = demux
        .dispatch(BusMessage {
            channel: "attributes".into(),
            key: "T1".into(),
            bytes: envelope.to_bytes().unwrap(),
        })
        .await;

    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].0, "S2");
    assert_eq!(stage1.calls(), 0);
    assert_eq!(stage2.calls(), 1);
}
