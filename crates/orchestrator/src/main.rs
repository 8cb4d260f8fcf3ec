/// Demo binary: runs every stand-in stage and the command handler in one process
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use video_pipeline_common::CommandParams;
use video_pipeline_core::{Demultiplexer, InMemoryBus, WorkerConfig, WorkerContext};
use video_pipeline_orchestrator::debug::{all_stages, FakeTracker};
use video_pipeline_orchestrator::planner::params;
use video_pipeline_orchestrator::{submit_command, CommandHandler, CommandType};
use video_pipeline_storage::ObjectStorage;

const DEMO_VIDEOS: [&str; 2] = ["videos/CAM01-20170101.mp4", "videos/CAM02-20170101.mp4"];
const DEMO_CONF: &str = "isee-basic.conf";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("video_pipeline=info")),
        )
        .init();

    info!("Video Pipeline v{}", env!("CARGO_PKG_VERSION"));

    let args: Vec<String> = std::env::args().collect();
    let command: CommandType = match args.get(1) {
        Some(name) => name.parse()?,
        None => CommandType::TrackAttrRecogReid,
    };

    let mut config = WorkerConfig::default();
    config.apply_env_overrides();
    config.validate()?;

    let storage = config.storage.build().await?;
    for video in DEMO_VIDEOS {
        storage.store_file(video, b"demo video").await?;
    }
    storage
        .store_file(
            &format!("{}{}", FakeTracker::CONF_PREFIX, DEMO_CONF),
            br#"{"tracklets": 4, "frames_per_tracklet": 50}"#,
        )
        .await?;

    let bus = Arc::new(InMemoryBus::new(config.bus.max_message_bytes));
    let worker = WorkerContext::new(bus, Arc::clone(&storage), &config);

    let mut demux = Demultiplexer::new(worker.clone());
    for stage in all_stages(Arc::clone(&storage), config.max_tracklet_samples) {
        demux.add_stage(stage);
    }
    let demux = Arc::new(demux);
    let handler = Arc::new(CommandHandler::new(worker.clone()));

    let (stop_tx, stop_rx) = watch::channel(false);
    let stopped = |mut rx: watch::Receiver<bool>| async move {
        let _ = rx.wait_for(|stop| *stop).await;
    };

    let stage_subscription = demux.subscribe().await?;
    let command_subscription = handler.subscribe().await?;
    let stages = tokio::spawn(Arc::clone(&demux).serve(stage_subscription, stopped(stop_rx.clone())));
    let commands = tokio::spawn(Arc::clone(&handler).serve(command_subscription, stopped(stop_rx)));

    let params = CommandParams::new(command.as_str())
        .with_param(params::VIDEO_URL, "videos/")
        .with_param(params::TRACKING_CONF_FILE, DEMO_CONF)
        .with_param(params::TRACKLET_INDEX, "0");
    submit_command(&worker, params).await?;

    tokio::time::sleep(Duration::from_secs(2)).await;
    if stop_tx.send(true).is_err() {
        warn!("Workers already stopped");
    }
    stages.await?;
    commands.await?;

    println!("\n=== Processing Results ===");
    println!("Command: {command}");
    for runtime in demux.runtimes() {
        println!("{}: {}", runtime.name(), serde_json::to_string(&runtime.stats())?);
    }
    for prefix in ["tracklets/", "attributes/", "idranks/", "reid-features/"] {
        println!("{prefix} {} files", storage.list_files(prefix).await?.len());
    }

    Ok(())
}
