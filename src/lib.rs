//! Video Pipeline - distributed video-analytics pipeline platform
//!
//! The root package only re-exports the workspace crates so the end-to-end
//! tests under `tests/` can reach them through one path.

pub use video_pipeline_common as common;
pub use video_pipeline_core as pipeline;
pub use video_pipeline_orchestrator as orchestrator;
pub use video_pipeline_storage as storage;
