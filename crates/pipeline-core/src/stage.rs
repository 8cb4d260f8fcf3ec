//! Stage trait: the contract pluggable algorithms implement

use crate::context::StageContext;
use crate::error::StageError;
use crate::payload::Payload;
use async_trait::async_trait;
use video_pipeline_common::Port;

/// A pluggable processing stage.
///
/// A stage declares the ports it consumes. For each envelope arriving on one
/// of them the runtime calls [`Stage::process`], possibly several times when
/// it fails transiently, so implementations must tolerate repeated calls
/// for the same input.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Unique stage identifier
    fn name(&self) -> &str;

    /// Ports this stage consumes
    fn input_ports(&self) -> Vec<Port>;

    /// Run the algorithm on one input.
    ///
    /// Each returned payload is fanned out over every output edge of the
    /// node; an empty result publishes nothing.
    async fn process(&self, ctx: &StageContext, payload: &Payload) -> Result<Vec<Payload>, StageError>;
}
