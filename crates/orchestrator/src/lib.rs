//! Video Pipeline Orchestrator
//!
//! Plans user commands into stage topologies, submits one task per video and
//! provides stand-in stages so whole topologies can run in one process.

pub mod debug;
pub mod handler;
pub mod planner;

pub use handler::{command_envelope, submit_command, CommandHandler, HandlerError};
pub use planner::{plan_command, CommandType, EntryInput, PlanningError, Topology};
