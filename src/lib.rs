pub mod audit;
pub mod compaction;
pub mod config;
pub mod errors;
pub mod gates;
pub mod generate;
pub mod hosting;
pub mod metrics;
pub mod notify;
pub mod orchestrator;
pub mod phase;
pub mod review;
pub mod roster;

pub use errors::OrchestratorError;
pub use orchestrator::{Orchestrator, ProjectResult, RunStatus};
