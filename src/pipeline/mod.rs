pub mod orchestrator;
pub mod stages;
pub mod types;

pub use orchestrator::{Orchestrator, RunError, RunRequest};
pub use types::{ErrorCode, FinalResult, RunOutcome, StageName, StageRecord};
