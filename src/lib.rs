pub mod api;
pub mod config;
pub mod models;
pub mod pipeline;
pub mod services;
pub mod validation;

pub use pipeline::{FinalResult, Orchestrator, RunRequest};
pub use services::*;
pub use validation::*;
