pub mod application;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod executions;
pub mod processes;
pub mod stats;
pub mod steps;
pub mod types;
pub mod workflow_state;

// Re-export main types
pub use types::*;

pub use application::{initialize, Application, InitBuilder, InitOptions};
pub use error::{EngineError, EngineResult};
pub use executions::{CreateExecution, ExecutionService};
pub use processes::ProcessService;
pub use stats::{ExecutionStats, StatsService, TimeRange};
