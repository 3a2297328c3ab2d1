//! Continuous evaluation of published solution images against a benchmark
//! harness, reporting progress and results to a remote controller.

pub mod compose;
pub mod config;
pub mod controller;
pub mod driver;
mod fsutil;
pub mod image;
pub mod ledger;
pub mod lifecycle;
pub mod orchestrator;
pub mod results;

#[cfg(test)]
mod testing;

pub use compose::{ComposeTemplate, CompositionRenderer};
pub use config::{BenchmarkSettings, ConfigError, ControllerSettings, ManagerConfig};
pub use controller::{
    Controller, ControllerClient, ControllerError, Delivery, RunState, Schedule, ScheduleStatus,
};
pub use driver::{CompositionRun, RunEvent, RunExit};
pub use image::{IdentifierMode, ImageRef};
pub use ledger::{RetryLedger, Verdict};
pub use lifecycle::{ContainerRuntime, DockerCli, ImageLifecycle, PreparedImage};
pub use orchestrator::{ImageOutcome, Orchestrator, OutputSink, RoundReport};
pub use results::{ExecutionResult, ResultExtractor, ResultReport};
