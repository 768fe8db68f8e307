use serde::{Deserialize, Serialize};

pub mod runner;

pub use runner::{run_test, EngineEvent, EngineHandle};

/// Current operational status of the test engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineStatus {
    /// Engine is idle and waiting for a configuration to execute.
    #[default]
    Idle,
    /// Engine is actively running a test.
    Running,
    /// Engine has been signalled to stop but has not yet finished.
    Stopping,
    /// Engine has completed execution.
    Completed,
    /// Engine encountered a fatal error during execution.
    Error,
}

impl std::fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EngineStatus::Idle => "idle",
            EngineStatus::Running => "running",
            EngineStatus::Stopping => "stopping",
            EngineStatus::Completed => "completed",
            EngineStatus::Error => "error",
        };
        write!(f, "{s}")
    }
}
