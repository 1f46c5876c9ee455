//! Run lifecycle: persisted records, the single-run lease, and the background
//! execution path.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::container::ContainerError;

mod orchestrator;
mod store;

pub use orchestrator::{log_file_name, LatestLog, RunOrchestrator, RunSettings};
pub use store::{RunCompletion, RunStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }

    /// Exit code 0 is the only successful outcome.
    pub fn from_exit_code(exit_code: i64) -> Self {
        if exit_code == 0 {
            Self::Success
        } else {
            Self::Failed
        }
    }
}

/// One execution attempt of the external tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    pub started_at: i64,
    pub finished_at: Option<i64>,
    pub status: RunStatus,
    pub duration_sec: Option<i64>,
    pub trigger: String,
    pub log_file: Option<String>,
    pub exit_code: Option<i64>,
    pub error: Option<String>,
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("a run is already in progress")]
    Conflict,
    #[error("{0}")]
    NotFound(String),
    #[error(transparent)]
    ExternalTool(#[from] ContainerError),
    #[error("log I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0:#}")]
    Internal(#[from] anyhow::Error),
}
