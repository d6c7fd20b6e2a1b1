//! External CI system interface.
//!
//! The coordinator only needs three things from CI: dispatch a run, ask how
//! it is doing, and fetch its result artifacts once it is done.

pub mod artifacts;
pub mod github;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{ChannelError, DispatchError};
use crate::model::{RequestId, SubjectId};

pub use artifacts::{parse_artifacts, Artifact, ArtifactError};
pub use github::GitHubActions;

/// Handle to a dispatched CI run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunHandle {
    /// CI-side run identifier.
    pub run_id: u64,
    /// Browser URL of the run, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html_url: Option<String>,
}

impl RunHandle {
    /// Create a handle without a URL.
    pub fn new(run_id: u64) -> Self {
        Self {
            run_id,
            html_url: None,
        }
    }
}

/// Coarse lifecycle of a CI run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Queued,
    InProgress,
    Completed,
}

impl RunState {
    /// Map a CI status label onto a run state. Unknown labels count as queued.
    pub fn from_label(label: &str) -> Self {
        match label {
            "completed" => RunState::Completed,
            "in_progress" => RunState::InProgress,
            _ => RunState::Queued,
        }
    }
}

/// Result of a run-status query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStatus {
    pub state: RunState,
    /// CI conclusion once completed (`success`, `failure`, `cancelled`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conclusion: Option<String>,
}

impl RunStatus {
    /// Returns true once the run has finished, whatever its conclusion.
    pub fn is_completed(&self) -> bool {
        self.state == RunState::Completed
    }
}

/// Payload sent along with a workflow dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchRequest {
    pub request_id: RequestId,
    pub subject_id: SubjectId,
    pub test_case_ids: Vec<String>,
    /// Where the workflow should post results.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
}

/// The external CI system.
#[async_trait]
pub trait CiSystem: Send + Sync {
    /// Start a run for the given request and return its handle.
    async fn dispatch_workflow(&self, request: &DispatchRequest) -> Result<RunHandle, DispatchError>;

    /// Query the current status of a run.
    async fn run_status(&self, run: &RunHandle) -> Result<RunStatus, ChannelError>;

    /// Fetch the raw result artifacts of a finished run.
    async fn run_artifacts(&self, run: &RunHandle) -> Result<Vec<Artifact>, ChannelError>;
}
