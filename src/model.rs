//! Core data types shared by the coordinator, channels and reconciler.
//!
//! Everything here is plain data: identifiers, per-test-case results, the
//! request state machine's states and the reports handed back to callers.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};

/// Subject used when a run is started from a flat list of test cases.
pub const BULK_SUBJECT: &str = "bulk";

static REQUEST_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Opaque correlation token identifying one dispatched run across all channels.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Wrap an existing identifier (e.g. one received over the wire).
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Generate a fresh identifier of the form `exec-<millis>-<hex8>`.
    pub fn generate() -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let sequence = REQUEST_SEQUENCE.fetch_add(1, Ordering::Relaxed);

        let mut hasher = Sha256::new();
        hasher.update(timestamp_ms.to_le_bytes());
        hasher.update(std::process::id().to_le_bytes());
        hasher.update(sequence.to_le_bytes());
        let digest = hasher.finalize();

        Self(format!("exec-{}-{}", timestamp_ms, hex::encode(&digest[..4])))
    }

    /// Borrow the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The requirement (or bulk pseudo-subject) a run is executed on behalf of.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubjectId(String);

impl SubjectId {
    /// Wrap a requirement identifier.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The synthetic subject for runs started from a flat list of test cases.
    pub fn bulk() -> Self {
        Self(BULK_SUBJECT.to_string())
    }

    /// Borrow the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reported status of a single test case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    /// Not executed yet.
    NotStarted,
    /// Currently executing.
    Running,
    /// Executed and passed.
    Passed,
    /// Executed and failed.
    Failed,
    /// Could not be executed because of an external blocker.
    Blocked,
    /// Execution was cancelled.
    Cancelled,
}

impl TestStatus {
    /// Terminal statuses are never revised back to a non-terminal one.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TestStatus::Passed | TestStatus::Failed | TestStatus::Blocked | TestStatus::Cancelled
        )
    }

    /// Stable snake_case label, identical to the serialized form.
    pub fn label(&self) -> &'static str {
        match self {
            TestStatus::NotStarted => "not_started",
            TestStatus::Running => "running",
            TestStatus::Passed => "passed",
            TestStatus::Failed => "failed",
            TestStatus::Blocked => "blocked",
            TestStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Error returned when a status label is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown test status '{0}'")]
pub struct UnknownStatus(pub String);

impl FromStr for TestStatus {
    type Err = UnknownStatus;

    /// Parses the labels CI jobs and older payloads actually emit, case-insensitively.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase().replace(&['-', ' '][..], "_");
        match normalized.as_str() {
            "not_started" | "notstarted" | "pending" | "queued" | "idle" => Ok(TestStatus::NotStarted),
            "running" | "in_progress" | "started" => Ok(TestStatus::Running),
            "passed" | "pass" | "success" | "ok" => Ok(TestStatus::Passed),
            "failed" | "fail" | "failure" | "error" => Ok(TestStatus::Failed),
            "blocked" | "skipped" => Ok(TestStatus::Blocked),
            "cancelled" | "canceled" | "aborted" => Ok(TestStatus::Cancelled),
            _ => Err(UnknownStatus(value.to_string())),
        }
    }
}

impl<'de> Deserialize<'de> for TestStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// A reported outcome for one test case within one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    /// Test case identifier.
    #[serde(alias = "testCaseId", alias = "test_id", alias = "id")]
    pub test_case_id: String,
    /// Reported status.
    pub status: TestStatus,
    /// Execution duration in milliseconds.
    #[serde(default, alias = "durationMs", alias = "duration")]
    pub duration_ms: u64,
    /// Optional free-text log output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs: Option<String>,
    /// When this result was received locally.
    #[serde(default = "Utc::now", alias = "receivedAt")]
    pub received_at: DateTime<Utc>,
}

impl TestResult {
    /// Create a result received now.
    pub fn new(test_case_id: impl Into<String>, status: TestStatus) -> Self {
        Self {
            test_case_id: test_case_id.into(),
            status,
            duration_ms: 0,
            logs: None,
            received_at: Utc::now(),
        }
    }

    /// Set the execution duration.
    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    /// Attach log output.
    pub fn with_logs(mut self, logs: impl Into<String>) -> Self {
        self.logs = Some(logs.into());
        self
    }
}

/// Lifecycle state of an execution request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Idle,
    Dispatching,
    AwaitingResults,
    Polling,
    Completed,
    TimedOut,
    Cancelled,
    Failed,
}

impl ExecutionState {
    /// Returns true once the request can no longer change.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionState::Completed
                | ExecutionState::TimedOut
                | ExecutionState::Cancelled
                | ExecutionState::Failed
        )
    }

    /// Stable snake_case label.
    pub fn label(&self) -> &'static str {
        match self {
            ExecutionState::Idle => "idle",
            ExecutionState::Dispatching => "dispatching",
            ExecutionState::AwaitingResults => "awaiting_results",
            ExecutionState::Polling => "polling",
            ExecutionState::Completed => "completed",
            ExecutionState::TimedOut => "timed_out",
            ExecutionState::Cancelled => "cancelled",
            ExecutionState::Failed => "failed",
        }
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One mechanism by which results can be learned about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    /// Realtime push connection to the result relay.
    Push,
    /// On-demand queries against the relay's stored results.
    BackendPoll,
    /// CI run-status polling followed by artifact parsing.
    CiPoll,
    /// Synthetic results for demo mode.
    Simulated,
}

impl ChannelKind {
    /// Stable snake_case label.
    pub fn label(&self) -> &'static str {
        match self {
            ChannelKind::Push => "push",
            ChannelKind::BackendPoll => "backend_poll",
            ChannelKind::CiPoll => "ci_poll",
            ChannelKind::Simulated => "simulated",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Why a request is being cancelled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelReason {
    /// The caller asked for cancellation.
    Requested,
    /// A newer request for the same subject replaced this one.
    Superseded(RequestId),
}

impl CancelReason {
    /// The outcome reported to the caller for this cancellation.
    pub fn into_outcome(self) -> ExecutionOutcome {
        match self {
            CancelReason::Requested => ExecutionOutcome::Cancelled,
            CancelReason::Superseded(by) => ExecutionOutcome::Superseded { by },
        }
    }
}

/// Terminal outcome delivered exactly once per request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    /// Every requested test case reached a terminal status.
    Completed,
    /// Dispatch or result collection failed.
    Failed { reason: String },
    /// The absolute outer deadline elapsed.
    TimedOut,
    /// The caller cancelled the request.
    Cancelled,
    /// A newer request for the same subject replaced this one.
    Superseded { by: RequestId },
}

impl ExecutionOutcome {
    /// Convenience constructor for failures.
    pub fn failed(reason: impl Into<String>) -> Self {
        ExecutionOutcome::Failed {
            reason: reason.into(),
        }
    }

    /// The terminal request state corresponding to this outcome.
    pub fn state(&self) -> ExecutionState {
        match self {
            ExecutionOutcome::Completed => ExecutionState::Completed,
            ExecutionOutcome::Failed { .. } => ExecutionState::Failed,
            ExecutionOutcome::TimedOut => ExecutionState::TimedOut,
            ExecutionOutcome::Cancelled | ExecutionOutcome::Superseded { .. } => {
                ExecutionState::Cancelled
            }
        }
    }

    /// Returns true only for `Completed`.
    pub fn is_completed(&self) -> bool {
        matches!(self, ExecutionOutcome::Completed)
    }

    /// User-facing banner text, distinct per outcome.
    pub fn banner(&self) -> String {
        match self {
            ExecutionOutcome::Completed => "Execution completed".to_string(),
            ExecutionOutcome::Failed { reason } => format!("Execution failed: {}", reason),
            ExecutionOutcome::TimedOut => {
                "Execution timed out waiting for results".to_string()
            }
            ExecutionOutcome::Cancelled => "Execution cancelled".to_string(),
            ExecutionOutcome::Superseded { by } => {
                format!("Execution superseded by {}", by)
            }
        }
    }
}

/// Final report handed to completion callbacks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub request_id: RequestId,
    pub subject_id: SubjectId,
    pub outcome: ExecutionOutcome,
    /// Latest known result per requested test case, in request order.
    pub results: Vec<TestResult>,
    /// Requested test cases that never reached a terminal status.
    pub unresolved: Vec<String>,
    /// Test cases whose latest result could not be written to the record store.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unreconciled: Vec<String>,
}

impl ExecutionReport {
    /// Status of one test case, if any result was recorded for it.
    pub fn status_of(&self, test_case_id: &str) -> Option<TestStatus> {
        self.results
            .iter()
            .find(|r| r.test_case_id == test_case_id)
            .map(|r| r.status)
    }
}

/// One row of an execution summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCaseRow {
    pub test_case_id: String,
    pub status: TestStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logs: Option<String>,
}

/// Snapshot of a request's progress, queryable by request id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub request_id: RequestId,
    pub subject_id: SubjectId,
    pub state: ExecutionState,
    /// Channels currently delivering results for the request.
    pub active_channels: BTreeSet<ChannelKind>,
    pub created_at: DateTime<Utc>,
    /// When the request times out unless it finishes first.
    pub deadline_at: DateTime<Utc>,
    pub total_tests: usize,
    pub status_counts: BTreeMap<TestStatus, usize>,
    pub test_cases: Vec<TestCaseRow>,
}

impl ExecutionSummary {
    /// Number of rows with the given status.
    pub fn count(&self, status: TestStatus) -> usize {
        self.status_counts.get(&status).copied().unwrap_or(0)
    }
}
