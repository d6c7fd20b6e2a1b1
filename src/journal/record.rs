use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{ExecutionOutcome, ExecutionState, RequestId, SubjectId, TestResult};

/// Current journal schema version.
pub const JOURNAL_SCHEMA_VERSION: u32 = 1;

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum JournalEventKind {
    /// A request was accepted and is about to dispatch.
    RequestStart {
        subject_id: SubjectId,
        test_case_ids: Vec<String>,
        /// `ci` or `simulated`.
        mode: String,
    },
    /// The request state machine moved.
    Transition {
        from: ExecutionState,
        to: ExecutionState,
    },
    /// The request reached its terminal outcome.
    RequestComplete {
        outcome: ExecutionOutcome,
        results: Vec<TestResult>,
        unresolved: Vec<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        unreconciled: Vec<String>,
    },
}

/// One line of a request's `events.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEvent {
    /// Journal schema version.
    pub schema_version: u32,
    /// Request the event belongs to.
    pub request_id: RequestId,
    /// When the event was recorded.
    pub recorded_at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: JournalEventKind,
}

impl JournalEvent {
    /// Create an event stamped now.
    pub fn new(request_id: RequestId, kind: JournalEventKind) -> Self {
        Self {
            schema_version: JOURNAL_SCHEMA_VERSION,
            request_id,
            recorded_at: Utc::now(),
            kind,
        }
    }
}

/// `run.json` manifest kept next to the events of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    /// Journal schema version.
    pub schema_version: u32,
    /// Request identifier.
    pub request_id: RequestId,
    /// Timestamp of the first event.
    pub created_at: DateTime<Utc>,
    /// Timestamp of the latest event.
    pub updated_at: DateTime<Utc>,
    /// Total number of stored events.
    pub record_count: u64,
    /// Terminal state once the request finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_state: Option<ExecutionState>,
}

impl RunManifest {
    /// Create a manifest for a request's first event.
    pub fn new(request_id: RequestId, timestamp: DateTime<Utc>) -> Self {
        Self {
            schema_version: JOURNAL_SCHEMA_VERSION,
            request_id,
            created_at: timestamp,
            updated_at: timestamp,
            record_count: 0,
            final_state: None,
        }
    }

    /// Account for a newly appended event.
    pub fn record(&mut self, event: &JournalEvent) {
        self.updated_at = event.recorded_at;
        self.record_count = self.record_count.saturating_add(1);
        if let JournalEventKind::RequestComplete { outcome, .. } = &event.kind {
            self.final_state = Some(outcome.state());
        }
    }
}
