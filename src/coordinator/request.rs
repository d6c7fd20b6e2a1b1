//! Per-request state owned by a coordinator task.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::ci::RunHandle;
use crate::error::InvalidTransition;
use crate::model::{
    ChannelKind, ExecutionOutcome, ExecutionReport, ExecutionState, ExecutionSummary, RequestId, SubjectId,
    TestCaseRow, TestResult, TestStatus,
};

/// Returns true if the state machine allows moving from `from` to `to`.
pub fn is_allowed(from: ExecutionState, to: ExecutionState) -> bool {
    use ExecutionState::*;

    match (from, to) {
        (Idle, Dispatching) => true,
        (Dispatching, AwaitingResults) => true,
        (AwaitingResults, AwaitingResults) | (AwaitingResults, Polling) => true,
        (Polling, Polling) => true,
        (AwaitingResults | Polling, Completed) => true,
        (Dispatching | AwaitingResults | Polling, Failed | TimedOut) => true,
        (from, Cancelled) => !from.is_terminal(),
        _ => false,
    }
}

/// Remove duplicates, keeping the first occurrence of each id.
pub fn dedupe_test_case_ids(ids: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.into_iter()
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty() && seen.insert(id.clone()))
        .collect()
}

/// One dispatched run and everything learned about it so far.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    request_id: RequestId,
    subject_id: SubjectId,
    requested: Vec<String>,
    requested_set: HashSet<String>,
    state: ExecutionState,
    results: HashMap<String, TestResult>,
    active_channels: BTreeSet<ChannelKind>,
    created_at: DateTime<Utc>,
    deadline_at: DateTime<Utc>,
    run: Option<RunHandle>,
}

impl ExecutionRequest {
    /// A request in `Idle`. `test_case_ids` must already be deduplicated.
    pub fn new(
        request_id: RequestId,
        subject_id: SubjectId,
        test_case_ids: Vec<String>,
        outer_deadline: Duration,
    ) -> Self {
        let created_at = Utc::now();
        let deadline_at = chrono::Duration::from_std(outer_deadline)
            .ok()
            .and_then(|d| created_at.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            requested_set: test_case_ids.iter().cloned().collect(),
            requested: test_case_ids,
            request_id,
            subject_id,
            state: ExecutionState::Idle,
            results: HashMap::new(),
            active_channels: BTreeSet::new(),
            created_at,
            deadline_at,
            run: None,
        }
    }

    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    pub fn subject_id(&self) -> &SubjectId {
        &self.subject_id
    }

    pub fn requested(&self) -> &[String] {
        &self.requested
    }

    pub fn state(&self) -> ExecutionState {
        self.state
    }

    /// Record the channels currently delivering results.
    pub fn set_active_channels(&mut self, channels: BTreeSet<ChannelKind>) {
        self.active_channels = channels;
    }

    pub fn run(&self) -> Option<&RunHandle> {
        self.run.as_ref()
    }

    pub fn set_run(&mut self, run: RunHandle) {
        self.run = Some(run);
    }

    /// Move to `to`, returning the previous state.
    pub fn transition(&mut self, to: ExecutionState) -> Result<ExecutionState, InvalidTransition> {
        let from = self.state;
        if !is_allowed(from, to) {
            return Err(InvalidTransition { from, to });
        }
        self.state = to;
        Ok(from)
    }

    /// Merge a batch, returning the results that were accepted.
    ///
    /// Results for unrequested ids are dropped, a terminal status is never
    /// replaced by a non-terminal one and re-delivering the recorded terminal
    /// status is a no-op. Anything else replaces the previous result.
    pub fn record_results(&mut self, results: Vec<TestResult>) -> Vec<TestResult> {
        let mut accepted = Vec::new();
        for result in results {
            if !self.requested_set.contains(&result.test_case_id) {
                continue;
            }
            if let Some(existing) = self.results.get(&result.test_case_id) {
                if existing.status.is_terminal()
                    && (!result.status.is_terminal() || existing.status == result.status)
                {
                    continue;
                }
            }
            self.results
                .insert(result.test_case_id.clone(), result.clone());
            accepted.push(result);
        }
        accepted
    }

    /// Latest result for one test case.
    pub fn result(&self, test_case_id: &str) -> Option<&TestResult> {
        self.results.get(test_case_id)
    }

    /// Returns true once every requested test case has a terminal status.
    pub fn all_terminal(&self) -> bool {
        self.requested.iter().all(|id| {
            self.results
                .get(id)
                .map(|r| r.status.is_terminal())
                .unwrap_or(false)
        })
    }

    /// Requested ids without a terminal status, in request order.
    pub fn unresolved(&self) -> Vec<String> {
        self.requested
            .iter()
            .filter(|id| {
                !self
                    .results
                    .get(*id)
                    .map(|r| r.status.is_terminal())
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    /// Final report for `outcome`.
    pub fn report(&self, outcome: ExecutionOutcome) -> ExecutionReport {
        ExecutionReport {
            request_id: self.request_id.clone(),
            subject_id: self.subject_id.clone(),
            outcome,
            results: self
                .requested
                .iter()
                .filter_map(|id| self.results.get(id).cloned())
                .collect(),
            unresolved: self.unresolved(),
            unreconciled: Vec::new(),
        }
    }

    /// Progress snapshot.
    pub fn summary(&self) -> ExecutionSummary {
        let test_cases: Vec<TestCaseRow> = self
            .requested
            .iter()
            .map(|id| match self.results.get(id) {
                Some(result) => TestCaseRow {
                    test_case_id: id.clone(),
                    status: result.status,
                    duration_ms: Some(result.duration_ms),
                    logs: result.logs.clone(),
                },
                None => TestCaseRow {
                    test_case_id: id.clone(),
                    status: TestStatus::NotStarted,
                    duration_ms: None,
                    logs: None,
                },
            })
            .collect();

        let mut status_counts = BTreeMap::new();
        for row in &test_cases {
            *status_counts.entry(row.status).or_insert(0) += 1;
        }

        ExecutionSummary {
            request_id: self.request_id.clone(),
            subject_id: self.subject_id.clone(),
            state: self.state,
            active_channels: self.active_channels.clone(),
            created_at: self.created_at,
            deadline_at: self.deadline_at,
            total_tests: self.requested.len(),
            status_counts,
            test_cases,
        }
    }
}
