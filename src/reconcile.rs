//! Result reconciliation into the test case record store.
//!
//! The reconciler is the only writer of test case records during an
//! execution. It writes a record only when the reported status differs from
//! the stored one, and fires the change notification and the coverage/gate
//! recalculation at most once per batch.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::{ReconciliationError, StoreError};
use crate::model::{RequestId, TestResult, TestStatus};

/// Result type for record store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// A test case record as kept by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    /// Test case identifier.
    pub id: String,
    /// Human readable title.
    pub title: String,
    /// Requirement this test case covers, if linked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requirement_id: Option<String>,
    /// Last reconciled status.
    pub status: TestStatus,
    /// When the test case last produced a status other than `not_started`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_executed: Option<DateTime<Utc>>,
    /// Duration of the last execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Log output of the last execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs: Option<String>,
}

impl TestCase {
    /// A record that has never been executed.
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            requirement_id: None,
            status: TestStatus::NotStarted,
            last_executed: None,
            duration_ms: None,
            logs: None,
        }
    }

    /// Link the record to a requirement.
    pub fn with_requirement(mut self, requirement_id: impl Into<String>) -> Self {
        self.requirement_id = Some(requirement_id.into());
        self
    }
}

/// Partial update of a test case. `None` fields are left unchanged.
#[derive(Debug, Clone, PartialEq)]
pub struct TestCasePatch {
    pub status: TestStatus,
    pub last_executed: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub logs: Option<String>,
}

impl TestCasePatch {
    /// Project a reported result onto a patch.
    pub fn from_result(result: &TestResult) -> Self {
        Self {
            status: result.status,
            last_executed: (result.status != TestStatus::NotStarted).then_some(result.received_at),
            duration_ms: Some(result.duration_ms),
            logs: result.logs.clone(),
        }
    }

    fn apply_to(&self, record: &mut TestCase) {
        record.status = self.status;
        if let Some(at) = self.last_executed {
            record.last_executed = Some(at);
        }
        if let Some(duration_ms) = self.duration_ms {
            record.duration_ms = Some(duration_ms);
        }
        if let Some(logs) = &self.logs {
            record.logs = Some(logs.clone());
        }
    }
}

/// Change notification published after a reconciled batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreChange {
    pub test_case_ids: Vec<String>,
}

/// External test case store.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// All test cases.
    async fn test_cases(&self) -> StoreResult<Vec<TestCase>>;

    /// One test case by id.
    async fn test_case(&self, id: &str) -> StoreResult<Option<TestCase>>;

    /// Apply a patch, creating a minimal record when the id is unknown.
    async fn update_test_case(&self, id: &str, patch: TestCasePatch) -> StoreResult<TestCase>;

    /// Subscribe to change notifications.
    fn subscribe(&self) -> broadcast::Receiver<StoreChange>;

    /// Publish a change notification.
    fn publish_change(&self, change: StoreChange);

    /// Recompute derived coverage and quality gate state.
    async fn recalculate_coverage_and_gates(&self) -> StoreResult<()>;
}

/// In-memory [`RecordStore`] with mutation and recalculation counters.
pub struct InMemoryRecordStore {
    records: Mutex<BTreeMap<String, TestCase>>,
    changes: broadcast::Sender<StoreChange>,
    mutations: AtomicUsize,
    recalculations: AtomicUsize,
    unavailable: AtomicBool,
}

impl Default for InMemoryRecordStore {
    fn default() -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            records: Mutex::new(BTreeMap::new()),
            changes,
            mutations: AtomicUsize::new(0),
            recalculations: AtomicUsize::new(0),
            unavailable: AtomicBool::new(false),
        }
    }
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with records.
    pub fn with_test_cases(self, test_cases: impl IntoIterator<Item = TestCase>) -> Self {
        {
            let mut records = self.records();
            for test_case in test_cases {
                records.insert(test_case.id.clone(), test_case);
            }
        }
        self
    }

    /// Number of record writes so far.
    pub fn mutation_count(&self) -> usize {
        self.mutations.load(Ordering::SeqCst)
    }

    /// Number of coverage/gate recalculations so far.
    pub fn recalculation_count(&self) -> usize {
        self.recalculations.load(Ordering::SeqCst)
    }

    /// Make every read and write fail until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Synchronous snapshot of one record.
    pub fn get(&self, id: &str) -> Option<TestCase> {
        self.records().get(id).cloned()
    }

    fn records(&self) -> MutexGuard<'_, BTreeMap<String, TestCase>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store marked unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn test_cases(&self) -> StoreResult<Vec<TestCase>> {
        self.check_available()?;
        Ok(self.records().values().cloned().collect())
    }

    async fn test_case(&self, id: &str) -> StoreResult<Option<TestCase>> {
        self.check_available()?;
        Ok(self.get(id))
    }

    async fn update_test_case(&self, id: &str, patch: TestCasePatch) -> StoreResult<TestCase> {
        self.check_available()?;
        let mut records = self.records();
        let record = records
            .entry(id.to_string())
            .or_insert_with(|| TestCase::new(id, id));
        patch.apply_to(record);
        self.mutations.fetch_add(1, Ordering::SeqCst);
        Ok(record.clone())
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }

    fn publish_change(&self, change: StoreChange) {
        // No subscribers is fine.
        let _ = self.changes.send(change);
    }

    async fn recalculate_coverage_and_gates(&self) -> StoreResult<()> {
        self.check_available()?;
        self.recalculations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Outcome of one `apply` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppliedCount {
    /// Records written.
    pub applied: usize,
    /// Results whose status already matched the store.
    pub unchanged: usize,
}

/// Merges results into the record store.
#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn RecordStore>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// Apply a batch of results.
    ///
    /// On a store failure the records written before it stay written, the
    /// hooks still fire for them and the error reports how many were applied.
    pub async fn apply(
        &self,
        request_id: &RequestId,
        results: &[TestResult],
    ) -> Result<AppliedCount, ReconciliationError> {
        let mut count = AppliedCount::default();
        let mut changed = Vec::new();
        let mut failure = None;

        for result in results {
            match self.apply_one(result).await {
                Ok(true) => {
                    count.applied += 1;
                    changed.push(result.test_case_id.clone());
                }
                Ok(false) => count.unchanged += 1,
                Err(error) => {
                    failure = Some(error);
                    break;
                }
            }
        }

        if !changed.is_empty() {
            debug!(request_id = %request_id, applied = changed.len(), "reconciled results");
            self.store.publish_change(StoreChange {
                test_case_ids: changed,
            });
            if let Err(error) = self.store.recalculate_coverage_and_gates().await {
                warn!(request_id = %request_id, %error, "coverage recalculation failed");
            }
        }

        match failure {
            Some(source) => Err(ReconciliationError::Store {
                applied: count.applied,
                source,
            }),
            None => Ok(count),
        }
    }

    async fn apply_one(&self, result: &TestResult) -> StoreResult<bool> {
        let existing = self.store.test_case(&result.test_case_id).await?;
        if existing.map(|record| record.status) == Some(result.status) {
            return Ok(false);
        }
        self.store
            .update_test_case(&result.test_case_id, TestCasePatch::from_result(result))
            .await?;
        Ok(true)
    }
}
