//! Execution journal.
//!
//! An optional, append-only record of every request's lifecycle on disk:
//! `<dir>/.testrelay/executions/<request_id>/events.jsonl` plus a `run.json`
//! manifest. Write failures are logged and never affect the execution.

pub mod record;
pub mod store;

use std::path::Path;

use tracing::warn;

use crate::model::{ExecutionReport, ExecutionState, RequestId, SubjectId};

pub use record::{JournalEvent, JournalEventKind, RunManifest, JOURNAL_SCHEMA_VERSION};
pub use store::{JournalError, JournalResult, JournalStore};

/// Lifecycle recorder used by the coordinator.
#[derive(Debug, Clone)]
pub struct ExecutionJournal {
    store: JournalStore,
}

impl ExecutionJournal {
    /// Open (creating if needed) a journal under `base_dir`.
    pub fn open(base_dir: &Path) -> JournalResult<Self> {
        Ok(Self {
            store: JournalStore::new(base_dir)?,
        })
    }

    pub fn store(&self) -> &JournalStore {
        &self.store
    }

    pub fn request_start(
        &self,
        request_id: &RequestId,
        subject_id: &SubjectId,
        test_case_ids: &[String],
        mode: &str,
    ) {
        self.write(JournalEvent::new(
            request_id.clone(),
            JournalEventKind::RequestStart {
                subject_id: subject_id.clone(),
                test_case_ids: test_case_ids.to_vec(),
                mode: mode.to_string(),
            },
        ));
    }

    pub fn transition(&self, request_id: &RequestId, from: ExecutionState, to: ExecutionState) {
        self.write(JournalEvent::new(
            request_id.clone(),
            JournalEventKind::Transition { from, to },
        ));
    }

    pub fn request_complete(&self, report: &ExecutionReport) {
        self.write(JournalEvent::new(
            report.request_id.clone(),
            JournalEventKind::RequestComplete {
                outcome: report.outcome.clone(),
                results: report.results.clone(),
                unresolved: report.unresolved.clone(),
                unreconciled: report.unreconciled.clone(),
            },
        ));
    }

    fn write(&self, event: JournalEvent) {
        if let Err(err) = self.store.append(&event) {
            warn!(
                request_id = %event.request_id,
                dir = %self.store.root_dir().display(),
                error = %err,
                "failed to write journal event"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ExecutionOutcome;
    use tempfile::TempDir;

    #[test]
    fn test_lifecycle_is_journaled() {
        let dir = TempDir::new().unwrap();
        let journal = ExecutionJournal::open(dir.path()).unwrap();
        let id = RequestId::new("exec-1-abcd");

        journal.request_start(&id, &SubjectId::bulk(), &["TC_001".to_string()], "simulated");
        journal.transition(&id, ExecutionState::Idle, ExecutionState::Dispatching);
        journal.request_complete(&ExecutionReport {
            request_id: id.clone(),
            subject_id: SubjectId::bulk(),
            outcome: ExecutionOutcome::TimedOut,
            results: Vec::new(),
            unresolved: vec!["TC_001".to_string()],
            unreconciled: Vec::new(),
        });

        let events = journal.store().events(&id).unwrap();
        assert_eq!(events.len(), 3);
        let manifest = journal.store().manifest(&id).unwrap().unwrap();
        assert_eq!(manifest.record_count, 3);
        assert_eq!(manifest.final_state, Some(ExecutionState::TimedOut));
    }

    #[test]
    fn test_invalid_request_id_is_only_logged() {
        let dir = TempDir::new().unwrap();
        let journal = ExecutionJournal::open(dir.path()).unwrap();
        let id = RequestId::new("../escape");

        journal.transition(&id, ExecutionState::Idle, ExecutionState::Dispatching);
        assert!(journal.store().events(&id).is_err());
    }
}
