//! Caller-side handle to a running execution.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use crate::model::{ExecutionReport, RequestId, SubjectId, TestResult};

/// Called with every accepted batch of results.
pub type ProgressCallback = Arc<dyn Fn(&[TestResult]) + Send + Sync>;

/// Called once with the final report.
pub type CompleteCallback = Box<dyn FnOnce(&ExecutionReport) + Send>;

#[derive(Default)]
struct Observers {
    progress: Vec<ProgressCallback>,
    complete: Vec<CompleteCallback>,
    report: Option<ExecutionReport>,
}

/// State shared between a handle and the coordinator task.
pub(crate) struct HandleShared {
    request_id: RequestId,
    subject_id: SubjectId,
    observers: Mutex<Observers>,
    finished: Notify,
}

impl HandleShared {
    pub(crate) fn new(request_id: RequestId, subject_id: SubjectId) -> Arc<Self> {
        Arc::new(Self {
            request_id,
            subject_id,
            observers: Mutex::new(Observers::default()),
            finished: Notify::new(),
        })
    }

    fn observers(&self) -> MutexGuard<'_, Observers> {
        self.observers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn add_progress(&self, callback: ProgressCallback) {
        self.observers().progress.push(callback);
    }

    /// Register a completion callback; runs immediately if already finished.
    pub(crate) fn add_complete(&self, callback: CompleteCallback) {
        let report = {
            let mut observers = self.observers();
            match &observers.report {
                Some(report) => report.clone(),
                None => {
                    observers.complete.push(callback);
                    return;
                }
            }
        };
        callback(&report);
    }

    pub(crate) fn progress(&self, results: &[TestResult]) {
        let callbacks: Vec<ProgressCallback> = self.observers().progress.clone();
        for callback in callbacks {
            callback(results);
        }
    }

    /// Record the final report and run completion callbacks. Only the first
    /// call has any effect.
    pub(crate) fn finish(&self, report: ExecutionReport) {
        let callbacks = {
            let mut observers = self.observers();
            if observers.report.is_some() {
                return;
            }
            observers.report = Some(report.clone());
            observers.progress.clear();
            std::mem::take(&mut observers.complete)
        };
        for callback in callbacks {
            callback(&report);
        }
        self.finished.notify_waiters();
    }

    fn report(&self) -> Option<ExecutionReport> {
        self.observers().report.clone()
    }
}

/// Handle returned by `ExecutionCoordinator::start`.
#[derive(Clone)]
pub struct ExecutionHandle {
    pub(crate) shared: Arc<HandleShared>,
}

impl ExecutionHandle {
    pub(crate) fn new(shared: Arc<HandleShared>) -> Self {
        Self { shared }
    }

    pub fn request_id(&self) -> &RequestId {
        &self.shared.request_id
    }

    pub fn subject_id(&self) -> &SubjectId {
        &self.shared.subject_id
    }

    /// The final report, once the execution has finished.
    pub fn report(&self) -> Option<ExecutionReport> {
        self.shared.report()
    }

    pub fn is_finished(&self) -> bool {
        self.report().is_some()
    }

    /// Wait for the final report.
    pub async fn wait(&self) -> ExecutionReport {
        loop {
            let notified = self.shared.finished.notified();
            if let Some(report) = self.shared.report() {
                return report;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for ExecutionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionHandle")
            .field("request_id", &self.shared.request_id)
            .field("subject_id", &self.shared.subject_id)
            .field("finished", &self.is_finished())
            .finish()
    }
}
