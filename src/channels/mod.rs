//! Result channels.
//!
//! Every channel answers the same question ("what are the results for
//! request X?") by a different route. Adapters are shared across requests;
//! activation starts work for one request id and deactivation stops it.
//! Whatever an adapter learns goes back through a [`ResultSink`], which posts
//! into the owning coordinator task via the correlation registry.

pub mod backend_poll;
pub mod ci_poll;
pub mod push;
pub mod simulated;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::ci::RunHandle;
use crate::error::ChannelError;
use crate::model::{ChannelKind, RequestId, SubjectId, TestResult};
use crate::registry::{CorrelationRegistry, Delivery, Envelope};

pub use backend_poll::BackendPollAdapter;
pub use ci_poll::CiPollAdapter;
pub use push::{PushAdapter, PushSource, SseSource};
pub use simulated::SimulatedAdapter;

/// Everything an adapter needs to start working on one request.
#[derive(Clone)]
pub struct Activation {
    pub request_id: RequestId,
    pub subject_id: SubjectId,
    /// Requested test cases, in request order.
    pub test_case_ids: Vec<String>,
    /// CI run, when one was dispatched.
    pub run: Option<RunHandle>,
    /// Where to report.
    pub sink: ResultSink,
}

/// Channel-side handle for reporting back to one request.
#[derive(Clone)]
pub struct ResultSink {
    registry: Arc<CorrelationRegistry>,
    request_id: RequestId,
    channel: ChannelKind,
}

impl ResultSink {
    pub fn new(registry: Arc<CorrelationRegistry>, request_id: RequestId, channel: ChannelKind) -> Self {
        Self {
            registry,
            request_id,
            channel,
        }
    }

    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    pub fn channel(&self) -> ChannelKind {
        self.channel
    }

    /// Report a batch of results.
    pub fn deliver(&self, results: Vec<TestResult>) -> Delivery {
        self.registry.deliver(&self.request_id, self.channel, results)
    }

    /// Report a recoverable failure.
    pub fn fail(&self, error: ChannelError) -> Delivery {
        self.registry.post(
            &self.request_id,
            Envelope::ChannelFailed {
                channel: self.channel,
                error,
            },
        )
    }

    /// Report the final outcome of the CI run.
    pub fn finish(&self, outcome: Result<Vec<TestResult>, ChannelError>) -> Delivery {
        self.registry.post(
            &self.request_id,
            Envelope::RunFinished {
                channel: self.channel,
                outcome,
            },
        )
    }

    /// Returns false once the request stopped accepting deliveries.
    pub fn is_open(&self) -> bool {
        self.registry.is_active(&self.request_id)
    }
}

/// One way of obtaining results.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Which channel this is.
    fn kind(&self) -> ChannelKind;

    /// Start working on a request.
    async fn activate(&self, activation: Activation) -> Result<(), ChannelError>;

    /// Stop working on a request. Idempotent and infallible.
    async fn deactivate(&self, request_id: &RequestId);
}

/// Adapters by kind.
#[derive(Clone, Default)]
pub struct ChannelSet {
    adapters: BTreeMap<ChannelKind, Arc<dyn ChannelAdapter>>,
}

impl ChannelSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an adapter, replacing any adapter of the same kind.
    pub fn with_adapter(mut self, adapter: Arc<dyn ChannelAdapter>) -> Self {
        self.insert(adapter);
        self
    }

    pub fn insert(&mut self, adapter: Arc<dyn ChannelAdapter>) {
        self.adapters.insert(adapter.kind(), adapter);
    }

    pub fn get(&self, kind: ChannelKind) -> Option<&Arc<dyn ChannelAdapter>> {
        self.adapters.get(&kind)
    }
}

/// Per-request background tasks of one adapter.
#[derive(Default)]
pub struct TaskSet {
    tasks: Mutex<HashMap<RequestId, JoinHandle<()>>>,
}

impl TaskSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<RequestId, JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track a task, aborting any previous task for the same request.
    pub fn insert(&self, request_id: RequestId, handle: JoinHandle<()>) {
        if let Some(previous) = self.lock().insert(request_id, handle) {
            previous.abort();
        }
    }

    /// Abort and forget the task for a request. Returns true if one existed.
    pub fn abort(&self, request_id: &RequestId) -> bool {
        match self.lock().remove(request_id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Number of tasks still running.
    pub fn running(&self) -> usize {
        let mut tasks = self.lock();
        tasks.retain(|_, handle| !handle.is_finished());
        tasks.len()
    }
}

impl Drop for TaskSet {
    fn drop(&mut self) {
        for (_, handle) in self.lock().drain() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TestStatus;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_sink_posts_through_registry() {
        let registry = Arc::new(CorrelationRegistry::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = RequestId::new("exec-1");
        registry.register(id.clone(), SubjectId::bulk(), tx);

        let sink = ResultSink::new(Arc::clone(&registry), id.clone(), ChannelKind::CiPoll);
        assert!(sink.is_open());
        sink.deliver(vec![TestResult::new("TC_001", TestStatus::Passed)]);
        sink.fail(ChannelError::Transport("reset".to_string()));
        sink.finish(Ok(Vec::new()));

        assert!(matches!(rx.recv().await, Some(Envelope::Results { .. })));
        assert!(matches!(rx.recv().await, Some(Envelope::ChannelFailed { .. })));
        assert!(matches!(rx.recv().await, Some(Envelope::RunFinished { .. })));

        registry.close(&id, Duration::from_secs(1));
        assert!(!sink.is_open());
        assert_eq!(sink.fail(ChannelError::Decode("x".into())), Delivery::Discarded);
    }

    #[tokio::test]
    async fn test_task_set_replaces_and_aborts() {
        let tasks = TaskSet::new();
        let id = RequestId::new("exec-1");

        let (first_tx, first_rx) = tokio::sync::oneshot::channel::<()>();
        tasks.insert(
            id.clone(),
            tokio::spawn(async move {
                let _keep = first_tx;
                futures::future::pending::<()>().await;
            }),
        );
        tasks.insert(id.clone(), tokio::spawn(futures::future::pending::<()>()));
        // The aborted task drops its sender.
        assert!(first_rx.await.is_err());
        assert_eq!(tasks.running(), 1);

        assert!(tasks.abort(&id));
        assert!(!tasks.abort(&id));
        assert_eq!(tasks.running(), 0);
    }
}
