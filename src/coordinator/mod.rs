//! Execution coordinator.
//!
//! [`ExecutionCoordinator::start`] validates the request, registers it with
//! the correlation registry and spawns one task that owns the request for
//! its whole life. Channels, timers and cancellation all reach that task
//! through its mailbox, so its transitions never interleave.

pub mod handle;
pub mod request;
mod run;
pub mod supervisor;

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::backend::{BackendApi, HttpBackend};
use crate::channels::{
    BackendPollAdapter, ChannelAdapter, ChannelSet, CiPollAdapter, PushAdapter, PushSource,
    SimulatedAdapter, SseSource,
};
use crate::ci::{CiSystem, GitHubActions};
use crate::error::{ConfigurationError, ExecutionError};
use crate::journal::ExecutionJournal;
use crate::model::{
    CancelReason, ExecutionReport, ExecutionSummary, RequestId, SubjectId, TestResult,
};
use crate::reconcile::{RecordStore, Reconciler};
use crate::registry::{CorrelationRegistry, Listener, SubscriptionKey};
use crate::settings::{CiSettings, Settings};
use crate::timeout::TimeoutConfig;

pub use handle::{CompleteCallback, ExecutionHandle, ProgressCallback};
pub use request::{dedupe_test_case_ids, is_allowed, ExecutionRequest};
pub use supervisor::ChannelSupervisor;

use handle::HandleShared;
use run::RequestTask;

/// Summaries kept for finished requests.
const SUMMARY_CAPACITY: usize = 128;

/// How results should be obtained.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// CI when a repository is configured, simulated otherwise.
    #[default]
    Auto,
    /// CI only; missing configuration is an error.
    Ci,
    /// Synthetic results, no CI involved.
    Simulated,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExecutionMode::Auto => "auto",
            ExecutionMode::Ci => "ci",
            ExecutionMode::Simulated => "simulated",
        })
    }
}

/// Per-call options for [`ExecutionCoordinator::start`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionOptions {
    pub mode: ExecutionMode,
}

impl ExecutionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }
}

/// Mode after resolving `Auto` against the configuration.
#[derive(Clone)]
pub(crate) enum ResolvedMode {
    Ci(Arc<dyn CiSystem>),
    Simulated,
}

impl ResolvedMode {
    pub(crate) fn label(&self) -> &'static str {
        match self {
            ResolvedMode::Ci(_) => "ci",
            ResolvedMode::Simulated => "simulated",
        }
    }
}

/// Latest summary per request, bounded.
#[derive(Default)]
pub(crate) struct SummaryBoard {
    inner: Mutex<(HashMap<RequestId, ExecutionSummary>, VecDeque<RequestId>)>,
}

impl SummaryBoard {
    fn lock(&self) -> MutexGuard<'_, (HashMap<RequestId, ExecutionSummary>, VecDeque<RequestId>)> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn update(&self, summary: ExecutionSummary) {
        let mut guard = self.lock();
        let (summaries, order) = &mut *guard;
        if !summaries.contains_key(&summary.request_id) {
            order.push_back(summary.request_id.clone());
            while order.len() > SUMMARY_CAPACITY {
                if let Some(oldest) = order.pop_front() {
                    summaries.remove(&oldest);
                }
            }
        }
        summaries.insert(summary.request_id.clone(), summary);
    }

    pub(crate) fn get(&self, request_id: &RequestId) -> Option<ExecutionSummary> {
        self.lock().0.get(request_id).cloned()
    }
}

pub(crate) struct Inner {
    pub(crate) reconciler: Reconciler,
    pub(crate) registry: Arc<CorrelationRegistry>,
    pub(crate) ci: Option<Arc<dyn CiSystem>>,
    pub(crate) ci_settings: CiSettings,
    pub(crate) backend: Option<Arc<dyn BackendApi>>,
    pub(crate) channels: ChannelSet,
    pub(crate) timeouts: TimeoutConfig,
    pub(crate) callback_url: Option<String>,
    pub(crate) journal: Option<ExecutionJournal>,
    pub(crate) summaries: SummaryBoard,
}

/// Builder for [`ExecutionCoordinator`].
pub struct ExecutionCoordinatorBuilder {
    store: Arc<dyn RecordStore>,
    registry: Option<Arc<CorrelationRegistry>>,
    ci: Option<Arc<dyn CiSystem>>,
    ci_settings: CiSettings,
    backend: Option<Arc<dyn BackendApi>>,
    push_source: Option<Arc<dyn PushSource>>,
    adapters: Vec<Arc<dyn ChannelAdapter>>,
    timeouts: TimeoutConfig,
    callback_url: Option<String>,
    journal: Option<ExecutionJournal>,
}

impl ExecutionCoordinatorBuilder {
    /// Share an existing registry.
    pub fn with_registry(mut self, registry: Arc<CorrelationRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// CI system to dispatch to.
    pub fn with_ci(mut self, ci: Arc<dyn CiSystem>) -> Self {
        self.ci = Some(ci);
        self
    }

    /// CI settings, consulted to explain why CI is unavailable.
    pub fn with_ci_settings(mut self, settings: CiSettings) -> Self {
        self.ci_settings = settings;
        self
    }

    /// Result relay backend (probe and backend polling).
    pub fn with_backend(mut self, backend: Arc<dyn BackendApi>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Source for the push channel.
    pub fn with_push_source(mut self, source: Arc<dyn PushSource>) -> Self {
        self.push_source = Some(source);
        self
    }

    /// Replace the built-in adapter of the same kind.
    pub fn with_adapter(mut self, adapter: Arc<dyn ChannelAdapter>) -> Self {
        self.adapters.push(adapter);
        self
    }

    pub fn with_timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// URL CI posts results to.
    pub fn with_callback_url(mut self, url: impl Into<String>) -> Self {
        self.callback_url = Some(url.into());
        self
    }

    pub fn with_journal(mut self, journal: ExecutionJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn build(self) -> ExecutionCoordinator {
        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(CorrelationRegistry::new()));

        let mut channels = ChannelSet::new();
        if let Some(source) = self.push_source {
            channels.insert(Arc::new(PushAdapter::new(source, Arc::clone(&registry))));
        }
        if let Some(backend) = &self.backend {
            channels.insert(Arc::new(BackendPollAdapter::new(
                Arc::clone(backend),
                &self.timeouts,
            )));
        }
        if let Some(ci) = &self.ci {
            channels.insert(Arc::new(CiPollAdapter::new(Arc::clone(ci), &self.timeouts)));
        }
        channels.insert(Arc::new(SimulatedAdapter::new(self.timeouts.simulation_delay)));
        for adapter in self.adapters {
            channels.insert(adapter);
        }

        ExecutionCoordinator {
            inner: Arc::new(Inner {
                reconciler: Reconciler::new(self.store),
                registry,
                ci: self.ci,
                ci_settings: self.ci_settings,
                backend: self.backend,
                channels,
                timeouts: self.timeouts,
                callback_url: self.callback_url,
                journal: self.journal,
                summaries: SummaryBoard::default(),
            }),
        }
    }
}

/// Entry point for starting and observing executions.
#[derive(Clone)]
pub struct ExecutionCoordinator {
    inner: Arc<Inner>,
}

impl ExecutionCoordinator {
    /// Start building a coordinator around a record store.
    pub fn builder(store: Arc<dyn RecordStore>) -> ExecutionCoordinatorBuilder {
        ExecutionCoordinatorBuilder {
            store,
            registry: None,
            ci: None,
            ci_settings: CiSettings::default(),
            backend: None,
            push_source: None,
            adapters: Vec::new(),
            timeouts: TimeoutConfig::default(),
            callback_url: None,
            journal: None,
        }
    }

    /// Wire up GitHub Actions, the relay backend and the journal from settings.
    ///
    /// Incomplete CI settings do not fail here; they surface from `start`
    /// when a run actually needs CI.
    pub fn from_settings(
        settings: &Settings,
        store: Arc<dyn RecordStore>,
    ) -> Result<Self, ConfigurationError> {
        let timeouts = settings.timeout_config();
        let mut builder = Self::builder(store)
            .with_timeouts(timeouts.clone())
            .with_ci_settings(settings.ci.clone());

        if let Ok(Some(credentials)) = settings.ci.credentials() {
            let github = GitHubActions::new(&credentials.repository, &credentials.token)?
                .with_branch(settings.ci.branch.clone())
                .with_workflow(settings.ci.workflow.clone())
                .with_run_lookup(timeouts.run_lookup_attempts, timeouts.run_lookup_interval);
            builder = builder.with_ci(Arc::new(github));
        }

        if let Some(base_url) = settings.backend.base_url.as_deref() {
            let backend = HttpBackend::new(base_url)?;
            let source = SseSource::new(backend.client().clone(), backend.events_url());
            builder = builder
                .with_push_source(Arc::new(source))
                .with_backend(Arc::new(backend));
        }
        if let Some(url) = settings.backend.callback_url() {
            builder = builder.with_callback_url(url);
        }

        if let Some(dir) = settings.journal_dir.as_deref() {
            match ExecutionJournal::open(dir) {
                Ok(journal) => builder = builder.with_journal(journal),
                Err(error) => {
                    warn!(dir = %dir.display(), %error, "execution journal disabled");
                }
            }
        }

        Ok(builder.build())
    }

    /// The registry deliveries are routed through.
    pub fn registry(&self) -> &Arc<CorrelationRegistry> {
        &self.inner.registry
    }

    fn resolve_mode(&self, mode: ExecutionMode) -> Result<ResolvedMode, ConfigurationError> {
        match (mode, &self.inner.ci) {
            (ExecutionMode::Simulated, _) => Ok(ResolvedMode::Simulated),
            (_, Some(ci)) => Ok(ResolvedMode::Ci(Arc::clone(ci))),
            (ExecutionMode::Auto, None) => match self.inner.ci_settings.credentials()? {
                None => Ok(ResolvedMode::Simulated),
                Some(_) => Err(ConfigurationError::Client("CI client not initialised".to_string())),
            },
            (ExecutionMode::Ci, None) => match self.inner.ci_settings.credentials()? {
                None => Err(ConfigurationError::MissingRepository),
                Some(_) => Err(ConfigurationError::Client("CI client not initialised".to_string())),
            },
        }
    }

    /// Start an execution of `test_case_ids` on behalf of `subject`.
    ///
    /// Must be called from within a Tokio runtime. A previous active request
    /// for the same subject is cancelled as superseded.
    pub fn start(
        &self,
        subject: SubjectId,
        test_case_ids: Vec<String>,
        options: ExecutionOptions,
    ) -> Result<ExecutionHandle, ExecutionError> {
        let test_case_ids = dedupe_test_case_ids(test_case_ids);
        if test_case_ids.is_empty() {
            return Err(ExecutionError::NoTestCases);
        }
        let mode = self.resolve_mode(options.mode)?;

        let request_id = RequestId::generate();
        let request = ExecutionRequest::new(
            request_id.clone(),
            subject.clone(),
            test_case_ids,
            self.inner.timeouts.outer_deadline,
        );
        let shared = HandleShared::new(request_id.clone(), subject.clone());
        let (mailbox, inbox) = mpsc::unbounded_channel();

        if let Some(previous) =
            self.inner
                .registry
                .register(request_id.clone(), subject.clone(), mailbox.clone())
        {
            info!(request_id = %previous, by = %request_id, subject = %subject, "superseding active request");
            self.inner
                .registry
                .cancel(&previous, CancelReason::Superseded(request_id.clone()));
        }

        if let Some(journal) = &self.inner.journal {
            journal.request_start(&request_id, &subject, request.requested(), mode.label());
        }
        self.inner.summaries.update(request.summary());
        info!(
            request_id = %request_id,
            subject = %subject,
            mode = mode.label(),
            tests = request.requested().len(),
            "execution started"
        );

        let task = RequestTask::new(
            Arc::clone(&self.inner),
            request,
            mode,
            Arc::clone(&shared),
            mailbox,
            inbox,
        );
        tokio::spawn(task.run());

        Ok(ExecutionHandle::new(shared))
    }

    /// Start a run over a flat list of test cases.
    pub fn start_bulk(
        &self,
        test_case_ids: Vec<String>,
        options: ExecutionOptions,
    ) -> Result<ExecutionHandle, ExecutionError> {
        self.start(SubjectId::bulk(), test_case_ids, options)
    }

    /// Cancel a running execution. Returns false if it already finished.
    pub fn cancel(&self, handle: &ExecutionHandle) -> bool {
        let cancelled = self
            .inner
            .registry
            .cancel(handle.request_id(), CancelReason::Requested);
        if cancelled {
            info!(request_id = %handle.request_id(), "cancellation requested");
        }
        cancelled
    }

    /// Observe every accepted batch of results.
    pub fn on_progress<F>(&self, handle: &ExecutionHandle, callback: F)
    where
        F: Fn(&[TestResult]) + Send + Sync + 'static,
    {
        handle.shared.add_progress(Arc::new(callback));
    }

    /// Observe the final report. Fires exactly once, immediately if the
    /// execution already finished.
    pub fn on_complete<F>(&self, handle: &ExecutionHandle, callback: F)
    where
        F: FnOnce(&ExecutionReport) + Send + 'static,
    {
        handle.shared.add_complete(Box::new(callback));
    }

    /// Latest progress snapshot of a request.
    pub fn summary(&self, request_id: &RequestId) -> Option<ExecutionSummary> {
        self.inner.summaries.get(request_id)
    }

    /// Subscribe a raw delivery listener by request or subject id.
    pub fn subscribe(&self, key: SubscriptionKey, listener: Listener) -> Option<Listener> {
        self.inner.registry.subscribe(key, listener)
    }

    pub fn unsubscribe(&self, key: &SubscriptionKey) -> bool {
        self.inner.registry.unsubscribe(key)
    }
}
