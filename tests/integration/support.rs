//! Fakes for the CI system, the relay backend and the push stream.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use tokio::sync::mpsc;

use testrelay::backend::{BackendApi, PushMessage, StoredResults};
use testrelay::channels::push::{PushSource, PushStream};
use testrelay::ci::{Artifact, CiSystem, DispatchRequest, RunHandle, RunState, RunStatus};
use testrelay::{ChannelError, DispatchError, RequestId, TestResult};

/// CI that accepts every dispatch and replays scripted run states.
pub struct FakeCi {
    states: Mutex<VecDeque<RunState>>,
    /// Returned once the script is exhausted.
    settle: RunState,
    /// Every status query fails with this error when set.
    status_error: Option<ChannelError>,
    artifact: Vec<u8>,
    pub dispatched: Mutex<Vec<DispatchRequest>>,
    pub status_queries: AtomicUsize,
}

impl FakeCi {
    /// A run that never finishes.
    pub fn stalled() -> Self {
        Self::scripted(Vec::new(), RunState::InProgress, "[]")
    }

    /// A run that completes after `in_progress` polls with `artifact` as results.
    pub fn completing(in_progress: usize, artifact: &str) -> Self {
        Self::scripted(
            vec![RunState::InProgress; in_progress],
            RunState::Completed,
            artifact,
        )
    }

    /// A run whose status can never be read.
    pub fn unreachable() -> Self {
        Self {
            status_error: Some(ChannelError::Status {
                status: 502,
                url: "/repos/acme/app/actions/runs/7001".to_string(),
            }),
            ..Self::stalled()
        }
    }

    fn scripted(states: Vec<RunState>, settle: RunState, artifact: &str) -> Self {
        Self {
            states: Mutex::new(states.into()),
            settle,
            status_error: None,
            artifact: artifact.as_bytes().to_vec(),
            dispatched: Mutex::new(Vec::new()),
            status_queries: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl CiSystem for FakeCi {
    async fn dispatch_workflow(&self, request: &DispatchRequest) -> Result<RunHandle, DispatchError> {
        self.dispatched.lock().unwrap().push(request.clone());
        Ok(RunHandle::new(7001))
    }

    async fn run_status(&self, _run: &RunHandle) -> Result<RunStatus, ChannelError> {
        self.status_queries.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = &self.status_error {
            return Err(error.clone());
        }
        let state = self.states.lock().unwrap().pop_front().unwrap_or(self.settle);
        Ok(RunStatus {
            state,
            conclusion: (state == RunState::Completed).then(|| "success".to_string()),
        })
    }

    async fn run_artifacts(&self, _run: &RunHandle) -> Result<Vec<Artifact>, ChannelError> {
        Ok(vec![Artifact::new("test-results.json", self.artifact.clone())])
    }
}

/// Relay backend with a switchable health check and settable stored results.
pub struct FakeBackend {
    healthy: bool,
    failing_queries: bool,
    stored: Mutex<Vec<TestResult>>,
    pub queries: AtomicUsize,
}

impl FakeBackend {
    pub fn healthy() -> Self {
        Self {
            healthy: true,
            failing_queries: false,
            stored: Mutex::new(Vec::new()),
            queries: AtomicUsize::new(0),
        }
    }

    pub fn unavailable() -> Self {
        Self {
            healthy: false,
            ..Self::healthy()
        }
    }

    /// Passes the health check, but every results query fails.
    pub fn flaky() -> Self {
        Self {
            failing_queries: true,
            ..Self::healthy()
        }
    }

    pub fn store(&self, results: Vec<TestResult>) {
        *self.stored.lock().unwrap() = results;
    }
}

#[async_trait]
impl BackendApi for FakeBackend {
    async fn health(&self) -> Result<(), ChannelError> {
        if self.healthy {
            Ok(())
        } else {
            Err(ChannelError::Transport("connection refused".to_string()))
        }
    }

    async fn fetch_results(
        &self,
        request_id: &RequestId,
    ) -> Result<Option<StoredResults>, ChannelError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if self.failing_queries {
            return Err(ChannelError::Status {
                status: 503,
                url: format!("/api/results/{}", request_id),
            });
        }
        let results = self.stored.lock().unwrap().clone();
        if results.is_empty() {
            return Ok(None);
        }
        Ok(Some(StoredResults {
            request_id: request_id.clone(),
            subject_id: None,
            results,
            updated_at: Utc::now(),
        }))
    }
}

/// Push source fed from the test through a channel.
pub struct ScriptedPush {
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Result<PushMessage, ChannelError>>>>,
    refuse: bool,
}

impl ScriptedPush {
    pub fn new() -> (Self, mpsc::UnboundedSender<Result<PushMessage, ChannelError>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                receiver: Mutex::new(Some(rx)),
                refuse: false,
            },
            tx,
        )
    }

    /// A source whose every connection attempt fails.
    pub fn refusing() -> Self {
        Self {
            receiver: Mutex::new(None),
            refuse: true,
        }
    }
}

#[async_trait]
impl PushSource for ScriptedPush {
    async fn connect(&self) -> Result<PushStream, ChannelError> {
        if self.refuse {
            return Err(ChannelError::Transport("relay unreachable".to_string()));
        }
        match self.receiver.lock().unwrap().take() {
            Some(rx) => Ok(futures::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            })
            .boxed()),
            None => Ok(futures::stream::pending().boxed()),
        }
    }
}

pub fn push(request_id: &RequestId, results: Vec<TestResult>) -> Result<PushMessage, ChannelError> {
    Ok(PushMessage {
        request_id: Some(request_id.clone()),
        subject_id: None,
        results,
    })
}

pub fn ids(ids: &[&str]) -> Vec<String> {
    ids.iter().map(|id| id.to_string()).collect()
}
