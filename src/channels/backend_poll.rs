//! Backend poll channel: periodically asks the relay for stored results.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{Activation, ChannelAdapter, TaskSet};
use crate::backend::{BackendApi, StoredResults};
use crate::error::ChannelError;
use crate::model::{ChannelKind, RequestId, TestResult, TestStatus};
use crate::registry::Delivery;
use crate::timeout::TimeoutConfig;

/// Polls `fetch_results` for every active request.
pub struct BackendPollAdapter {
    backend: Arc<dyn BackendApi>,
    interval: Duration,
    retry_attempts: u32,
    retry_backoff: Duration,
    tasks: TaskSet,
}

impl BackendPollAdapter {
    pub fn new(backend: Arc<dyn BackendApi>, timeouts: &TimeoutConfig) -> Self {
        Self {
            backend,
            interval: timeouts.backend_poll_interval,
            retry_attempts: timeouts.backend_retry_attempts.max(1),
            retry_backoff: timeouts.backend_retry_backoff,
            tasks: TaskSet::new(),
        }
    }

    /// Number of requests currently being polled.
    pub fn polling(&self) -> usize {
        self.tasks.running()
    }
}

/// One query with bounded retry; the backoff grows linearly with the attempt.
async fn fetch_with_retry(
    backend: &dyn BackendApi,
    request_id: &RequestId,
    attempts: u32,
    backoff: Duration,
) -> Result<Option<StoredResults>, ChannelError> {
    let mut last = None;
    for attempt in 1..=attempts {
        match backend.fetch_results(request_id).await {
            Ok(stored) => return Ok(stored),
            Err(error) => {
                debug!(request_id = %request_id, attempt, %error, "backend query failed");
                last = Some(error);
                if attempt < attempts {
                    tokio::time::sleep(backoff * attempt).await;
                }
            }
        }
    }
    Err(ChannelError::Exhausted {
        attempts,
        last: last.map(|e| e.to_string()).unwrap_or_default(),
    })
}

/// Results that differ from what was last reported for the same test case.
fn changed_results(
    reported: &mut HashMap<String, (TestStatus, u64)>,
    results: Vec<TestResult>,
) -> Vec<TestResult> {
    results
        .into_iter()
        .filter(|result| {
            let fingerprint = (result.status, result.duration_ms);
            reported.insert(result.test_case_id.clone(), fingerprint) != Some(fingerprint)
        })
        .collect()
}

#[async_trait]
impl ChannelAdapter for BackendPollAdapter {
    fn kind(&self) -> ChannelKind {
        ChannelKind::BackendPoll
    }

    async fn activate(&self, activation: Activation) -> Result<(), ChannelError> {
        let backend = Arc::clone(&self.backend);
        let interval = self.interval;
        let attempts = self.retry_attempts;
        let backoff = self.retry_backoff;
        let request_id = activation.request_id.clone();
        let sink = activation.sink;

        let handle = tokio::spawn(async move {
            let mut reported = HashMap::new();
            loop {
                tokio::time::sleep(interval).await;
                let delivery = match fetch_with_retry(backend.as_ref(), sink.request_id(), attempts, backoff).await {
                    Ok(Some(stored)) => {
                        let fresh = changed_results(&mut reported, stored.results);
                        if fresh.is_empty() {
                            continue;
                        }
                        sink.deliver(fresh)
                    }
                    Ok(None) => continue,
                    Err(error) => {
                        warn!(request_id = %sink.request_id(), %error, "backend poll failed");
                        sink.fail(error)
                    }
                };
                if delivery != Delivery::Routed {
                    debug!(request_id = %sink.request_id(), "request closed, backend poll stopping");
                    return;
                }
            }
        });
        self.tasks.insert(request_id, handle);
        Ok(())
    }

    async fn deactivate(&self, request_id: &RequestId) {
        self.tasks.abort(request_id);
    }
}
