//! CI status poll channel.
//!
//! Polls the run status until the CI run completes, then downloads and
//! parses the result artifacts and reports them as the run's final outcome.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{Activation, ChannelAdapter, ResultSink, TaskSet};
use crate::ci::{parse_artifacts, CiSystem, RunHandle};
use crate::error::ChannelError;
use crate::model::{ChannelKind, RequestId, TestResult};
use crate::registry::Delivery;
use crate::timeout::TimeoutConfig;

/// Polls the CI system for one run per active request.
pub struct CiPollAdapter {
    ci: Arc<dyn CiSystem>,
    interval: Duration,
    max_consecutive_errors: u32,
    tasks: TaskSet,
}

impl CiPollAdapter {
    pub fn new(ci: Arc<dyn CiSystem>, timeouts: &TimeoutConfig) -> Self {
        Self {
            ci,
            interval: timeouts.ci_poll_interval,
            max_consecutive_errors: timeouts.ci_max_consecutive_errors.max(1),
            tasks: TaskSet::new(),
        }
    }
}

async fn collect_results(ci: &dyn CiSystem, run: &RunHandle) -> Result<Vec<TestResult>, ChannelError> {
    let artifacts = ci.run_artifacts(run).await?;
    Ok(parse_artifacts(&artifacts)?)
}

async fn poll_run(
    ci: Arc<dyn CiSystem>,
    run: RunHandle,
    sink: ResultSink,
    interval: Duration,
    max_errors: u32,
) {
    let mut consecutive_errors = 0u32;
    loop {
        tokio::time::sleep(interval).await;
        if !sink.is_open() {
            return;
        }

        let failure = match ci.run_status(&run).await {
            Ok(status) if status.is_completed() => {
                info!(
                    request_id = %sink.request_id(),
                    run_id = run.run_id,
                    conclusion = status.conclusion.as_deref().unwrap_or("unknown"),
                    "CI run completed"
                );
                match collect_results(ci.as_ref(), &run).await {
                    Ok(results) => {
                        sink.finish(Ok(results));
                        return;
                    }
                    // Artifacts that exist but cannot be parsed will not improve.
                    Err(error @ ChannelError::Artifact(_)) => {
                        sink.finish(Err(error));
                        return;
                    }
                    Err(error) => error,
                }
            }
            Ok(status) => {
                debug!(request_id = %sink.request_id(), state = ?status.state, "CI run not finished");
                consecutive_errors = 0;
                continue;
            }
            Err(error) => error,
        };

        consecutive_errors += 1;
        warn!(
            request_id = %sink.request_id(),
            attempt = consecutive_errors,
            error = %failure,
            "CI poll failed"
        );
        if consecutive_errors >= max_errors {
            sink.finish(Err(ChannelError::Exhausted {
                attempts: consecutive_errors,
                last: failure.to_string(),
            }));
            return;
        }
        if sink.fail(failure) != Delivery::Routed {
            return;
        }
    }
}

#[async_trait]
impl ChannelAdapter for CiPollAdapter {
    fn kind(&self) -> ChannelKind {
        ChannelKind::CiPoll
    }

    async fn activate(&self, activation: Activation) -> Result<(), ChannelError> {
        let run = activation.run.ok_or_else(|| {
            ChannelError::Unavailable("no CI run to poll".to_string())
        })?;
        let handle = tokio::spawn(poll_run(
            Arc::clone(&self.ci),
            run,
            activation.sink,
            self.interval,
            self.max_consecutive_errors,
        ));
        self.tasks.insert(activation.request_id, handle);
        Ok(())
    }

    async fn deactivate(&self, request_id: &RequestId) {
        self.tasks.abort(request_id);
    }
}
