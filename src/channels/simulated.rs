//! Simulated results for runs without a CI system.
//!
//! Each test case's outcome is derived from a hash of the request and test
//! case ids, so repeated demo runs of the same request agree.

use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::{Activation, ChannelAdapter, TaskSet};
use crate::error::ChannelError;
use crate::model::{ChannelKind, RequestId, TestResult, TestStatus};

/// Log text attached to every synthetic result.
pub const SIMULATED_LOGS: &str = "Simulated execution (no CI configured)";

/// Hash bytes below this pass: 205/256 is roughly 80%.
const PASS_THRESHOLD: u8 = 205;

/// Fabricate the result for one test case.
pub fn synthesize(request_id: &RequestId, test_case_id: &str) -> TestResult {
    let mut hasher = Sha256::new();
    hasher.update(request_id.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(test_case_id.as_bytes());
    let digest = hasher.finalize();

    let status = if digest[0] < PASS_THRESHOLD {
        TestStatus::Passed
    } else {
        TestStatus::Failed
    };
    let duration_ms = 500 + u64::from(u16::from_be_bytes([digest[1], digest[2]])) % 4500;

    TestResult::new(test_case_id, status)
        .with_duration_ms(duration_ms)
        .with_logs(SIMULATED_LOGS)
}

/// Delivers synthetic results once after a fixed delay.
pub struct SimulatedAdapter {
    delay: Duration,
    tasks: TaskSet,
}

impl SimulatedAdapter {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            tasks: TaskSet::new(),
        }
    }
}

#[async_trait]
impl ChannelAdapter for SimulatedAdapter {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Simulated
    }

    async fn activate(&self, activation: Activation) -> Result<(), ChannelError> {
        let delay = self.delay;
        let request_id = activation.request_id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let results: Vec<TestResult> = activation
                .test_case_ids
                .iter()
                .map(|id| synthesize(&activation.request_id, id))
                .collect();
            debug!(request_id = %activation.request_id, count = results.len(), "delivering simulated results");
            activation.sink.deliver(results);
        });
        self.tasks.insert(request_id, handle);
        Ok(())
    }

    async fn deactivate(&self, request_id: &RequestId) {
        self.tasks.abort(request_id);
    }
}
