//! Channel and timer ownership for one request.
//!
//! Every exit path of a request tears down through
//! [`ChannelSupervisor::deactivate_all`], which disarms both deadlines and
//! deactivates every channel that is still active.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::channels::{Activation, ChannelSet, ResultSink};
use crate::ci::RunHandle;
use crate::error::ChannelError;
use crate::model::{ChannelKind, RequestId, SubjectId};
use crate::registry::{CorrelationRegistry, Mailbox};
use crate::timeout::{DeadlineTimers, TimerKind};

/// Owns a request's active channels and deadline timers.
pub struct ChannelSupervisor {
    request_id: RequestId,
    subject_id: SubjectId,
    test_case_ids: Vec<String>,
    channels: ChannelSet,
    registry: Arc<CorrelationRegistry>,
    active: BTreeSet<ChannelKind>,
    timers: DeadlineTimers,
}

impl ChannelSupervisor {
    pub fn new(
        request_id: RequestId,
        subject_id: SubjectId,
        test_case_ids: Vec<String>,
        channels: ChannelSet,
        registry: Arc<CorrelationRegistry>,
        mailbox: Mailbox,
    ) -> Self {
        Self {
            request_id,
            subject_id,
            test_case_ids,
            channels,
            registry,
            active: BTreeSet::new(),
            timers: DeadlineTimers::new(mailbox),
        }
    }

    /// Channels currently active.
    pub fn active(&self) -> &BTreeSet<ChannelKind> {
        &self.active
    }

    pub fn arm(&mut self, kind: TimerKind, after: Duration) {
        self.timers.arm(kind, after);
    }

    /// Activate one channel for the request.
    pub async fn activate(
        &mut self,
        kind: ChannelKind,
        run: Option<RunHandle>,
    ) -> Result<(), ChannelError> {
        if self.active.contains(&kind) {
            return Ok(());
        }
        let adapter = self
            .channels
            .get(kind)
            .cloned()
            .ok_or_else(|| ChannelError::Unavailable(format!("no {} channel configured", kind)))?;

        let activation = Activation {
            request_id: self.request_id.clone(),
            subject_id: self.subject_id.clone(),
            test_case_ids: self.test_case_ids.clone(),
            run,
            sink: ResultSink::new(Arc::clone(&self.registry), self.request_id.clone(), kind),
        };
        adapter.activate(activation).await?;
        self.active.insert(kind);
        debug!(request_id = %self.request_id, channel = %kind, "channel activated");
        Ok(())
    }

    /// Activate several channels; failures are logged. Returns the kinds that started.
    pub async fn activate_all(
        &mut self,
        kinds: &[ChannelKind],
        run: Option<RunHandle>,
    ) -> Vec<ChannelKind> {
        let mut started = Vec::new();
        for &kind in kinds {
            match self.activate(kind, run.clone()).await {
                Ok(()) => started.push(kind),
                Err(error) => {
                    warn!(request_id = %self.request_id, channel = %kind, %error, "channel activation failed");
                }
            }
        }
        started
    }

    /// Deactivate one channel. No-op if it is not active.
    pub async fn deactivate(&mut self, kind: ChannelKind) {
        if !self.active.remove(&kind) {
            return;
        }
        if let Some(adapter) = self.channels.get(kind).cloned() {
            adapter.deactivate(&self.request_id).await;
        }
        debug!(request_id = %self.request_id, channel = %kind, "channel deactivated");
    }

    /// Forget a channel whose work ended on its own.
    pub fn mark_finished(&mut self, kind: ChannelKind) {
        self.active.remove(&kind);
    }

    /// Disarm every timer and deactivate every active channel.
    pub async fn deactivate_all(&mut self) {
        self.timers.clear();
        let kinds: Vec<ChannelKind> = self.active.iter().copied().collect();
        for kind in kinds {
            self.deactivate(kind).await;
        }
    }
}
