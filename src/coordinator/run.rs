//! The per-request coordinator task.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::ci::{CiSystem, DispatchRequest, RunHandle};
use crate::error::ChannelError;
use crate::model::{ChannelKind, ExecutionOutcome, ExecutionState, TestResult};
use crate::registry::{Envelope, Mailbox};
use crate::timeout::TimerKind;

use super::handle::HandleShared;
use super::request::ExecutionRequest;
use super::supervisor::ChannelSupervisor;
use super::{Inner, ResolvedMode};

/// Ceiling for the doubling record store retry backoff.
const MAX_STORE_BACKOFF: Duration = Duration::from_secs(30);

/// Owns one request from dispatch to its terminal outcome.
pub(crate) struct RequestTask {
    inner: Arc<Inner>,
    request: ExecutionRequest,
    mode: ResolvedMode,
    shared: Arc<HandleShared>,
    supervisor: ChannelSupervisor,
    inbox: mpsc::UnboundedReceiver<Envelope>,
    /// Accepted results not yet written to the store.
    pending: Vec<TestResult>,
    /// Envelopes that arrived while dispatching.
    stash: Vec<Envelope>,
    started: Instant,
}

impl RequestTask {
    pub(crate) fn new(
        inner: Arc<Inner>,
        request: ExecutionRequest,
        mode: ResolvedMode,
        shared: Arc<HandleShared>,
        mailbox: Mailbox,
        inbox: mpsc::UnboundedReceiver<Envelope>,
    ) -> Self {
        let supervisor = ChannelSupervisor::new(
            request.request_id().clone(),
            request.subject_id().clone(),
            request.requested().to_vec(),
            inner.channels.clone(),
            Arc::clone(&inner.registry),
            mailbox,
        );
        Self {
            inner,
            request,
            mode,
            shared,
            supervisor,
            inbox,
            pending: Vec::new(),
            stash: Vec::new(),
            started: Instant::now(),
        }
    }

    pub(crate) async fn run(mut self) {
        let outcome = self.drive().await;
        self.finish(outcome).await;
    }

    async fn drive(&mut self) -> ExecutionOutcome {
        self.advance(ExecutionState::Dispatching);
        self.supervisor
            .arm(TimerKind::OuterDeadline, self.inner.timeouts.outer_deadline);

        let mut backend_available = false;
        if let ResolvedMode::Ci(ci) = self.mode.clone() {
            backend_available = self.probe_backend().await;
            match self.dispatch(ci).await {
                Ok(run) => {
                    info!(
                        request_id = %self.request.request_id(),
                        run_id = run.run_id,
                        url = run.html_url.as_deref().unwrap_or(""),
                        "CI run dispatched"
                    );
                    self.request.set_run(run);
                }
                Err(outcome) => return outcome,
            }
        }

        self.enter_awaiting(backend_available).await;

        for envelope in std::mem::take(&mut self.stash) {
            if let Some(outcome) = self.handle(envelope).await {
                return outcome;
            }
        }

        loop {
            let Some(envelope) = self.inbox.recv().await else {
                return ExecutionOutcome::failed("coordinator mailbox closed");
            };
            if let Some(outcome) = self.handle(envelope).await {
                return outcome;
            }
        }
    }

    /// Move the request to `to`, journaling the edge. Invalid edges are logged and skipped.
    fn advance(&mut self, to: ExecutionState) -> bool {
        match self.request.transition(to) {
            Ok(from) => {
                debug!(request_id = %self.request.request_id(), %from, %to, "state transition");
                if let Some(journal) = &self.inner.journal {
                    journal.transition(self.request.request_id(), from, to);
                }
                self.inner.summaries.update(self.request.summary());
                true
            }
            Err(error) => {
                warn!(request_id = %self.request.request_id(), %error, "ignoring state change");
                false
            }
        }
    }

    async fn probe_backend(&self) -> bool {
        let Some(backend) = self.inner.backend.as_ref() else {
            return false;
        };
        let probe: Result<Result<(), ChannelError>, _> =
            timeout(self.inner.timeouts.probe_timeout, backend.health()).await;
        match probe {
            Ok(Ok(())) => true,
            Ok(Err(error)) => {
                warn!(request_id = %self.request.request_id(), %error, "backend unavailable, relying on CI polling");
                false
            }
            Err(_) => {
                warn!(request_id = %self.request.request_id(), "backend probe timed out, relying on CI polling");
                false
            }
        }
    }

    /// Dispatch while still honouring cancellation and the outer deadline.
    async fn dispatch(&mut self, ci: Arc<dyn CiSystem>) -> Result<RunHandle, ExecutionOutcome> {
        let request = DispatchRequest {
            request_id: self.request.request_id().clone(),
            subject_id: self.request.subject_id().clone(),
            test_case_ids: self.request.requested().to_vec(),
            callback_url: self.inner.callback_url.clone(),
        };
        let dispatch = ci.dispatch_workflow(&request);
        tokio::pin!(dispatch);

        loop {
            tokio::select! {
                result = &mut dispatch => {
                    return result.map_err(|error| {
                        warn!(request_id = %request.request_id, %error, "dispatch failed");
                        ExecutionOutcome::failed(error.to_string())
                    });
                }
                envelope = self.inbox.recv() => match envelope {
                    Some(Envelope::Cancel(reason)) => return Err(reason.into_outcome()),
                    Some(Envelope::Timer(TimerKind::OuterDeadline)) => {
                        return Err(ExecutionOutcome::TimedOut)
                    }
                    Some(other) => self.stash.push(other),
                    None => return Err(ExecutionOutcome::failed("coordinator mailbox closed")),
                },
            }
        }
    }

    async fn enter_awaiting(&mut self, backend_available: bool) {
        self.advance(ExecutionState::AwaitingResults);
        let run = self.request.run().cloned();

        match (&self.mode, backend_available) {
            (ResolvedMode::Simulated, _) => {
                self.supervisor
                    .activate_all(&[ChannelKind::Simulated], None)
                    .await;
            }
            (ResolvedMode::Ci(_), true) => {
                let started = self
                    .supervisor
                    .activate_all(&[ChannelKind::Push, ChannelKind::BackendPoll], run.clone())
                    .await;
                if started.is_empty() {
                    self.supervisor.activate_all(&[ChannelKind::CiPoll], run).await;
                }
            }
            (ResolvedMode::Ci(_), false) => {
                self.supervisor.activate_all(&[ChannelKind::CiPoll], run).await;
            }
        }

        self.sync_channels();
        self.supervisor
            .arm(TimerKind::PrimaryWait, self.inner.timeouts.primary_wait);
    }

    /// Mirror the supervisor's active channels into the request and its summary.
    fn sync_channels(&mut self) {
        self.request
            .set_active_channels(self.supervisor.active().clone());
        self.inner.summaries.update(self.request.summary());
    }

    /// Process one envelope. Returns the outcome once the request is done.
    async fn handle(&mut self, envelope: Envelope) -> Option<ExecutionOutcome> {
        match envelope {
            Envelope::Results { channel, results } => {
                self.accept(channel, results).await;
                if self.request.all_terminal() {
                    return Some(ExecutionOutcome::Completed);
                }
                None
            }
            Envelope::ChannelFailed { channel, error } => {
                warn!(request_id = %self.request.request_id(), %channel, %error, "channel error");
                None
            }
            Envelope::RunFinished { channel, outcome } => {
                self.supervisor.mark_finished(channel);
                self.sync_channels();
                match outcome {
                    Ok(results) => {
                        self.accept(channel, results).await;
                        if self.request.all_terminal() {
                            Some(ExecutionOutcome::Completed)
                        } else {
                            Some(ExecutionOutcome::failed(format!(
                                "CI run finished without results for {}",
                                self.request.unresolved().join(", ")
                            )))
                        }
                    }
                    Err(error) => Some(ExecutionOutcome::failed(error.to_string())),
                }
            }
            Envelope::Timer(TimerKind::PrimaryWait) => {
                self.on_primary_wait().await;
                None
            }
            Envelope::Timer(TimerKind::OuterDeadline) => Some(ExecutionOutcome::TimedOut),
            Envelope::Cancel(reason) => Some(reason.into_outcome()),
        }
    }

    async fn accept(&mut self, channel: ChannelKind, results: Vec<TestResult>) {
        if self.inner.registry.is_cancelled(self.request.request_id()) {
            debug!(request_id = %self.request.request_id(), %channel, "dropping results for cancelled request");
            return;
        }
        let accepted = self.request.record_results(results);
        if accepted.is_empty() {
            return;
        }
        debug!(
            request_id = %self.request.request_id(),
            %channel,
            accepted = accepted.len(),
            "results received"
        );
        self.shared.progress(&accepted);
        for result in accepted {
            match self
                .pending
                .iter_mut()
                .find(|queued| queued.test_case_id == result.test_case_id)
            {
                Some(queued) => *queued = result,
                None => self.pending.push(result),
            }
        }
        self.reconcile().await;
        self.inner.summaries.update(self.request.summary());
    }

    /// Write pending results. On failure they stay queued for the next batch.
    async fn reconcile(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        match self
            .inner
            .reconciler
            .apply(self.request.request_id(), &self.pending)
            .await
        {
            Ok(count) => {
                debug!(
                    request_id = %self.request.request_id(),
                    applied = count.applied,
                    unchanged = count.unchanged,
                    "reconciled"
                );
                self.pending.clear();
            }
            Err(error) => {
                warn!(
                    request_id = %self.request.request_id(),
                    queued = self.pending.len(),
                    %error,
                    "reconciliation failed, will retry"
                );
            }
        }
    }

    async fn on_primary_wait(&mut self) {
        if self.request.state() != ExecutionState::AwaitingResults || self.request.all_terminal() {
            return;
        }
        let Some(run) = self.request.run().cloned() else {
            debug!(request_id = %self.request.request_id(), "primary wait elapsed without a CI run");
            return;
        };

        info!(
            request_id = %self.request.request_id(),
            unresolved = self.request.unresolved().len(),
            "primary wait elapsed, polling CI"
        );
        self.advance(ExecutionState::Polling);
        self.supervisor.deactivate(ChannelKind::Push).await;
        self.supervisor.deactivate(ChannelKind::BackendPoll).await;
        if let Err(error) = self.supervisor.activate(ChannelKind::CiPoll, Some(run)).await {
            warn!(request_id = %self.request.request_id(), %error, "CI polling unavailable");
        }
        self.sync_channels();
    }

    /// Retry pending writes with doubling backoff until they land or `until` passes.
    async fn flush_pending(&mut self, until: Instant) {
        let mut backoff = self
            .inner
            .timeouts
            .store_retry_backoff
            .max(Duration::from_millis(10));
        loop {
            self.reconcile().await;
            if self.pending.is_empty() {
                return;
            }
            let now = Instant::now();
            if now >= until {
                return;
            }
            tokio::time::sleep(backoff.min(until - now)).await;
            backoff = (backoff * 2).min(MAX_STORE_BACKOFF);
        }
    }

    async fn finish(mut self, outcome: ExecutionOutcome) {
        self.supervisor.deactivate_all().await;
        self.sync_channels();

        let timeouts = &self.inner.timeouts;
        let grace_end = Instant::now() + timeouts.result_grace;
        let until = self
            .started
            .checked_add(timeouts.outer_deadline)
            .map_or(grace_end, |deadline| deadline.max(grace_end));
        let unreconciled: Vec<String> = if outcome.state() == ExecutionState::Cancelled {
            if !self.pending.is_empty() {
                debug!(
                    request_id = %self.request.request_id(),
                    discarded = self.pending.len(),
                    "cancelled with unwritten results"
                );
            }
            self.pending.clear();
            Vec::new()
        } else {
            self.flush_pending(until).await;
            self.pending.iter().map(|r| r.test_case_id.clone()).collect()
        };

        let outcome = if unreconciled.is_empty() {
            outcome
        } else {
            warn!(
                request_id = %self.request.request_id(),
                unreconciled = unreconciled.len(),
                "record store never accepted the final results"
            );
            if outcome.is_completed() {
                ExecutionOutcome::failed(format!(
                    "results not recorded for {}",
                    unreconciled.join(", ")
                ))
            } else {
                outcome
            }
        };
        let target = outcome.state();
        self.advance(target);

        let request_id = self.request.request_id().clone();
        let grace = self.inner.timeouts.result_grace;
        self.inner.registry.close(&request_id, grace);
        let registry = Arc::clone(&self.inner.registry);
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            registry.sweep();
        });

        let mut report = self.request.report(outcome);
        report.unreconciled = unreconciled;
        self.inner.summaries.update(self.request.summary());
        if let Some(journal) = &self.inner.journal {
            journal.request_complete(&report);
        }
        info!(
            request_id = %request_id,
            subject = %report.subject_id,
            state = %target,
            unresolved = report.unresolved.len(),
            "{}",
            report.outcome.banner()
        );
        self.shared.finish(report);
    }
}
