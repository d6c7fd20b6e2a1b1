//! Cancellable deadline timers for a single request.
//!
//! Each armed timer is a background task that sleeps and then posts a
//! [`Envelope::Timer`] into the owning request's mailbox. Timers are owned by
//! [`DeadlineTimers`]; clearing (or dropping) it aborts every pending task, so
//! no exit path can leave a timer behind.

use std::collections::HashMap;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::trace;

use crate::registry::{Envelope, Mailbox};

/// The two independent deadlines of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Push/backend channels had their chance; fall back to CI polling.
    PrimaryWait,
    /// Absolute bound; the request times out.
    OuterDeadline,
}

/// Owner of a request's armed timers.
pub struct DeadlineTimers {
    /// Mailbox the timers post into.
    mailbox: Mailbox,
    /// Pending timer tasks by kind.
    tasks: HashMap<TimerKind, JoinHandle<()>>,
}

impl DeadlineTimers {
    /// Creates an empty timer set posting into `mailbox`.
    pub fn new(mailbox: Mailbox) -> Self {
        Self {
            mailbox,
            tasks: HashMap::new(),
        }
    }

    /// Arms a timer, replacing any pending timer of the same kind.
    pub fn arm(&mut self, kind: TimerKind, after: Duration) {
        self.disarm(kind);

        let mailbox = self.mailbox.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            trace!(?kind, "deadline elapsed");
            // The request may have finished in the meantime.
            let _ = mailbox.send(Envelope::Timer(kind));
        });
        self.tasks.insert(kind, handle);
    }

    /// Aborts a pending timer. Returns true if one was armed.
    pub fn disarm(&mut self, kind: TimerKind) -> bool {
        match self.tasks.remove(&kind) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Returns true if a timer of this kind is armed and has not fired yet.
    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.tasks
            .get(&kind)
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Aborts every pending timer.
    pub fn clear(&mut self) {
        for (_, handle) in self.tasks.drain() {
            handle.abort();
        }
    }
}

impl Drop for DeadlineTimers {
    fn drop(&mut self) {
        self.clear();
    }
}
