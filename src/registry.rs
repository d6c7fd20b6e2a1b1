//! Correlation registry: routes channel deliveries to the coordinator task
//! that owns a request.
//!
//! Every in-flight request has exactly one mailbox registered under its
//! request id, and each subject points at its single active request. Closed
//! and cancelled requests stay in the table for a grace period so that late
//! deliveries are recognised and dropped instead of being reported as unknown.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use crate::error::ChannelError;
use crate::model::{CancelReason, ChannelKind, RequestId, SubjectId, TestResult};
use crate::timeout::TimerKind;

/// Messages processed by a request's coordinator task, in receipt order.
#[derive(Debug)]
pub enum Envelope {
    /// A channel reported partial or full results.
    Results {
        channel: ChannelKind,
        results: Vec<TestResult>,
    },
    /// A channel hit a recoverable error.
    ChannelFailed {
        channel: ChannelKind,
        error: ChannelError,
    },
    /// A channel observed the CI run finishing; this is its final word.
    RunFinished {
        channel: ChannelKind,
        outcome: Result<Vec<TestResult>, ChannelError>,
    },
    /// A deadline timer fired.
    Timer(TimerKind),
    /// The request was cancelled or superseded.
    Cancel(CancelReason),
}

/// Sending half of a coordinator task's mailbox.
pub type Mailbox = mpsc::UnboundedSender<Envelope>;

/// Observer invoked for every delivery routed to an active request.
pub type Listener = Arc<dyn Fn(&RequestId, ChannelKind, &[TestResult]) + Send + Sync>;

/// Key a listener is subscribed under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SubscriptionKey {
    Request(RequestId),
    Subject(SubjectId),
}

/// What happened to a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Posted to the owning coordinator task.
    Routed,
    /// The request is cancelled or finished; the payload was dropped.
    Discarded,
    /// No such request (never registered, or already swept).
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RoutePhase {
    Active,
    Cancelled,
    Closed { until: Instant },
}

struct Route {
    subject: SubjectId,
    mailbox: Mailbox,
    phase: RoutePhase,
}

#[derive(Default)]
struct RegistryInner {
    routes: HashMap<RequestId, Route>,
    subjects: HashMap<SubjectId, RequestId>,
    listeners: HashMap<SubscriptionKey, Listener>,
}

/// Request id and subject id to mailbox/listener table.
#[derive(Default)]
pub struct CorrelationRegistry {
    inner: Mutex<RegistryInner>,
}

impl CorrelationRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register the mailbox for a new request.
    ///
    /// The subject now points at this request. Returns the request that was
    /// previously active for the same subject, which the caller is expected
    /// to cancel as superseded.
    pub fn register(
        &self,
        request_id: RequestId,
        subject: SubjectId,
        mailbox: Mailbox,
    ) -> Option<RequestId> {
        let mut inner = self.lock();
        let previous = inner
            .subjects
            .insert(subject.clone(), request_id.clone())
            .filter(|prev| {
                *prev != request_id
                    && inner
                        .routes
                        .get(prev)
                        .map(|route| route.phase == RoutePhase::Active)
                        .unwrap_or(false)
            });
        inner.routes.insert(
            request_id,
            Route {
                subject,
                mailbox,
                phase: RoutePhase::Active,
            },
        );
        previous
    }

    /// Route results to the owning request if it is still active.
    pub fn deliver(
        &self,
        request_id: &RequestId,
        channel: ChannelKind,
        results: Vec<TestResult>,
    ) -> Delivery {
        let listeners = {
            let inner = self.lock();
            let Some(route) = inner.routes.get(request_id) else {
                debug!(request_id = %request_id, channel = %channel, "delivery for unknown request");
                return Delivery::Unknown;
            };
            if route.phase != RoutePhase::Active {
                debug!(request_id = %request_id, channel = %channel, "discarding late delivery");
                return Delivery::Discarded;
            }

            let listeners: Vec<Listener> = [
                SubscriptionKey::Request(request_id.clone()),
                SubscriptionKey::Subject(route.subject.clone()),
            ]
            .iter()
            .filter_map(|key| inner.listeners.get(key).cloned())
            .collect();

            let envelope = Envelope::Results {
                channel,
                results: results.clone(),
            };
            if route.mailbox.send(envelope).is_err() {
                return Delivery::Discarded;
            }
            listeners
        };

        for listener in listeners {
            listener(request_id, channel, &results);
        }
        Delivery::Routed
    }

    /// Route results addressed only by subject (legacy payloads).
    pub fn deliver_for_subject(
        &self,
        subject: &SubjectId,
        channel: ChannelKind,
        results: Vec<TestResult>,
    ) -> Delivery {
        match self.resolve_subject(subject) {
            Some(request_id) => self.deliver(&request_id, channel, results),
            None => Delivery::Unknown,
        }
    }

    /// Post any other envelope to an active request.
    pub fn post(&self, request_id: &RequestId, envelope: Envelope) -> Delivery {
        let inner = self.lock();
        match inner.routes.get(request_id) {
            None => Delivery::Unknown,
            Some(route) if route.phase != RoutePhase::Active => Delivery::Discarded,
            Some(route) => match route.mailbox.send(envelope) {
                Ok(()) => Delivery::Routed,
                Err(_) => Delivery::Discarded,
            },
        }
    }

    /// Mark an active request cancelled and wake its task.
    ///
    /// From this point every delivery for the id is discarded. Returns false
    /// if the request is unknown or no longer active.
    pub fn cancel(&self, request_id: &RequestId, reason: CancelReason) -> bool {
        let mut inner = self.lock();
        let Some(route) = inner.routes.get_mut(request_id) else {
            return false;
        };
        if route.phase != RoutePhase::Active {
            return false;
        }
        route.phase = RoutePhase::Cancelled;
        // The task may already be gone; the phase change alone is enough then.
        let _ = route.mailbox.send(Envelope::Cancel(reason));
        true
    }

    /// Returns true if the request was cancelled (and not yet swept).
    pub fn is_cancelled(&self, request_id: &RequestId) -> bool {
        self.lock()
            .routes
            .get(request_id)
            .map(|route| route.phase == RoutePhase::Cancelled)
            .unwrap_or(false)
    }

    /// Returns true if deliveries for the request would be routed.
    pub fn is_active(&self, request_id: &RequestId) -> bool {
        self.lock()
            .routes
            .get(request_id)
            .map(|route| route.phase == RoutePhase::Active)
            .unwrap_or(false)
    }

    /// Mark a finished request closed; it is swept after `grace`.
    pub fn close(&self, request_id: &RequestId, grace: Duration) {
        let mut inner = self.lock();
        let subject = match inner.routes.get_mut(request_id) {
            Some(route) => {
                route.phase = RoutePhase::Closed {
                    until: Instant::now() + grace,
                };
                route.subject.clone()
            }
            None => return,
        };
        if inner.subjects.get(&subject) == Some(request_id) {
            inner.subjects.remove(&subject);
        }
    }

    /// Drop closed requests whose grace period has elapsed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.lock();
        let before = inner.routes.len();
        inner.routes.retain(|_, route| match route.phase {
            RoutePhase::Closed { until } => until > now,
            _ => true,
        });
        before - inner.routes.len()
    }

    /// The active request for a subject, if any.
    pub fn resolve_subject(&self, subject: &SubjectId) -> Option<RequestId> {
        self.lock().subjects.get(subject).cloned()
    }

    /// Subscribe a listener; replaces and returns any previous listener for the key.
    pub fn subscribe(&self, key: SubscriptionKey, listener: Listener) -> Option<Listener> {
        self.lock().listeners.insert(key, listener)
    }

    /// Remove the listener for a key. Returns true if one was registered.
    pub fn unsubscribe(&self, key: &SubscriptionKey) -> bool {
        self.lock().listeners.remove(key).is_some()
    }

    /// Number of tracked requests, including closed ones awaiting sweep.
    pub fn len(&self) -> usize {
        self.lock().routes.len()
    }

    /// Returns true if nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
