//! Realtime push channel.
//!
//! One server-sent-events connection to the result relay is shared by every
//! request that has push activated. Activation only registers interest in a
//! request id; the connection is opened on first interest, reconnects with
//! capped exponential backoff and is closed once nobody is interested.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::{Activation, ChannelAdapter, ResultSink};
use crate::backend::PushMessage;
use crate::error::ChannelError;
use crate::model::{ChannelKind, RequestId};
use crate::registry::CorrelationRegistry;

/// Stream of decoded push messages.
pub type PushStream = BoxStream<'static, Result<PushMessage, ChannelError>>;

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Something that can open a push stream.
#[async_trait]
pub trait PushSource: Send + Sync {
    async fn connect(&self) -> Result<PushStream, ChannelError>;
}

/// Largest event the decoder buffers before discarding it.
pub const MAX_EVENT_BYTES: usize = 1024 * 1024;

/// Incremental decoder for `text/event-stream` bodies.
///
/// Only `data:` fields are kept; multi-line data is joined with newlines.
/// An event growing past the size limit is dropped up to its terminating
/// blank line.
#[derive(Debug)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    /// Bytes of `buffer` already searched for a delimiter.
    scanned: usize,
    max_event_bytes: usize,
    discarding: bool,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::with_limit(MAX_EVENT_BYTES)
    }
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(max_event_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            scanned: 0,
            max_event_bytes: max_event_bytes.max(2),
            discarding: false,
        }
    }

    /// Feed a chunk and return the data of every event it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer
            .extend(chunk.iter().copied().filter(|byte| *byte != b'\r'));

        let mut events = Vec::new();
        loop {
            // Back up one byte so a delimiter split across chunks is found.
            let start = self.scanned.saturating_sub(1);
            let Some(offset) = self.buffer[start..].windows(2).position(|w| w == b"\n\n") else {
                self.scanned = self.buffer.len();
                break;
            };
            let end = start + offset;
            let block: Vec<u8> = self.buffer.drain(..end + 2).collect();
            self.scanned = 0;
            if std::mem::take(&mut self.discarding) {
                continue;
            }
            let text = String::from_utf8_lossy(&block[..end]);
            let data: Vec<&str> = text
                .lines()
                .filter_map(|line| line.strip_prefix("data:"))
                .map(|value| value.strip_prefix(' ').unwrap_or(value))
                .collect();
            if !data.is_empty() {
                events.push(data.join("\n"));
            }
        }

        if self.buffer.len() > self.max_event_bytes {
            warn!(
                buffered = self.buffer.len(),
                limit = self.max_event_bytes,
                "discarding oversized push event"
            );
            let trailing_newline = self.buffer.last() == Some(&b'\n');
            self.buffer.clear();
            if trailing_newline {
                self.buffer.push(b'\n');
            }
            self.scanned = self.buffer.len();
            self.discarding = true;
        }
        events
    }

    /// Bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

/// [`PushSource`] reading the relay's `/api/events` stream.
pub struct SseSource {
    client: reqwest::Client,
    url: String,
}

impl SseSource {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl PushSource for SseSource {
    async fn connect(&self) -> Result<PushStream, ChannelError> {
        let response = self
            .client
            .get(&self.url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(ChannelError::transport)?;
        if !response.status().is_success() {
            return Err(ChannelError::Status {
                status: response.status().as_u16(),
                url: self.url.clone(),
            });
        }

        let state = (
            response.bytes_stream().boxed(),
            SseDecoder::new(),
            VecDeque::<Result<PushMessage, ChannelError>>::new(),
        );
        let stream = futures::stream::unfold(state, |(mut bytes, mut decoder, mut pending)| async move {
            loop {
                if let Some(item) = pending.pop_front() {
                    return Some((item, (bytes, decoder, pending)));
                }
                match bytes.next().await {
                    Some(Ok(chunk)) => {
                        for data in decoder.feed(&chunk) {
                            pending.push_back(
                                serde_json::from_str::<PushMessage>(&data)
                                    .map_err(|e| ChannelError::Decode(e.to_string())),
                            );
                        }
                    }
                    Some(Err(e)) => {
                        return Some((Err(ChannelError::transport(e)), (bytes, decoder, pending)))
                    }
                    None => return None,
                }
            }
        });
        Ok(stream.boxed())
    }
}

type Interests = Arc<Mutex<HashMap<RequestId, ResultSink>>>;

fn lock_interests(interests: &Interests) -> MutexGuard<'_, HashMap<RequestId, ResultSink>> {
    interests.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared push connection with per-request interest.
pub struct PushAdapter {
    source: Arc<dyn PushSource>,
    registry: Arc<CorrelationRegistry>,
    interests: Interests,
    connection: Mutex<Option<JoinHandle<()>>>,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl PushAdapter {
    pub fn new(source: Arc<dyn PushSource>, registry: Arc<CorrelationRegistry>) -> Self {
        Self {
            source,
            registry,
            interests: Arc::new(Mutex::new(HashMap::new())),
            connection: Mutex::new(None),
            initial_backoff: INITIAL_BACKOFF,
            max_backoff: MAX_BACKOFF,
        }
    }

    /// Sets the reconnect backoff bounds.
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max.max(initial);
        self
    }

    /// Number of requests currently interested in push results.
    pub fn interest_count(&self) -> usize {
        lock_interests(&self.interests).len()
    }

    /// Returns true while the shared connection task is alive.
    pub fn is_connected(&self) -> bool {
        self.connection_slot()
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    fn connection_slot(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.connection.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_connection(&self) {
        let mut slot = self.connection_slot();
        if slot.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            return;
        }
        let task = ConnectionTask {
            source: Arc::clone(&self.source),
            registry: Arc::clone(&self.registry),
            interests: Arc::clone(&self.interests),
            initial_backoff: self.initial_backoff,
            max_backoff: self.max_backoff,
        };
        *slot = Some(tokio::spawn(task.run()));
    }
}

#[async_trait]
impl ChannelAdapter for PushAdapter {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Push
    }

    async fn activate(&self, activation: Activation) -> Result<(), ChannelError> {
        lock_interests(&self.interests).insert(activation.request_id.clone(), activation.sink);
        self.ensure_connection();
        debug!(request_id = %activation.request_id, "push interest registered");
        Ok(())
    }

    async fn deactivate(&self, request_id: &RequestId) {
        lock_interests(&self.interests).remove(request_id);

        // Decide under the slot lock so a concurrent activation either sees the
        // connection closed and reopens it, or is seen here and keeps it.
        let mut slot = self.connection_slot();
        if lock_interests(&self.interests).is_empty() {
            if let Some(handle) = slot.take() {
                handle.abort();
                debug!("push connection closed, no remaining interest");
            }
        }
    }
}

impl Drop for PushAdapter {
    fn drop(&mut self) {
        if let Some(handle) = self.connection_slot().take() {
            handle.abort();
        }
    }
}

struct ConnectionTask {
    source: Arc<dyn PushSource>,
    registry: Arc<CorrelationRegistry>,
    interests: Interests,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl ConnectionTask {
    async fn run(self) {
        let mut backoff = self.initial_backoff;
        loop {
            match self.source.connect().await {
                Ok(mut stream) => {
                    info!("push connection established");
                    backoff = self.initial_backoff;
                    while let Some(item) = stream.next().await {
                        match item {
                            Ok(message) => self.route(message),
                            Err(ChannelError::Decode(reason)) => {
                                warn!(%reason, "skipping undecodable push message");
                            }
                            Err(error) => {
                                self.notify(error);
                                break;
                            }
                        }
                    }
                    debug!("push stream ended");
                }
                Err(error) => self.notify(error),
            }

            if lock_interests(&self.interests).is_empty() {
                return;
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(self.max_backoff);
        }
    }

    fn route(&self, message: PushMessage) {
        let target = match (&message.request_id, &message.subject_id) {
            (Some(request_id), _) => Some(request_id.clone()),
            (None, Some(subject)) => self.registry.resolve_subject(subject),
            (None, None) => None,
        };
        let sink = target.and_then(|id| lock_interests(&self.interests).get(&id).cloned());
        match sink {
            Some(sink) => {
                sink.deliver(message.results);
            }
            None => trace!(request_id = ?message.request_id, "ignoring push message without interest"),
        }
    }

    fn notify(&self, error: ChannelError) {
        warn!(%error, "push connection failed");
        let sinks: Vec<ResultSink> = lock_interests(&self.interests).values().cloned().collect();
        for sink in sinks {
            sink.fail(error.clone());
        }
    }
}
