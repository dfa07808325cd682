use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tracing::debug;

use conductor_core::agent::EventSink;
use conductor_core::events::StreamEvent;
use conductor_core::ids::{RequestId, StreamId, SubscriberId, TenantId};

use crate::error::StreamError;

use super::StreamConfig;

/// Lifecycle of a stream session. Every state but `Active` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Active,
    Complete,
    Cancelled,
    Error,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Active)
    }
}

/// Point-in-time view of one session.
#[derive(Clone, Debug, Serialize)]
pub struct SessionStats {
    pub stream_id: StreamId,
    pub request_id: RequestId,
    pub tenant_id: TenantId,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub buffered_events: usize,
    pub subscribers: usize,
    pub dropped_events: u64,
    pub idle_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct Inner {
    state: SessionState,
    error: Option<String>,
    last_activity: Instant,
    buffer: VecDeque<StreamEvent>,
    subscribers: HashMap<SubscriberId, mpsc::Sender<StreamEvent>>,
    dropped: u64,
}

/// Live event relay for one execution request.
///
/// Keeps a bounded replay buffer and fans every event out to bounded
/// per-subscriber channels. Delivery is at-most-once: a subscriber whose
/// channel is full misses the event.
pub struct StreamSession {
    id: StreamId,
    request_id: RequestId,
    tenant_id: TenantId,
    created_at: Instant,
    created_wall: DateTime<Utc>,
    buffer_capacity: usize,
    subscriber_capacity: usize,
    inner: Mutex<Inner>,
}

impl StreamSession {
    pub fn new(request_id: RequestId, tenant_id: TenantId, config: &StreamConfig) -> Self {
        let now = Instant::now();
        Self {
            id: StreamId::new(),
            request_id,
            tenant_id,
            created_at: now,
            created_wall: Utc::now(),
            buffer_capacity: config.buffer_capacity.max(1),
            subscriber_capacity: config.subscriber_capacity.max(1),
            inner: Mutex::new(Inner {
                state: SessionState::Active,
                error: None,
                last_activity: now,
                buffer: VecDeque::with_capacity(config.buffer_capacity),
                subscribers: HashMap::new(),
                dropped: 0,
            }),
        }
    }

    pub fn id(&self) -> &StreamId {
        &self.id
    }

    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub fn error(&self) -> Option<String> {
        self.inner.lock().error.clone()
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    /// Buffer the event and offer it to every subscriber.
    ///
    /// Returns false once the session is closed; the buffer is frozen then.
    pub fn emit(&self, event: StreamEvent) -> bool {
        let mut inner = self.inner.lock();
        if inner.state.is_terminal() {
            return false;
        }
        inner.last_activity = Instant::now();

        if inner.buffer.len() >= self.buffer_capacity {
            inner.buffer.pop_front();
        }
        inner.buffer.push_back(event.clone());

        let mut gone = Vec::new();
        let mut dropped = 0;
        for (id, tx) in &inner.subscribers {
            match offer(id, tx, event.clone()) {
                Ok(true) => {}
                Ok(false) => gone.push(id.clone()),
                Err(_) => dropped += 1,
            }
        }
        inner.dropped += dropped;
        if dropped > 0 {
            debug!(stream_id = %self.id, event_type = %event.event_type, dropped, "slow subscribers missed an event");
        }
        for id in gone {
            inner.subscribers.remove(&id);
        }
        true
    }

    /// Register a subscriber with its own bounded channel.
    pub fn add_subscriber(&self) -> Result<(SubscriberId, mpsc::Receiver<StreamEvent>), StreamError> {
        let (id, _, rx) = self.subscribe_inner(false)?;
        Ok((id, rx))
    }

    /// Register a subscriber and snapshot the buffer under the same lock, so
    /// the replay and the live channel neither overlap nor leave a gap.
    pub fn subscribe_with_replay(
        &self,
    ) -> Result<(SubscriberId, Vec<StreamEvent>, mpsc::Receiver<StreamEvent>), StreamError> {
        self.subscribe_inner(true)
    }

    fn subscribe_inner(
        &self,
        replay: bool,
    ) -> Result<(SubscriberId, Vec<StreamEvent>, mpsc::Receiver<StreamEvent>), StreamError> {
        let mut inner = self.inner.lock();
        if inner.state.is_terminal() {
            return Err(StreamError::SessionClosed(self.id.clone()));
        }
        let (tx, rx) = mpsc::channel(self.subscriber_capacity);
        let id = SubscriberId::new();
        inner.subscribers.insert(id.clone(), tx);
        inner.last_activity = Instant::now();
        let snapshot = if replay {
            inner.buffer.iter().cloned().collect()
        } else {
            Vec::new()
        };
        debug!(stream_id = %self.id, subscriber_id = %id, "subscriber added");
        Ok((id, snapshot, rx))
    }

    /// Close one subscriber's channel. Other subscribers and the session
    /// state are untouched.
    pub fn remove_subscriber(&self, id: &SubscriberId) -> bool {
        let removed = self.inner.lock().subscribers.remove(id).is_some();
        if removed {
            debug!(stream_id = %self.id, subscriber_id = %id, "subscriber removed");
        }
        removed
    }

    /// Snapshot of the replay buffer, oldest first.
    pub fn buffered_events(&self) -> Vec<StreamEvent> {
        self.inner.lock().buffer.iter().cloned().collect()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }

    pub fn complete(&self) -> bool {
        self.close(SessionState::Complete, None)
    }

    pub fn cancel(&self) -> bool {
        self.close(SessionState::Cancelled, None)
    }

    pub fn set_error(&self, message: impl Into<String>) -> bool {
        self.close(SessionState::Error, Some(message.into()))
    }

    /// Transition out of `Active` and drop every sender, which ends each
    /// subscriber's stream once it has drained. No-op when already closed.
    fn close(&self, state: SessionState, error: Option<String>) -> bool {
        let mut inner = self.inner.lock();
        if inner.state.is_terminal() {
            return false;
        }
        inner.state = state;
        inner.error = error;
        inner.last_activity = Instant::now();
        let subscribers = inner.subscribers.len();
        inner.subscribers.clear();
        debug!(stream_id = %self.id, ?state, subscribers, "stream session closed");
        true
    }

    /// Older than `session_timeout`, whatever its activity.
    pub fn is_expired(&self, session_timeout: Duration) -> bool {
        self.created_at.elapsed() > session_timeout
    }

    /// Nothing emitted or subscribed within `inactivity_timeout`.
    pub fn is_inactive(&self, inactivity_timeout: Duration) -> bool {
        self.inner.lock().last_activity.elapsed() > inactivity_timeout
    }

    pub fn stats(&self) -> SessionStats {
        let inner = self.inner.lock();
        SessionStats {
            stream_id: self.id.clone(),
            request_id: self.request_id.clone(),
            tenant_id: self.tenant_id.clone(),
            state: inner.state,
            created_at: self.created_wall,
            buffered_events: inner.buffer.len(),
            subscribers: inner.subscribers.len(),
            dropped_events: inner.dropped,
            idle_secs: inner.last_activity.elapsed().as_secs(),
            error: inner.error.clone(),
        }
    }
}

impl EventSink for StreamSession {
    fn emit(&self, event: StreamEvent) {
        StreamSession::emit(self, event);
    }
}

/// Non-blocking send. `Ok(false)` means the receiver is gone.
fn offer(
    id: &SubscriberId,
    tx: &mpsc::Sender<StreamEvent>,
    event: StreamEvent,
) -> Result<bool, StreamError> {
    match tx.try_send(event) {
        Ok(()) => Ok(true),
        Err(TrySendError::Closed(_)) => Ok(false),
        Err(TrySendError::Full(_)) => Err(StreamError::SubscriberFull(id.clone())),
    }
}
