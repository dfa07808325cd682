use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use conductor_core::events::StreamEvent;
use conductor_core::ids::{RequestId, StreamId, SubscriberId, TenantId};

use crate::error::StreamError;

use super::{SessionStats, StreamConfig, StreamSession};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ManagerStats {
    pub total: usize,
    pub active: usize,
    pub subscribers: usize,
}

#[derive(Default)]
struct Registry {
    sessions: HashMap<StreamId, Arc<StreamSession>>,
    by_request: HashMap<RequestId, StreamId>,
}

impl Registry {
    fn remove(&mut self, id: &StreamId) -> Option<Arc<StreamSession>> {
        let session = self.sessions.remove(id)?;
        if self.by_request.get(session.request_id()) == Some(id) {
            self.by_request.remove(session.request_id());
        }
        Some(session)
    }
}

struct CleanupTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Registry of live stream sessions, addressable by stream id or by the
/// request id that created them.
pub struct StreamManager {
    registry: RwLock<Registry>,
    config: StreamConfig,
    cleanup: Mutex<Option<CleanupTask>>,
}

impl StreamManager {
    pub fn new(config: StreamConfig) -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
            config,
            cleanup: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Open a session for a request. A still-registered session for the same
    /// request is cancelled and replaced.
    pub fn create_session(&self, request_id: RequestId, tenant_id: TenantId) -> Arc<StreamSession> {
        let session = Arc::new(StreamSession::new(request_id.clone(), tenant_id, &self.config));
        let replaced = {
            let mut registry = self.registry.write();
            let previous_id = registry.by_request.get(&request_id).cloned();
            let previous = previous_id.and_then(|id| registry.remove(&id));
            registry.sessions.insert(session.id().clone(), Arc::clone(&session));
            registry.by_request.insert(request_id, session.id().clone());
            previous
        };
        if let Some(old) = replaced {
            warn!(request_id = %old.request_id(), stream_id = %old.id(), "replacing stream session for request");
            old.cancel();
        }
        debug!(stream_id = %session.id(), request_id = %session.request_id(), "stream session created");
        session
    }

    pub fn get_session(&self, id: &StreamId) -> Option<Arc<StreamSession>> {
        self.registry.read().sessions.get(id).cloned()
    }

    pub fn get_session_by_request(&self, request_id: &RequestId) -> Option<Arc<StreamSession>> {
        let registry = self.registry.read();
        registry
            .by_request
            .get(request_id)
            .and_then(|id| registry.sessions.get(id))
            .cloned()
    }

    /// Unregister and cancel a session.
    pub fn delete_session(&self, id: &StreamId) -> bool {
        let removed = self.registry.write().remove(id);
        match removed {
            Some(session) => {
                session.cancel();
                true
            }
            None => false,
        }
    }

    pub fn list_sessions(&self) -> Vec<SessionStats> {
        self.snapshot().iter().map(|s| s.stats()).collect()
    }

    pub fn session_count(&self) -> usize {
        self.registry.read().sessions.len()
    }

    pub fn stats(&self) -> ManagerStats {
        self.snapshot()
            .iter()
            .fold(ManagerStats::default(), |mut acc, session| {
                acc.total += 1;
                if session.is_active() {
                    acc.active += 1;
                }
                acc.subscribers += session.subscriber_count();
                acc
            })
    }

    /// False when the session is missing or no longer active.
    pub fn emit_to_session(&self, id: &StreamId, event: StreamEvent) -> bool {
        self.get_session(id).is_some_and(|session| session.emit(event))
    }

    pub fn subscribe(
        &self,
        id: &StreamId,
    ) -> Result<(mpsc::Receiver<StreamEvent>, SubscriberId), StreamError> {
        let session = self
            .get_session(id)
            .ok_or_else(|| StreamError::SessionNotFound(id.to_string()))?;
        let (subscriber_id, rx) = session.add_subscriber()?;
        Ok((rx, subscriber_id))
    }

    pub fn unsubscribe(&self, id: &StreamId, subscriber_id: &SubscriberId) -> bool {
        self.get_session(id)
            .is_some_and(|session| session.remove_subscriber(subscriber_id))
    }

    /// Spawn the periodic cleanup task. Calling it twice is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut slot = self.cleanup.lock();
        if slot.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        let handle = spawn_cleanup(Arc::downgrade(self), self.config.cleanup_interval, cancel.clone());
        *slot = Some(CleanupTask { cancel, handle });
        info!(interval_secs = self.config.cleanup_interval.as_secs(), "stream cleanup started");
    }

    /// Stop the cleanup task, wait for it, then cancel and drop every session.
    pub async fn stop(&self) {
        let task = self.cleanup.lock().take();
        if let Some(task) = task {
            task.cancel.cancel();
            if let Err(e) = task.handle.await {
                warn!(error = %e, "stream cleanup task ended abnormally");
            }
        }
        let sessions: Vec<_> = {
            let mut registry = self.registry.write();
            registry.by_request.clear();
            registry.sessions.drain().map(|(_, s)| s).collect()
        };
        for session in &sessions {
            session.cancel();
        }
        info!(sessions = sessions.len(), "stream manager stopped");
    }

    /// Run one cleanup pass now. Returns how many sessions were removed.
    pub fn cleanup_now(&self) -> usize {
        let doomed: Vec<StreamId> = self
            .snapshot()
            .iter()
            .filter(|s| self.should_remove(s))
            .map(|s| s.id().clone())
            .collect();
        if doomed.is_empty() {
            return 0;
        }

        let removed: Vec<_> = {
            let mut registry = self.registry.write();
            doomed.iter().filter_map(|id| registry.remove(id)).collect()
        };
        for session in &removed {
            session.cancel();
        }
        info!(removed = removed.len(), remaining = self.session_count(), "stream sessions cleaned up");
        removed.len()
    }

    fn should_remove(&self, session: &StreamSession) -> bool {
        if session.is_expired(self.config.session_timeout) {
            return true;
        }
        session.is_inactive(self.config.inactivity_timeout)
            && (!session.is_active() || session.subscriber_count() == 0)
    }

    fn snapshot(&self) -> Vec<Arc<StreamSession>> {
        self.registry.read().sessions.values().cloned().collect()
    }
}

fn spawn_cleanup(
    manager: Weak<StreamManager>,
    interval: std::time::Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + interval;
        let mut ticker = tokio::time::interval_at(start, interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(manager) = manager.upgrade() else { break };
                    manager.cleanup_now();
                }
            }
        }
        debug!("stream cleanup loop exited");
    })
}
