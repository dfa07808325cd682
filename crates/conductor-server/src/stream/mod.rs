mod manager;
mod session;

use std::time::Duration;

pub use manager::{ManagerStats, StreamManager};
pub use session::{SessionState, SessionStats, StreamSession};

#[derive(Clone, Debug)]
pub struct StreamConfig {
    /// Maximum lifetime of a session regardless of activity.
    pub session_timeout: Duration,
    pub inactivity_timeout: Duration,
    pub cleanup_interval: Duration,
    /// Replay buffer size per session.
    pub buffer_capacity: usize,
    /// Channel size per subscriber.
    pub subscriber_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            session_timeout: Duration::from_secs(60 * 60),
            inactivity_timeout: Duration::from_secs(10 * 60),
            cleanup_interval: Duration::from_secs(5 * 60),
            buffer_capacity: 100,
            subscriber_capacity: 50,
        }
    }
}
