pub mod bridge;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod server;
pub mod stream;

pub use config::AppConfig;
pub use error::StreamError;
pub use orchestrator::{Orchestrator, RunOutcome, RunRequest, RunStatus};
pub use server::{build_router, start, AppState, ServerConfig, ServerHandle};
pub use stream::{ManagerStats, SessionState, SessionStats, StreamConfig, StreamManager, StreamSession};
