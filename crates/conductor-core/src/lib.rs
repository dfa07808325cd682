pub mod agent;
pub mod chat;
pub mod errors;
pub mod events;
pub mod ids;
pub mod turns;

pub use errors::GatewayError;
pub use events::{EventType, StreamEvent};
pub use turns::{ConversationTurn, Role, SessionKey, ToolCallMeta};
