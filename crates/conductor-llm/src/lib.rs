pub mod agent;
pub mod mock;
pub mod openai;
pub mod reliable;

pub use agent::ChatAgent;
pub use openai::{OpenAiCompatConfig, OpenAiCompatModel};
pub use reliable::{ReliableChatModel, ReliableConfig};
