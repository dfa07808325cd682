mod manager;
mod summarizer;

pub use manager::{MemoryConfig, MemoryManager};
pub use summarizer::{Summarizer, SummarizerConfig, SUMMARY_PREFIX};
