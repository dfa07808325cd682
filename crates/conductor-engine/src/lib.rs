pub mod consolidate;
pub mod dispatch;
pub mod error;
pub mod execution;
pub mod extract;
pub mod memory;
pub mod routing;

pub use consolidate::{ConflictInfo, ConsolidationResult, ResultConsolidator, NO_RESULT_APOLOGY};
pub use dispatch::{DispatchConfig, DispatchInput, Dispatcher};
pub use error::EngineError;
pub use execution::{AgentResult, ExecutionResult};
pub use memory::{MemoryConfig, MemoryManager, Summarizer, SummarizerConfig, SUMMARY_PREFIX};
pub use routing::{
    AnalysisContext, AnalyzerConfig, IntentMatch, IntentRouter, IntentRule, QueryAnalysisResult,
    QueryAnalyzer, SubQuestion, WorkflowKind,
};
