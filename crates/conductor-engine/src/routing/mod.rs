mod analyzer;
mod intent;
pub mod prompts;
mod types;

pub use analyzer::{AnalyzerConfig, QueryAnalyzer};
pub use intent::{
    IntentMatch, IntentRouter, IntentRule, INTENT_ESCALATE, INTENT_GREETING, INTENT_ORDER,
    INTENT_UNKNOWN,
};
pub use types::{AnalysisContext, QueryAnalysisResult, SubQuestion, WorkflowKind};
