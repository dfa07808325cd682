use conductor_core::errors::GatewayError;
use conductor_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("invalid intent pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    #[error("no results to consolidate")]
    NoResults,

    #[error("no agents available for dispatch")]
    NoAgents,

    #[error("execution aborted")]
    Aborted,

    #[error("supervisor step budget exhausted after {0} steps")]
    StepBudgetExhausted(u32),

    #[error("{0}")]
    Internal(String),
}

impl EngineError {
    /// Errors caused by the caller cancelling, as opposed to something breaking.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            EngineError::Aborted | EngineError::Gateway(GatewayError::Cancelled)
        )
    }
}
