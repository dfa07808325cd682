use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use rand::Rng;
use tracing::{info, warn};

use conductor_core::chat::{ChatModel, ChatOptions};
use conductor_core::errors::GatewayError;
use conductor_core::turns::ConversationTurn;

/// Retry and circuit breaker settings for [`ReliableChatModel`].
#[derive(Clone, Debug)]
pub struct ReliableConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_factor: f64,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_cooldown: Duration,
}

impl Default for ReliableConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            jitter_factor: 0.2,
            circuit_breaker_threshold: 5,
            circuit_breaker_cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum CircuitState {
    Closed,
    Open { since: Instant },
    HalfOpen,
}

/// Wraps a chat model with retry and a circuit breaker.
///
/// - retryable errors back off exponentially with jitter, honoring `retry_after`
/// - fatal and operational errors (timeouts, cancellation) return immediately
/// - N consecutive failures open the circuit; after the cooldown one trial call is let through
pub struct ReliableChatModel<M: ChatModel> {
    inner: M,
    config: ReliableConfig,
    circuit_state: RwLock<CircuitState>,
    consecutive_failures: AtomicU32,
    total_retries: AtomicU64,
}

impl<M: ChatModel> ReliableChatModel<M> {
    pub fn new(inner: M, config: ReliableConfig) -> Self {
        Self {
            inner,
            config,
            circuit_state: RwLock::new(CircuitState::Closed),
            consecutive_failures: AtomicU32::new(0),
            total_retries: AtomicU64::new(0),
        }
    }

    pub fn with_defaults(inner: M) -> Self {
        Self::new(inner, ReliableConfig::default())
    }

    fn check_circuit(&self) -> Result<(), GatewayError> {
        let state = self.circuit_state.read();
        match &*state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open { since } => {
                if since.elapsed() >= self.config.circuit_breaker_cooldown {
                    drop(state);
                    *self.circuit_state.write() = CircuitState::HalfOpen;
                    Ok(())
                } else {
                    Err(GatewayError::ProviderOverloaded)
                }
            }
        }
    }

    fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        let mut state = self.circuit_state.write();
        if *state != CircuitState::Closed {
            info!(model = self.inner.name(), "circuit breaker closed");
            *state = CircuitState::Closed;
        }
    }

    fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= self.config.circuit_breaker_threshold {
            let mut state = self.circuit_state.write();
            if !matches!(*state, CircuitState::Open { .. }) {
                warn!(
                    model = self.inner.name(),
                    failures,
                    cooldown_secs = self.config.circuit_breaker_cooldown.as_secs(),
                    "circuit breaker opened"
                );
                *state = CircuitState::Open {
                    since: Instant::now(),
                };
            }
        }
    }

    fn retry_delay(&self, attempt: u32, suggested: Option<Duration>) -> Duration {
        if let Some(delay) = suggested {
            return delay;
        }

        let exp_delay = self.config.base_delay.as_millis() as f64 * 2.0_f64.powi(attempt as i32);
        let capped = exp_delay.min(self.config.max_delay.as_millis() as f64);

        let jitter_range = capped * self.config.jitter_factor;
        let jitter = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };
        Duration::from_millis((capped + jitter).max(1.0) as u64)
    }

    pub fn total_retries(&self) -> u64 {
        self.total_retries.load(Ordering::Relaxed)
    }

    pub fn circuit_state_name(&self) -> &'static str {
        match &*self.circuit_state.read() {
            CircuitState::Closed => "closed",
            CircuitState::Open { .. } => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[async_trait]
impl<M: ChatModel> ChatModel for ReliableChatModel<M> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn complete(
        &self,
        messages: &[ConversationTurn],
        options: &ChatOptions,
    ) -> Result<String, GatewayError> {
        self.check_circuit()?;

        let mut attempt = 0;
        loop {
            match self.inner.complete(messages, options).await {
                Ok(text) => {
                    self.record_success();
                    return Ok(text);
                }
                Err(e) if !e.is_retryable() || attempt >= self.config.max_retries => {
                    if !matches!(e, GatewayError::Cancelled) {
                        self.record_failure();
                    }
                    return Err(e);
                }
                Err(e) => {
                    let delay = self.retry_delay(attempt, e.suggested_delay());
                    self.total_retries.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        attempt = attempt + 1,
                        max_retries = self.config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying chat completion"
                    );
                    tokio::time::sleep(delay).await;
                    self.check_circuit()?;
                    attempt += 1;
                }
            }
        }
    }
}
