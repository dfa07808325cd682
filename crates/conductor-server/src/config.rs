use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;

use conductor_engine::{AnalyzerConfig, DispatchConfig, MemoryConfig, SummarizerConfig};
use conductor_llm::{OpenAiCompatConfig, ReliableConfig};
use conductor_store::CacheConfig;
use conductor_telemetry::TelemetryConfig;

use crate::server::ServerConfig;
use crate::stream::StreamConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read config {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("parse config {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Whole-process settings. Every section falls back to its defaults, so a
/// partial file only overrides what it names. Durations are in seconds.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub telemetry: TelemetryConfig,
    pub llm: LlmSection,
    pub reliability: ReliabilitySection,
    pub database: DatabaseSection,
    pub memory: MemorySection,
    pub stream: StreamSection,
    pub dispatch: DispatchSection,
    pub analyzer: AnalyzerSection,
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        Self::from_json(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn llm_config(&self) -> OpenAiCompatConfig {
        OpenAiCompatConfig {
            base_url: self.llm.base_url.clone(),
            model: self.llm.model.clone(),
            api_key: self.llm.api_key.clone(),
            request_timeout: Duration::from_secs(self.llm.request_timeout_secs),
        }
    }

    pub fn reliable_config(&self) -> ReliableConfig {
        let r = &self.reliability;
        ReliableConfig {
            max_retries: r.max_retries,
            base_delay: Duration::from_millis(r.base_delay_ms),
            max_delay: Duration::from_secs(r.max_delay_secs),
            circuit_breaker_threshold: r.circuit_breaker_threshold,
            circuit_breaker_cooldown: Duration::from_secs(r.circuit_breaker_cooldown_secs),
            ..ReliableConfig::default()
        }
    }

    pub fn memory_config(&self) -> MemoryConfig {
        MemoryConfig {
            window_size: self.memory.window_size,
        }
    }

    /// None when summarization is switched off.
    pub fn summarizer_config(&self) -> Option<SummarizerConfig> {
        self.memory.summarize.then(|| SummarizerConfig {
            max_turns_before_summary: self.memory.max_turns_before_summary,
            recent_turns: self.memory.recent_turns,
            ..SummarizerConfig::default()
        })
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            ttl: Duration::from_secs(self.memory.cache_ttl_secs),
        }
    }

    pub fn stream_config(&self) -> StreamConfig {
        let s = &self.stream;
        StreamConfig {
            session_timeout: Duration::from_secs(s.session_timeout_secs),
            inactivity_timeout: Duration::from_secs(s.inactivity_timeout_secs),
            cleanup_interval: Duration::from_secs(s.cleanup_interval_secs),
            buffer_capacity: s.buffer_capacity,
            subscriber_capacity: s.subscriber_capacity,
        }
    }

    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            agent_timeout: Duration::from_secs(self.dispatch.agent_timeout_secs),
            max_steps: self.dispatch.max_steps,
            ..DispatchConfig::default()
        }
    }

    pub fn analyzer_config(&self) -> AnalyzerConfig {
        AnalyzerConfig {
            quick_confidence: self.analyzer.quick_confidence,
            fallback_confidence: self.analyzer.fallback_confidence,
            ..AnalyzerConfig::default()
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<SecretString>,
    pub request_timeout_secs: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        let d = OpenAiCompatConfig::default();
        Self {
            base_url: d.base_url,
            model: d.model,
            api_key: None,
            request_timeout_secs: d.request_timeout.as_secs(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ReliabilitySection {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_secs: u64,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_cooldown_secs: u64,
}

impl Default for ReliabilitySection {
    fn default() -> Self {
        let d = ReliableConfig::default();
        Self {
            max_retries: d.max_retries,
            base_delay_ms: d.base_delay.as_millis() as u64,
            max_delay_secs: d.max_delay.as_secs(),
            circuit_breaker_threshold: d.circuit_breaker_threshold,
            circuit_breaker_cooldown_secs: d.circuit_breaker_cooldown.as_secs(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct DatabaseSection {
    /// SQLite file. The binary picks a location under the home directory when unset.
    pub path: Option<PathBuf>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct MemorySection {
    pub window_size: usize,
    pub cache_ttl_secs: u64,
    pub cache_max_entries: Option<usize>,
    pub summarize: bool,
    pub max_turns_before_summary: usize,
    pub recent_turns: usize,
}

impl Default for MemorySection {
    fn default() -> Self {
        let summarizer = SummarizerConfig::default();
        Self {
            window_size: MemoryConfig::default().window_size,
            cache_ttl_secs: CacheConfig::default().ttl.as_secs(),
            cache_max_entries: None,
            summarize: true,
            max_turns_before_summary: summarizer.max_turns_before_summary,
            recent_turns: summarizer.recent_turns,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct StreamSection {
    pub session_timeout_secs: u64,
    pub inactivity_timeout_secs: u64,
    pub cleanup_interval_secs: u64,
    pub buffer_capacity: usize,
    pub subscriber_capacity: usize,
}

impl Default for StreamSection {
    fn default() -> Self {
        let d = StreamConfig::default();
        Self {
            session_timeout_secs: d.session_timeout.as_secs(),
            inactivity_timeout_secs: d.inactivity_timeout.as_secs(),
            cleanup_interval_secs: d.cleanup_interval.as_secs(),
            buffer_capacity: d.buffer_capacity,
            subscriber_capacity: d.subscriber_capacity,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DispatchSection {
    pub agent_timeout_secs: u64,
    pub max_steps: u32,
}

impl Default for DispatchSection {
    fn default() -> Self {
        let d = DispatchConfig::default();
        Self {
            agent_timeout_secs: d.agent_timeout.as_secs(),
            max_steps: d.max_steps,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct AnalyzerSection {
    pub quick_confidence: f64,
    pub fallback_confidence: f64,
}

impl Default for AnalyzerSection {
    fn default() -> Self {
        let d = AnalyzerConfig::default();
        Self {
            quick_confidence: d.quick_confidence,
            fallback_confidence: d.fallback_confidence,
        }
    }
}
