use std::str::FromStr;

use serde::Deserialize;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    #[serde(with = "level_serde")]
    pub log_level: Level,
    /// Per-module level overrides (e.g. "conductor_store" => DEBUG).
    #[serde(skip)]
    pub module_levels: Vec<(String, Level)>,
    /// Emit one JSON object per line instead of human-readable output.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: true,
        }
    }
}

impl TelemetryConfig {
    /// Directive string handed to `EnvFilter` when RUST_LOG is unset.
    pub fn filter_directives(&self) -> String {
        let mut filter = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            filter.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        filter
    }
}

/// Returned by [`init_telemetry`]; records what was installed.
#[derive(Debug)]
pub struct TelemetryGuard {
    installed: bool,
    directives: String,
}

impl TelemetryGuard {
    /// False when another subscriber was already set (e.g. in tests).
    pub fn installed(&self) -> bool {
        self.installed
    }

    pub fn directives(&self) -> &str {
        &self.directives
    }
}

/// Initialize structured logging. Call once at startup.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let directives = config.filter_directives();
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&directives));

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(true).boxed()
    };

    let installed = tracing_subscriber::registry()
        .with(fmt_layer.with_filter(env_filter))
        .try_init()
        .is_ok();

    TelemetryGuard {
        installed,
        directives,
    }
}

mod level_serde {
    use super::*;
    use serde::Deserializer;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Level, D::Error> {
        let raw = String::deserialize(d)?;
        Level::from_str(&raw).map_err(serde::de::Error::custom)
    }
}
