use std::{env, fs, path::Path, time::Duration};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::{
    reconciler::DriftCorrection,
    session::SessionOptions,
    signals::SignalDeduplicator,
    trading_client::{EndpointSet, RestClient, RetryPolicy, TradingVariant},
    ws_client::{ExponentialBackoff, WsConfig},
};

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Socket host; defaults to `base_url` with its scheme swapped.
    #[serde(default)]
    pub ws_url: Option<String>,
    #[serde(default)]
    pub variant: TradingVariant,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_pong_timeout_ms")]
    pub pong_timeout_ms: u64,
    #[serde(default = "default_latency_warn_ms")]
    pub latency_warn_ms: u64,
    #[serde(default = "default_latency_error_ms")]
    pub latency_error_ms: u64,
    #[serde(default = "default_latency_samples")]
    pub latency_samples: usize,
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// Falls back to the variant default when absent.
    #[serde(default)]
    pub drift: Option<DriftCorrection>,
    #[serde(default = "default_signal_window_secs")]
    pub signal_window_secs: u64,
    #[serde(default = "default_signal_cap")]
    pub signal_cap: usize,
    /// Zero disables status polling.
    #[serde(default = "default_status_poll_secs")]
    pub status_poll_secs: u64,
}

fn default_base_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_pong_timeout_ms() -> u64 {
    10_000
}

fn default_latency_warn_ms() -> u64 {
    1_000
}

fn default_latency_error_ms() -> u64 {
    3_000
}

fn default_latency_samples() -> usize {
    8
}

fn default_reconnect_base_ms() -> u64 {
    5_000
}

fn default_reconnect_max_ms() -> u64 {
    30_000
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    1_000
}

fn default_signal_window_secs() -> u64 {
    30 * 60
}

fn default_signal_cap() -> usize {
    8
}

fn default_status_poll_secs() -> u64 {
    30
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            ws_url: None,
            variant: TradingVariant::default(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            pong_timeout_ms: default_pong_timeout_ms(),
            latency_warn_ms: default_latency_warn_ms(),
            latency_error_ms: default_latency_error_ms(),
            latency_samples: default_latency_samples(),
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            retry_attempts: default_retry_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            drift: None,
            signal_window_secs: default_signal_window_secs(),
            signal_cap: default_signal_cap(),
            status_poll_secs: default_status_poll_secs(),
        }
    }
}

impl SyncConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read {}", path.as_ref().display()))?;
        Self::from_toml_str(&data)
    }

    /// Parses TOML with either a nested `[sync]` table or top-level entries,
    /// then applies `TRADE_SYNC_*` overrides and validates.
    pub fn from_toml_str(data: &str) -> Result<Self> {
        let mut cfg = Self::parse(data)?;
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Defaults plus environment overrides, for running without a file.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    fn parse(data: &str) -> Result<Self> {
        let raw: toml::Value = toml::from_str(data).context("Failed to parse TOML config")?;
        let table = match raw {
            toml::Value::Table(mut root) => match root.remove("sync") {
                Some(nested @ toml::Value::Table(_)) => nested,
                _ => toml::Value::Table(root),
            },
            other => other,
        };
        table
            .try_into()
            .map_err(|err| anyhow::anyhow!("Invalid sync config structure: {err}"))
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let lookup = &lookup;
        override_string(lookup, "TRADE_SYNC_BASE_URL", &mut self.base_url);
        if let Some(value) = lookup("TRADE_SYNC_WS_URL") {
            self.ws_url = Some(value);
        }
        if let Some(value) = lookup("TRADE_SYNC_VARIANT") {
            match value.to_ascii_lowercase().as_str() {
                "paper" => self.variant = TradingVariant::Paper,
                "live" | "real" => self.variant = TradingVariant::Live,
                other => tracing::warn!(variant = other, "unknown TRADE_SYNC_VARIANT ignored"),
            }
        }
        override_parsed(lookup, "TRADE_SYNC_HEARTBEAT_INTERVAL_MS", &mut self.heartbeat_interval_ms);
        override_parsed(lookup, "TRADE_SYNC_PONG_TIMEOUT_MS", &mut self.pong_timeout_ms);
        override_parsed(lookup, "TRADE_SYNC_LATENCY_WARN_MS", &mut self.latency_warn_ms);
        override_parsed(lookup, "TRADE_SYNC_LATENCY_ERROR_MS", &mut self.latency_error_ms);
        override_parsed(lookup, "TRADE_SYNC_LATENCY_SAMPLES", &mut self.latency_samples);
        override_parsed(lookup, "TRADE_SYNC_RECONNECT_BASE_MS", &mut self.reconnect_base_ms);
        override_parsed(lookup, "TRADE_SYNC_RECONNECT_MAX_MS", &mut self.reconnect_max_ms);
        override_parsed(
            lookup,
            "TRADE_SYNC_MAX_RECONNECT_ATTEMPTS",
            &mut self.max_reconnect_attempts,
        );
        override_parsed(lookup, "TRADE_SYNC_RETRY_ATTEMPTS", &mut self.retry_attempts);
        override_parsed(lookup, "TRADE_SYNC_RETRY_BASE_DELAY_MS", &mut self.retry_base_delay_ms);
        override_parsed(lookup, "TRADE_SYNC_SIGNAL_WINDOW_SECS", &mut self.signal_window_secs);
        override_parsed(lookup, "TRADE_SYNC_SIGNAL_CAP", &mut self.signal_cap);
        override_parsed(lookup, "TRADE_SYNC_STATUS_POLL_SECS", &mut self.status_poll_secs);

        if let Some(mode) = lookup("TRADE_SYNC_DRIFT_MODE") {
            let current = self.drift_correction();
            let drift = match mode.to_ascii_lowercase().as_str() {
                "probabilistic" => {
                    let mut probability = match current {
                        DriftCorrection::Probabilistic { probability } => probability,
                        DriftCorrection::EveryNTicks { .. } => 0.05,
                    };
                    override_parsed(lookup, "TRADE_SYNC_DRIFT_PROBABILITY", &mut probability);
                    Some(DriftCorrection::Probabilistic { probability })
                }
                "every_n_ticks" | "ticks" => {
                    let mut ticks = match current {
                        DriftCorrection::EveryNTicks { ticks } => ticks,
                        DriftCorrection::Probabilistic { .. } => 20,
                    };
                    override_parsed(lookup, "TRADE_SYNC_DRIFT_TICKS", &mut ticks);
                    Some(DriftCorrection::EveryNTicks { ticks })
                }
                other => {
                    tracing::warn!(mode = other, "unknown TRADE_SYNC_DRIFT_MODE ignored");
                    None
                }
            };
            if drift.is_some() {
                self.drift = drift;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.base_url.starts_with("http://") || self.base_url.starts_with("https://"),
            "base_url must start with http:// or https://"
        );
        anyhow::ensure!(
            self.heartbeat_interval_ms > 0,
            "heartbeat_interval_ms must be greater than zero"
        );
        anyhow::ensure!(
            self.pong_timeout_ms > 0 && self.pong_timeout_ms < self.heartbeat_interval_ms,
            "pong_timeout_ms must be positive and shorter than heartbeat_interval_ms"
        );
        anyhow::ensure!(
            self.latency_warn_ms < self.latency_error_ms,
            "latency_warn_ms must be below latency_error_ms"
        );
        anyhow::ensure!(
            (1..=256).contains(&self.latency_samples),
            "latency_samples must be between 1 and 256"
        );
        anyhow::ensure!(
            self.reconnect_base_ms > 0 && self.reconnect_max_ms >= self.reconnect_base_ms,
            "reconnect_max_ms must be >= reconnect_base_ms > 0"
        );
        anyhow::ensure!(
            (1..=10).contains(&self.retry_attempts),
            "retry_attempts must be between 1 and 10"
        );
        anyhow::ensure!(self.signal_cap > 0, "signal_cap must be greater than zero");
        anyhow::ensure!(
            self.signal_window_secs > 0,
            "signal_window_secs must be greater than zero"
        );
        match self.drift_correction() {
            DriftCorrection::Probabilistic { probability } => anyhow::ensure!(
                (0.0..=1.0).contains(&probability),
                "drift probability must be within [0, 1]"
            ),
            DriftCorrection::EveryNTicks { ticks } => {
                anyhow::ensure!(ticks > 0, "drift ticks must be greater than zero")
            }
        }
        Ok(())
    }

    pub fn endpoints(&self) -> EndpointSet {
        EndpointSet::for_variant(self.variant)
    }

    /// Live trading gets a deterministic staleness bound by default.
    pub fn drift_correction(&self) -> DriftCorrection {
        self.drift.unwrap_or(match self.variant {
            TradingVariant::Paper => DriftCorrection::default(),
            TradingVariant::Live => DriftCorrection::EveryNTicks { ticks: 20 },
        })
    }

    pub fn ws_config(&self) -> WsConfig {
        WsConfig {
            host: self.ws_url.clone().unwrap_or_else(|| self.base_url.clone()),
            path: self.endpoints().ws_path,
            backoff: ExponentialBackoff {
                initial: Duration::from_millis(self.reconnect_base_ms),
                max: Duration::from_millis(self.reconnect_max_ms),
                multiplier: 2.0,
                max_attempts: self.max_reconnect_attempts,
            },
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            pong_timeout: Duration::from_millis(self.pong_timeout_ms),
            latency_warn: Duration::from_millis(self.latency_warn_ms),
            latency_error: Duration::from_millis(self.latency_error_ms),
            latency_samples: self.latency_samples,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_attempts,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
        }
    }

    pub fn signal_deduplicator(&self) -> SignalDeduplicator {
        SignalDeduplicator::new(Duration::from_secs(self.signal_window_secs), self.signal_cap)
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            ws: self.ws_config(),
            retry: self.retry_policy(),
            drift: self.drift_correction(),
            signals: self.signal_deduplicator(),
            status_poll_interval: (self.status_poll_secs > 0)
                .then(|| Duration::from_secs(self.status_poll_secs)),
        }
    }

    pub fn rest_client(&self) -> crate::trading_client::Result<RestClient> {
        RestClient::new(self.base_url.clone(), self.endpoints())
    }
}

fn override_string(lookup: &impl Fn(&str) -> Option<String>, key: &str, field: &mut String) {
    if let Some(value) = lookup(key) {
        *field = value;
    }
}

fn override_parsed<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    field: &mut T,
) {
    if let Some(value) = lookup(key) {
        match value.parse::<T>() {
            Ok(parsed) => *field = parsed,
            Err(_) => tracing::warn!(key, value = %value, "unparseable override ignored"),
        }
    }
}
