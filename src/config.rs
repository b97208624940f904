use std::path::PathBuf;
use std::time::Duration;

use crate::model::Ms;

/// Runtime settings, read from `COURTSIDE_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    /// How long a slot stays held waiting for payment.
    pub hold_ttl_ms: Ms,
    pub sweep_interval: Duration,
    /// WAL appends between compactions.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    /// ISO currency code passed to the payment gateway.
    pub currency: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            hold_ttl_ms: 15 * 60 * 1000,
            sweep_interval: Duration::from_secs(5),
            compact_threshold: 1000,
            metrics_port: None,
            currency: "usd".into(),
        }
    }
}

fn parsed<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|s| s.parse().ok())
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unparsable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            data_dir: lookup("COURTSIDE_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            hold_ttl_ms: parsed::<u64>(&lookup, "COURTSIDE_HOLD_TTL_SECS")
                .filter(|secs| *secs > 0)
                .map(|secs| secs as Ms * 1000)
                .unwrap_or(defaults.hold_ttl_ms),
            sweep_interval: parsed::<u64>(&lookup, "COURTSIDE_SWEEP_INTERVAL_SECS")
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.sweep_interval),
            compact_threshold: parsed(&lookup, "COURTSIDE_COMPACT_THRESHOLD")
                .unwrap_or(defaults.compact_threshold),
            metrics_port: parsed(&lookup, "COURTSIDE_METRICS_PORT"),
            currency: lookup("COURTSIDE_CURRENCY")
                .filter(|c| !c.is_empty())
                .unwrap_or(defaults.currency),
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("courtside.wal")
    }
}
