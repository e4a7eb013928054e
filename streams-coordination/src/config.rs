use std::time::Duration;

use envconfig::Envconfig;

use crate::error::{Error, Result};

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    // ── Application ─────────────────────────────────────────────────
    /// Namespace for assignment epochs. Workers ignore assignments published
    /// for any other application.
    #[envconfig(default = "streams-app")]
    pub application_id: String,

    /// Standby replicas per stateful task. Signed so that a negative value is
    /// reported as a configuration error instead of a parse failure.
    #[envconfig(default = "0")]
    pub num_standby_replicas: i64,

    // ── Rebalancing ─────────────────────────────────────────────────
    #[envconfig(default = "30000")]
    pub apply_timeout_ms: u64,

    #[envconfig(default = "100")]
    pub rebalance_debounce_ms: u64,

    #[envconfig(default = "30")]
    pub flap_window_secs: u64,

    #[envconfig(default = "10")]
    pub flap_warn_threshold: usize,

    /// First quarantine for a worker that failed an epoch. Doubles on every
    /// further failure until a successful apply.
    #[envconfig(default = "5000")]
    pub suspect_backoff_ms: u64,

    #[envconfig(default = "300")]
    pub suspect_backoff_max_secs: u64,

    // ── Stability polling ───────────────────────────────────────────
    #[envconfig(default = "100")]
    pub stability_poll_interval_ms: u64,

    #[envconfig(default = "30")]
    pub stability_timeout_secs: u64,

    // ── Demo cluster ────────────────────────────────────────────────
    #[envconfig(default = "2")]
    pub num_workers: usize,

    #[envconfig(default = "topology.json")]
    pub topology_path: String,
}

impl Config {
    pub fn init_with_defaults() -> std::result::Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    pub fn num_standby_replicas(&self) -> Result<u32> {
        u32::try_from(self.num_standby_replicas).map_err(|_| {
            Error::configuration(format!(
                "num_standby_replicas must be between 0 and {}, got {}",
                u32::MAX,
                self.num_standby_replicas
            ))
        })
    }

    pub fn apply_timeout(&self) -> Duration {
        Duration::from_millis(self.apply_timeout_ms)
    }

    pub fn rebalance_debounce_interval(&self) -> Duration {
        Duration::from_millis(self.rebalance_debounce_ms)
    }

    pub fn flap_window(&self) -> Duration {
        Duration::from_secs(self.flap_window_secs)
    }

    pub fn suspect_backoff(&self) -> Duration {
        Duration::from_millis(self.suspect_backoff_ms)
    }

    pub fn suspect_backoff_max(&self) -> Duration {
        Duration::from_secs(self.suspect_backoff_max_secs)
    }

    pub fn stability_poll_interval(&self) -> Duration {
        Duration::from_millis(self.stability_poll_interval_ms)
    }

    pub fn stability_timeout(&self) -> Duration {
        Duration::from_secs(self.stability_timeout_secs)
    }
}
