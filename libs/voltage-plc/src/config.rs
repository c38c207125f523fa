//! Configuration for the request lifecycle core
//!
//! Every field has a default, so an empty file (or no file at all) is valid.
//! Values are layered defaults → file → `VOLTAGE_PLC_*` environment variables,
//! e.g. `VOLTAGE_PLC_CACHE__MAX_LEASE_TIME_MS=10000`.

use std::path::Path;
use std::time::Duration;

use errors::{config_error, PlcResult};
use serde::{Deserialize, Serialize};

/// Environment prefix for overrides
pub const ENV_PREFIX: &str = "VOLTAGE_PLC_";

/// Root configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlcCoreConfig {
    pub transaction: TransactionConfig,
    pub cache: CacheConfig,
}

/// Transaction slot manager settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    /// Slots before the driver negotiates its own limit
    pub max_concurrent_requests: usize,
    /// Queue length beyond which submissions are rejected; unbounded if unset
    pub max_queue_depth: Option<usize>,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 1,
            max_queue_depth: None,
        }
    }
}

/// Connection cache settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Longest a single borrower may hold the connection
    pub max_lease_time_ms: u64,
    /// How long `get_connection` waits for a busy connection; fail fast if unset
    pub max_wait_time_ms: Option<u64>,
    /// Close connections unused for this long
    pub max_idle_time_ms: Option<u64>,
    /// Watchdog tick
    pub watchdog_interval_ms: u64,
    /// Bound on connecting and on every request run through a lease
    pub request_timeout_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_lease_time_ms: 5000,
            max_wait_time_ms: None,
            max_idle_time_ms: None,
            watchdog_interval_ms: 1000,
            request_timeout_ms: 5000,
        }
    }
}

impl CacheConfig {
    pub fn max_lease_time(&self) -> Duration {
        Duration::from_millis(self.max_lease_time_ms)
    }

    pub fn max_wait_time(&self) -> Option<Duration> {
        self.max_wait_time_ms.map(Duration::from_millis)
    }

    pub fn max_idle_time(&self) -> Option<Duration> {
        self.max_idle_time_ms.map(Duration::from_millis)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl PlcCoreConfig {
    /// Load from defaults, an optional file and the environment, then validate
    pub fn load(path: Option<&Path>) -> PlcResult<Self> {
        let config: Self = common::load_layered(&Self::default(), path, ENV_PREFIX)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> PlcResult<()> {
        if self.transaction.max_concurrent_requests == 0 {
            return Err(config_error!("transaction.max_concurrent_requests must be at least 1"));
        }
        if self.transaction.max_queue_depth == Some(0) {
            return Err(config_error!("transaction.max_queue_depth must be at least 1 when set"));
        }
        if self.cache.max_lease_time_ms == 0 {
            return Err(config_error!("cache.max_lease_time_ms must be greater than 0"));
        }
        if self.cache.watchdog_interval_ms == 0 {
            return Err(config_error!("cache.watchdog_interval_ms must be greater than 0"));
        }
        if self.cache.request_timeout_ms == 0 {
            return Err(config_error!("cache.request_timeout_ms must be greater than 0"));
        }
        Ok(())
    }
}
