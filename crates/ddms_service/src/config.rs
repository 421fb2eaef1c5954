//! Daemon configuration.
//!
//! The configuration file is JSON. Every section and field is optional;
//! missing values take the defaults of the component they configure.
//! Durations are given in milliseconds.
//!
//! ```json
//! {
//!   "dataDir": "/var/lib/ddms",
//!   "users": [100],
//!   "executor": { "minThreads": 2, "maxThreads": 8 },
//!   "retry": { "maxTimes": 6, "retryIntervalMs": 10000 }
//! }
//! ```

use crate::error::ServiceResult;
use ddms_cloud::RetryPolicy;
use ddms_core::{CacheConfig, ExecutorConfig, MetaConfig};
use ddms_device::RegistryConfig;
use ddms_share::SchedulerConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Worker pool settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutorSettings {
    /// Threads driving timers.
    pub min_threads: usize,
    /// Upper bound on threads running task bodies.
    pub max_threads: usize,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        let defaults = ExecutorConfig::default();
        Self {
            min_threads: defaults.min_threads,
            max_threads: defaults.max_threads,
        }
    }
}

/// Metadata store settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MetaSettings {
    /// Attempts to open a journal before giving up.
    pub max_retry_times: u32,
    /// Pause between attempts.
    pub retry_interval_ms: u64,
}

impl Default for MetaSettings {
    fn default() -> Self {
        let defaults = MetaConfig::default();
        Self {
            max_retry_times: defaults.max_retry_times,
            retry_interval_ms: millis(defaults.retry_interval),
        }
    }
}

/// Device registry settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegistrySettings {
    /// Delay between device manager registration attempts.
    pub init_retry_interval_ms: u64,
    /// How long an online device may stay pending before READY is forced.
    pub sync_timeout_ms: u64,
    /// How long a negative network answer is trusted.
    pub net_effective_duration_ms: u64,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        let defaults = RegistryConfig::default();
        Self {
            init_retry_interval_ms: millis(defaults.init_retry_interval),
            sync_timeout_ms: millis(defaults.sync_timeout),
            net_effective_duration_ms: millis(defaults.net_effective_duration),
        }
    }
}

/// Store cache settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheSettings {
    /// Stores unused for longer are closed.
    pub idle_timeout_ms: u64,
    /// Period of the idle store collector.
    pub gc_interval_ms: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        let defaults = CacheConfig::default();
        Self {
            idle_timeout_ms: millis(defaults.idle_timeout),
            gc_interval_ms: millis(defaults.gc_interval),
        }
    }
}

/// Cloud sync retry settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetrySettings {
    /// Attempts a sync request may use in total.
    pub max_times: u32,
    /// Attempts a client triggered change may use.
    pub client_max_times: u32,
    /// Base delay after an ordinary transient failure.
    pub retry_interval_ms: u64,
    /// Base delay while another process holds the cloud lock.
    pub locked_interval_ms: u64,
    /// Base delay after local contention.
    pub busy_interval_ms: u64,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Upper bound of any computed delay.
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let defaults = RetryPolicy::default();
        Self {
            max_times: defaults.max_times,
            client_max_times: defaults.client_max_times,
            retry_interval_ms: millis(defaults.retry_interval),
            locked_interval_ms: millis(defaults.locked_interval),
            busy_interval_ms: millis(defaults.busy_interval),
            backoff_multiplier: defaults.backoff_multiplier,
            max_delay_ms: millis(defaults.max_delay),
        }
    }
}

/// Template scheduler settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SchedulerSettings {
    /// Shortest delay before a template timer fires.
    pub min_interval_ms: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            min_interval_ms: millis(SchedulerConfig::default().min_interval),
        }
    }
}

/// Configuration of every service the daemon runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceConfig {
    /// Directory of the metadata journals; metadata is kept in memory if unset.
    pub data_dir: Option<PathBuf>,
    /// Uuid of the local device when no platform transport is attached.
    pub local_uuid: Option<String>,
    /// Foreground users.
    pub users: Vec<i32>,
    /// Account id of the foreground users.
    pub account_id: String,
    /// Worker pool.
    pub executor: ExecutorSettings,
    /// Metadata store.
    pub meta: MetaSettings,
    /// Device registry.
    pub registry: RegistrySettings,
    /// Store cache.
    pub cache: CacheSettings,
    /// Cloud sync retries.
    pub retry: RetrySettings,
    /// Template scheduler.
    pub scheduler: SchedulerSettings,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            local_uuid: None,
            users: vec![100],
            account_id: ddms_core::metadata::DEFAULT_ACCOUNT.to_string(),
            executor: ExecutorSettings::default(),
            meta: MetaSettings::default(),
            registry: RegistrySettings::default(),
            cache: CacheSettings::default(),
            retry: RetrySettings::default(),
            scheduler: SchedulerSettings::default(),
        }
    }
}

impl ServiceConfig {
    /// Reads a configuration file.
    pub fn load(path: &Path) -> ServiceResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Sets the metadata directory.
    #[must_use]
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    /// Sets the foreground users.
    #[must_use]
    pub fn with_users(mut self, users: Vec<i32>) -> Self {
        self.users = users;
        self
    }

    /// Worker pool configuration.
    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig::new(self.executor.min_threads, self.executor.max_threads)
            .with_thread_name("ddms-worker")
    }

    /// Metadata store configuration.
    pub fn meta_config(&self) -> MetaConfig {
        MetaConfig::new()
            .with_max_retry_times(self.meta.max_retry_times)
            .with_retry_interval(Duration::from_millis(self.meta.retry_interval_ms))
    }

    /// Device registry configuration.
    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig::default()
            .with_init_retry_interval(Duration::from_millis(self.registry.init_retry_interval_ms))
            .with_sync_timeout(Duration::from_millis(self.registry.sync_timeout_ms))
            .with_net_effective_duration(Duration::from_millis(
                self.registry.net_effective_duration_ms,
            ))
    }

    /// Store cache configuration.
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig::default()
            .with_idle_timeout(Duration::from_millis(self.cache.idle_timeout_ms))
            .with_gc_interval(Duration::from_millis(self.cache.gc_interval_ms))
    }

    /// Cloud sync retry policy.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_times: self.retry.max_times,
            client_max_times: self.retry.client_max_times,
            retry_interval: Duration::from_millis(self.retry.retry_interval_ms),
            locked_interval: Duration::from_millis(self.retry.locked_interval_ms),
            busy_interval: Duration::from_millis(self.retry.busy_interval_ms),
            backoff_multiplier: self.retry.backoff_multiplier,
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
        }
    }

    /// Template scheduler configuration.
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig::default()
            .with_min_interval(Duration::from_millis(self.scheduler.min_interval_ms))
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
