//! Runtime configuration.
//!
//! Every component receives its part of [`Config`] on construction. Configuration is
//! either built in code with [`ConfigBuilder`] or loaded from a JSON file:
//!
//! ```json
//! {
//!   "max_registries_per_group": 20,
//!   "cleanup": { "max_running": 2, "enqueue_period_secs": 300 },
//!   "download_retry": { "fixed": { "number": 3, "period": { "secs": 1, "nanos": 0 } } },
//!   "feature_availability": {
//!     "virtual_registry": { "project_ttl_secs": 60, "group_ttl_secs": 300, "global_ttl_secs": 3600 }
//!   }
//! }
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use derive_builder::Builder;
use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

/// Policy of retrying failed downloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Do not retry.
    #[default]
    None,

    /// Retry `number` times waiting `period` before each attempt.
    Fixed { number: usize, period: Duration },
}

/// How long answers of the authorization collaborator are memoised, per scope kind.
///
/// `0` disables memoisation for that scope kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FeatureTtl {
    pub project_ttl_secs: u64,
    pub group_ttl_secs: u64,
    pub global_ttl_secs: u64,
}

/// Cleanup engine options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Builder)]
#[builder(setter(into))]
#[builder(default)]
#[serde(default)]
pub struct CleanupConfig {
    /// Maximum number of policies executed at the same time.
    pub max_running: usize,

    /// Number of cache entries tombstoned per query.
    pub batch_size: i64,

    /// Number of tombstoned entries physically removed per pass.
    pub destroy_batch_size: i64,

    /// Failure messages are cut to this many characters.
    pub failure_message_max_length: usize,

    /// Seconds between two checks for due policies.
    pub enqueue_period_secs: u64,

    /// Seconds after which a policy still `running` is considered abandoned and claimed again.
    pub running_timeout_secs: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            max_running: 2,
            batch_size: 100,
            destroy_batch_size: 100,
            failure_message_max_length: 255,
            enqueue_period_secs: 300,
            running_timeout_secs: 6 * 3600,
        }
    }
}

impl CleanupConfig {
    pub fn builder() -> CleanupConfigBuilder {
        CleanupConfigBuilder::default()
    }

    pub fn enqueue_period(&self) -> Duration {
        Duration::from_secs(self.enqueue_period_secs)
    }

    pub fn running_timeout(&self) -> Duration {
        Duration::from_secs(self.running_timeout_secs)
    }
}

/// Virtual registry configuration. Use [`ConfigBuilder`] to create in code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Builder)]
#[builder(setter(into))]
#[builder(default)]
#[serde(default)]
pub struct Config {
    /// Maximum number of registries of one kind per top-level group.
    pub max_registries_per_group: i64,

    /// Maximum number of upstreams in one registry chain.
    pub max_upstreams_per_registry: i64,

    pub cleanup: CleanupConfig,

    /// Retries of failed upstream downloads.
    pub download_retry: RetryPolicy,

    /// Authorization memoisation per feature name.
    pub feature_availability: HashMap<String, FeatureTtl>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_registries_per_group: 20,
            max_upstreams_per_registry: 20,
            cleanup: CleanupConfig::default(),
            download_retry: RetryPolicy::None,
            feature_availability: HashMap::new(),
        }
    }
}

impl Config {
    /// Create new builder for configuration.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Load configuration from JSON file. Missing fields take default values.
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&content)?)
    }
}
