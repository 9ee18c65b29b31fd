use serde::Deserialize;

/// Root application configuration. Loaded from environment variables
/// with the prefix `COHORT__` and TOML config files.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub schema: SchemaConfig,
    #[serde(default)]
    pub segments: SegmentConfig,
}

/// Customer-change queue tuning: backpressure and drain polling.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Ingestion blocks while the waiting-job count is at or above this.
    #[serde(default = "default_backpressure_threshold")]
    pub backpressure_threshold: usize,
    #[serde(default = "default_backpressure_poll_ms")]
    pub backpressure_poll_ms: u64,
    /// Backoff between polls while draining active jobs before a recompute.
    #[serde(default = "default_drain_backoff_ms")]
    pub drain_backoff_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchemaConfig {
    /// How many duplicate-value groups the primary-key promotion scan
    /// collects before bailing out.
    #[serde(default = "default_duplicate_scan_limit")]
    pub duplicate_scan_limit: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SegmentConfig {
    /// Membership rows inserted per batch during a full recompute.
    #[serde(default = "default_recompute_batch_size")]
    pub recompute_batch_size: usize,
}

fn default_backpressure_threshold() -> usize {
    1000
}

fn default_backpressure_poll_ms() -> u64 {
    500
}

fn default_drain_backoff_ms() -> u64 {
    200
}

fn default_duplicate_scan_limit() -> usize {
    1
}

fn default_recompute_batch_size() -> usize {
    500
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            schema: SchemaConfig::default(),
            segments: SegmentConfig::default(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backpressure_threshold: default_backpressure_threshold(),
            backpressure_poll_ms: default_backpressure_poll_ms(),
            drain_backoff_ms: default_drain_backoff_ms(),
        }
    }
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            duplicate_scan_limit: default_duplicate_scan_limit(),
        }
    }
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            recompute_batch_size: default_recompute_batch_size(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables and optional config file.
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder().add_source(
            config::Environment::with_prefix("COHORT")
                .separator("__")
                .try_parsing(true)
                .list_separator(","),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}
