use serde::Deserialize;

/// Root application configuration. Loaded from environment variables
/// with the prefix `ADWEAVE__`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub nats: NatsConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
}

fn default_node_id() -> String {
    format!("adweave-{}", uuid::Uuid::new_v4().simple())
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            nats: NatsConfig::default(),
            redis: RedisConfig::default(),
            orchestrator: OrchestratorConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NatsConfig {
    #[serde(default = "default_nats_urls")]
    pub urls: Vec<String>,
    /// Prefix for all change-feed and handler subjects.
    #[serde(default = "default_subject_prefix")]
    pub subject_prefix: String,
    #[serde(default = "default_nats_max_reconnects")]
    pub max_reconnects: usize,
}

fn default_nats_urls() -> Vec<String> {
    vec!["nats://localhost:4222".to_string()]
}
fn default_subject_prefix() -> String {
    "adweave".to_string()
}
fn default_nats_max_reconnects() -> usize {
    60
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            urls: default_nats_urls(),
            subject_prefix: default_subject_prefix(),
            max_reconnects: default_nats_max_reconnects(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_urls")]
    pub urls: Vec<String>,
}

fn default_redis_urls() -> Vec<String> {
    vec!["redis://localhost:6379".to_string()]
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            urls: default_redis_urls(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorConfig {
    /// Timeout for a single stage handler call. Stage work (model
    /// inference, rendering) can legitimately run for tens of minutes.
    #[serde(default = "default_handler_timeout_secs")]
    pub handler_timeout_secs: u64,
    /// Interval of the periodic recovery sweep.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// A variant `running` at a step behind its job for longer than this
    /// is logged as stuck but never force-advanced.
    #[serde(default = "default_stuck_running_threshold_secs")]
    pub stuck_running_threshold_secs: u64,
    /// How long shutdown waits for in-flight dispatches to drain before
    /// force-cancelling them.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

fn default_handler_timeout_secs() -> u64 {
    30 * 60
}
fn default_sweep_interval_secs() -> u64 {
    60
}
fn default_stuck_running_threshold_secs() -> u64 {
    5 * 60
}
fn default_shutdown_grace_secs() -> u64 {
    30
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            handler_timeout_secs: default_handler_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            stuck_running_threshold_secs: default_stuck_running_threshold_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder().add_source(
            config::Environment::with_prefix("ADWEAVE")
                .separator("__")
                .try_parsing(true)
                .list_separator(","),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.nats.subject_prefix, "adweave");
        assert_eq!(config.orchestrator.handler_timeout_secs, 1800);
        assert_eq!(config.orchestrator.sweep_interval_secs, 60);
        assert_eq!(config.orchestrator.stuck_running_threshold_secs, 300);
        assert_eq!(config.orchestrator.shutdown_grace_secs, 30);
        assert!(config.node_id.starts_with("adweave-"));
    }
}
