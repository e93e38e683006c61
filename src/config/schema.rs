use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::time::Duration;

use crate::plugin::chain::{PipelineOptions, ResponseFailurePolicy, UnroutableStagePolicy};
use crate::plugin::schema::PluginConfig;
use crate::server::listener::{Endpoint, Network};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub host: HostConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Plugin process listening endpoint
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub network: Network,
    /// Socket path for unix, host:port for tcp. Required to serve.
    #[serde(default)]
    pub address: Option<String>,
    /// How long in-flight calls may run after a shutdown signal
    #[serde(default = "default_grace_period")]
    pub grace_period_ms: u64,
}

/// Host-side pipeline and plugin management
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HostConfig {
    #[serde(default = "default_stage_timeout")]
    pub stage_timeout_ms: u64,
    #[serde(default)]
    pub response_failure_policy: ResponseFailurePolicy,
    /// Skip or fail on a stage whose plugin is rejected or stopping
    #[serde(default)]
    pub unroutable_stage_policy: UnroutableStagePolicy,
    #[serde(default = "default_stop_grace")]
    pub stop_grace_ms: u64,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    /// Options delivered to each plugin's `configure`, keyed by plugin name
    #[serde(default)]
    pub plugins: BTreeMap<String, BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthCheckConfig {
    #[serde(default = "default_health_check_enabled")]
    pub enabled: bool,
    #[serde(default = "default_health_check_interval")]
    pub interval_seconds: u64,
    #[serde(default = "default_health_check_timeout")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            network: Network::default(),
            address: None,
            grace_period_ms: default_grace_period(),
        }
    }
}

impl ServerConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    /// The endpoint to listen on; `None` when no address is configured
    pub fn endpoint(&self) -> Option<Endpoint> {
        self.address
            .as_ref()
            .map(|address| Endpoint::new(self.network, address.clone()))
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            stage_timeout_ms: default_stage_timeout(),
            response_failure_policy: ResponseFailurePolicy::default(),
            unroutable_stage_policy: UnroutableStagePolicy::default(),
            stop_grace_ms: default_stop_grace(),
            health_check: HealthCheckConfig::default(),
            plugins: BTreeMap::new(),
        }
    }
}

impl HostConfig {
    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            stage_timeout: Duration::from_millis(self.stage_timeout_ms),
            response_failure_policy: self.response_failure_policy,
            unroutable_stage_policy: self.unroutable_stage_policy,
        }
    }

    /// Options for one plugin; empty when none are configured
    pub fn plugin_config(&self, plugin: &str) -> PluginConfig {
        self.plugins
            .get(plugin)
            .cloned()
            .map(PluginConfig::from)
            .unwrap_or_default()
    }
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: default_health_check_enabled(),
            interval_seconds: default_health_check_interval(),
            timeout_ms: default_health_check_timeout(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// Default value functions
fn default_grace_period() -> u64 {
    10_000
}

fn default_stage_timeout() -> u64 {
    30_000
}

fn default_stop_grace() -> u64 {
    5_000
}

fn default_health_check_enabled() -> bool {
    true
}

fn default_health_check_interval() -> u64 {
    30
}

fn default_health_check_timeout() -> u64 {
    2_000
}

fn default_log_level() -> String {
    "info".to_string()
}
