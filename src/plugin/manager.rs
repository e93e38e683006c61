//! Host-side plugin registry
//!
//! Registers plugins in order, delivers their configuration, builds the
//! mediation pipeline and keeps an eye on plugin health.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::HostConfig;
use crate::error::{PluginError, Result};
use crate::plugin::chain::Pipeline;
use crate::plugin::contract::Plugin;
use crate::plugin::lifecycle::{HealthStatus, ManagedPlugin};

/// Outcome of [`PluginManager::configure_all`]
#[derive(Debug, Default)]
pub struct ConfigureReport {
    pub configured: Vec<String>,
    pub rejected: Vec<(String, String)>,
}

impl ConfigureReport {
    pub fn all_configured(&self) -> bool {
        self.rejected.is_empty()
    }
}

/// Manages plugin registration, configuration and shutdown
pub struct PluginManager {
    config: HostConfig,
    /// Registration order is pipeline order
    plugins: RwLock<Vec<Arc<ManagedPlugin>>>,
    by_name: DashMap<String, Arc<ManagedPlugin>>,
}

impl PluginManager {
    pub fn new(config: HostConfig) -> Self {
        Self {
            config,
            plugins: RwLock::new(Vec::new()),
            by_name: DashMap::new(),
        }
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Register a plugin, reading its metadata and capabilities once
    pub async fn register(&self, plugin: Arc<dyn Plugin>) -> Result<Arc<ManagedPlugin>> {
        let mut plugins = self.plugins.write().await;
        let fallback = format!("plugin-{}", plugins.len());
        let managed = Arc::new(ManagedPlugin::register(plugin, &fallback).await?);

        if self.by_name.contains_key(managed.name()) {
            return Err(PluginError::Configuration(format!(
                "plugin '{}' is already registered",
                managed.name()
            )));
        }

        self.by_name
            .insert(managed.name().to_string(), managed.clone());
        plugins.push(managed.clone());
        Ok(managed)
    }

    pub fn get(&self, name: &str) -> Option<Arc<ManagedPlugin>> {
        self.by_name.get(name).map(|entry| entry.value().clone())
    }

    pub fn plugin_count(&self) -> usize {
        self.by_name.len()
    }

    /// Plugins in registration order
    pub async fn plugins(&self) -> Vec<Arc<ManagedPlugin>> {
        self.plugins.read().await.clone()
    }

    /// Deliver each plugin its options from the host configuration. A plugin
    /// that rejects its options stays registered but never receives traffic.
    pub async fn configure_all(&self) -> ConfigureReport {
        let mut report = ConfigureReport::default();

        for plugin in self.plugins().await {
            let options = self.config.plugin_config(plugin.name());
            match plugin.configure(options).await {
                Ok(()) => report.configured.push(plugin.name().to_string()),
                Err(e) => {
                    error!(plugin = %plugin.name(), error = %e, "Plugin will not receive traffic");
                    report.rejected.push((plugin.name().to_string(), e.to_string()));
                }
            }
        }

        info!(
            configured = report.configured.len(),
            rejected = report.rejected.len(),
            "Plugin configuration complete"
        );
        report
    }

    /// Snapshot the current registrations into a pipeline
    pub async fn pipeline(&self) -> Pipeline {
        Pipeline::new(self.plugins().await, self.config.pipeline_options())
    }

    /// Probe every plugin once
    pub async fn check_all(&self) -> Vec<(String, HealthStatus)> {
        let timeout = Duration::from_millis(self.config.health_check.timeout_ms);
        let mut results = Vec::new();

        for plugin in self.plugins().await {
            let status = plugin.probe(timeout).await;
            results.push((plugin.name().to_string(), status));
        }

        results
    }

    /// Probe all plugins on the configured interval until `cancel` fires
    pub fn spawn_health_monitor(self: &Arc<Self>, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        if !self.config.health_check.enabled {
            debug!("Plugin health checks disabled");
            return None;
        }

        let manager = self.clone();
        let period = Duration::from_secs(self.config.health_check.interval_seconds);

        Some(tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Health monitor stopping due to shutdown");
                        break;
                    }
                    _ = ticker.tick() => {
                        let results = manager.check_all().await;
                        let unhealthy = results.iter().filter(|(_, s)| !s.healthy).count();
                        if unhealthy > 0 {
                            warn!(unhealthy, total = results.len(), "Unhealthy plugins detected");
                        }
                    }
                }
            }
        }))
    }

    /// Stop every plugin in reverse registration order
    pub async fn shutdown(&self) {
        let grace = Duration::from_millis(self.config.stop_grace_ms);

        for plugin in self.plugins().await.iter().rev() {
            if let Err(e) = plugin.stop(grace).await {
                error!(plugin = %plugin.name(), error = %e, "Failed to stop plugin");
            }
        }

        info!("All plugins stopped");
    }
}
