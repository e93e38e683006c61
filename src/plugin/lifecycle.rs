//! Plugin lifecycle and health tracking
//!
//! A [`ManagedPlugin`] is the host's handle on one plugin instance. It caches
//! what the plugin declared at registration, enforces the
//! configure → serve → stop ordering, and records probe results.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, RwLock};
use tokio::time::{timeout, Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::{HealthError, PluginError, Result};
use crate::plugin::contract::Plugin;
use crate::plugin::schema::{
    Capabilities, Flow, HttpRequest, HttpResponse, Metadata, PluginConfig, Verdict,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginState {
    /// Metadata and capabilities read; waiting for `configure`
    Registered,
    /// Configured and accepting mediation traffic
    Configured,
    /// `configure` failed; never routed to
    Rejected,
    /// No new traffic; draining in-flight calls before `stop`
    Stopping,
    Stopped,
}

impl PluginState {
    pub fn can_transition_to(self, next: PluginState) -> bool {
        use PluginState::*;
        matches!(
            (self, next),
            (Registered, Configured)
                | (Registered, Rejected)
                | (Registered, Stopping)
                | (Configured, Stopping)
                | (Rejected, Stopping)
                | (Stopping, Stopped)
        )
    }

    pub fn accepts_traffic(self) -> bool {
        self == PluginState::Configured
    }
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PluginState::Registered => "registered",
            PluginState::Configured => "configured",
            PluginState::Rejected => "rejected",
            PluginState::Stopping => "stopping",
            PluginState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Outcome of the last liveness/readiness probe
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub timestamp: DateTime<Utc>,
    pub healthy: bool,
    pub ready: bool,
    pub response_time_ms: Option<u64>,
    pub error: Option<String>,
}

impl HealthStatus {
    fn unprobed(reason: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            healthy: false,
            ready: false,
            response_time_ms: None,
            error: Some(reason.into()),
        }
    }
}

/// Host-side handle on a registered plugin
pub struct ManagedPlugin {
    name: String,
    plugin: Arc<dyn Plugin>,
    metadata: Metadata,
    capabilities: Capabilities,
    state: RwLock<PluginState>,
    last_health: RwLock<Option<HealthStatus>>,
    in_flight: AtomicUsize,
    drained: Notify,
}

impl ManagedPlugin {
    /// Read metadata and capabilities once and start tracking the plugin.
    ///
    /// `fallback_name` is used when the plugin reports an empty name.
    pub async fn register(plugin: Arc<dyn Plugin>, fallback_name: &str) -> Result<Self> {
        let metadata = plugin.get_metadata().await?;
        let capabilities = plugin.get_capabilities().await?;

        let name = if metadata.name.is_empty() {
            fallback_name.to_string()
        } else {
            metadata.name.clone()
        };

        if capabilities.is_empty() {
            warn!(plugin = %name, "Plugin declares no flows and will never mediate traffic");
        }

        info!(
            plugin = %name,
            version = %metadata.version,
            flows = ?capabilities.flows,
            "Registered plugin"
        );

        Ok(Self {
            name,
            plugin,
            metadata,
            capabilities,
            state: RwLock::new(PluginState::Registered),
            last_health: RwLock::new(None),
            in_flight: AtomicUsize::new(0),
            drained: Notify::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Metadata as read at registration
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Capabilities as read at registration
    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn supports(&self, flow: Flow) -> bool {
        self.capabilities.supports(flow)
    }

    pub async fn state(&self) -> PluginState {
        *self.state.read().await
    }

    pub async fn is_routable(&self) -> bool {
        self.state().await.accepts_traffic()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub async fn last_health(&self) -> Option<HealthStatus> {
        self.last_health.read().await.clone()
    }

    fn transition(&self, state: &mut PluginState, next: PluginState) -> Result<()> {
        if !state.can_transition_to(next) {
            return Err(PluginError::InvalidStateTransition {
                plugin: self.name.clone(),
                from: *state,
                to: next,
            });
        }
        debug!(plugin = %self.name, from = %state, to = %next, "Plugin state transition");
        *state = next;
        Ok(())
    }

    /// Deliver configuration. Succeeds at most once; a failure rejects the
    /// plugin so no traffic is ever routed to it.
    pub async fn configure(&self, config: PluginConfig) -> Result<()> {
        let mut state = self.state.write().await;
        if *state != PluginState::Registered {
            return Err(PluginError::InvalidStateTransition {
                plugin: self.name.clone(),
                from: *state,
                to: PluginState::Configured,
            });
        }

        match self.plugin.configure(config).await {
            Ok(()) => {
                self.transition(&mut state, PluginState::Configured)?;
                info!(plugin = %self.name, "Plugin configured");
                Ok(())
            }
            Err(e) => {
                self.transition(&mut state, PluginState::Rejected)?;
                warn!(plugin = %self.name, error = %e, "Plugin rejected its configuration");
                Err(e)
            }
        }
    }

    /// Take an in-flight slot if the plugin accepts traffic.
    async fn enter(&self, flow: Flow) -> Result<InFlightGuard<'_>> {
        if !self.supports(flow) {
            return Err(PluginError::FlowNotDeclared {
                plugin: self.name.clone(),
                flow,
            });
        }

        // Counted under the read lock so `stop` sees every call admitted
        // before it flipped the state.
        let state = self.state.read().await;
        if !state.accepts_traffic() {
            return Err(PluginError::NotRoutable {
                plugin: self.name.clone(),
                state: *state,
            });
        }
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        Ok(InFlightGuard { plugin: self })
    }

    pub async fn handle_request(&self, request: HttpRequest) -> Result<Verdict> {
        let _guard = self.enter(Flow::Request).await?;
        self.plugin.handle_request(request).await
    }

    pub async fn handle_response(&self, response: HttpResponse) -> Result<Verdict> {
        let _guard = self.enter(Flow::Response).await?;
        self.plugin.handle_response(response).await
    }

    /// Run the liveness and readiness probes and record the result.
    ///
    /// Probes never fail the caller: problems are reported in the returned
    /// status. An unconfigured plugin is not probed.
    pub async fn probe(&self, probe_timeout: Duration) -> HealthStatus {
        let state = self.state().await;
        let status = match state {
            PluginState::Registered => HealthStatus::unprobed("not configured"),
            PluginState::Rejected => HealthStatus::unprobed("configuration rejected"),
            PluginState::Stopped => HealthStatus::unprobed("stopped"),
            PluginState::Configured | PluginState::Stopping => {
                self.run_probes(probe_timeout).await
            }
        };

        if !status.healthy {
            warn!(plugin = %self.name, error = ?status.error, "Plugin unhealthy");
        } else if !status.ready {
            debug!(plugin = %self.name, error = ?status.error, "Plugin not ready");
        }

        *self.last_health.write().await = Some(status.clone());
        status
    }

    async fn run_probes(&self, probe_timeout: Duration) -> HealthStatus {
        let start = Instant::now();

        let health = match timeout(probe_timeout, self.plugin.check_health()).await {
            Ok(result) => result,
            Err(_) => Err(HealthError::Timeout.into()),
        };
        if let Err(e) = health {
            return HealthStatus {
                timestamp: Utc::now(),
                healthy: false,
                ready: false,
                response_time_ms: Some(start.elapsed().as_millis() as u64),
                error: Some(e.to_string()),
            };
        }

        let ready = match timeout(probe_timeout, self.plugin.check_ready()).await {
            Ok(result) => result,
            Err(_) => Err(HealthError::Timeout.into()),
        };

        HealthStatus {
            timestamp: Utc::now(),
            healthy: true,
            ready: ready.is_ok(),
            response_time_ms: Some(start.elapsed().as_millis() as u64),
            error: ready.err().map(|e| e.to_string()),
        }
    }

    /// Stop routing to the plugin, let in-flight calls finish (up to
    /// `grace`), then call the plugin's `stop`. Repeated calls are no-ops.
    pub async fn stop(&self, grace: Duration) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if matches!(*state, PluginState::Stopping | PluginState::Stopped) {
                return Ok(());
            }
            self.transition(&mut state, PluginState::Stopping)?;
        }

        if timeout(grace, self.wait_drained()).await.is_err() {
            warn!(
                plugin = %self.name,
                in_flight = self.in_flight(),
                grace_ms = grace.as_millis() as u64,
                "In-flight calls still running after grace period"
            );
        }

        let result = self.plugin.stop().await;

        let mut state = self.state.write().await;
        self.transition(&mut state, PluginState::Stopped)?;
        match &result {
            Ok(()) => info!(plugin = %self.name, "Plugin stopped"),
            Err(e) => warn!(plugin = %self.name, error = %e, "Plugin stop failed"),
        }
        result
    }

    async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl fmt::Debug for ManagedPlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedPlugin")
            .field("name", &self.name)
            .field("metadata", &self.metadata)
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

struct InFlightGuard<'a> {
    plugin: &'a ManagedPlugin,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if self.plugin.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.plugin.drained.notify_waiters();
        }
    }
}
