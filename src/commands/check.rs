use std::future::Future;
use tokio::time::{timeout, Duration};
use tracing::{error, info, warn};

use crate::error::{HealthError, PluginError, Result};
use crate::plugin::{Flow, Plugin};
use crate::server::{Endpoint, RemotePlugin};

/// Connect to a running plugin and report what it says about itself.
/// Fails if the plugin is unreachable or any probe fails.
pub async fn run_plugin_check(endpoint: &Endpoint, call_timeout: Duration) -> Result<()> {
    info!("Checking plugin at {}...", endpoint);

    let plugin = timeout(call_timeout, RemotePlugin::connect(endpoint))
        .await
        .map_err(|_| PluginError::Timeout {
            timeout_ms: call_timeout.as_millis() as u64,
        })??;
    info!("✓ Connected");

    let mut all_ok = true;

    match bounded(call_timeout, plugin.get_metadata()).await {
        Ok(metadata) => {
            info!("✓ Metadata");
            info!("  Name: {}", display_or_unset(&metadata.name));
            info!("  Version: {}", display_or_unset(&metadata.version));
            if !metadata.description.is_empty() {
                info!("  Description: {}", metadata.description);
            }
        }
        Err(e) => {
            error!("✗ Metadata: {}", e);
            all_ok = false;
        }
    }

    match bounded(call_timeout, plugin.get_capabilities()).await {
        Ok(capabilities) if capabilities.is_empty() => {
            warn!("! Capabilities: no flows declared, the host will never route traffic to it");
        }
        Ok(capabilities) => {
            let flows: Vec<String> = [Flow::Request, Flow::Response]
                .into_iter()
                .filter(|flow| capabilities.supports(*flow))
                .map(|flow| flow.to_string())
                .collect();
            info!("✓ Capabilities: {}", flows.join(", "));
        }
        Err(e) => {
            error!("✗ Capabilities: {}", e);
            all_ok = false;
        }
    }

    match bounded(call_timeout, plugin.check_health()).await {
        Ok(()) => info!("✓ Health check: PASSED"),
        Err(e) => {
            error!("✗ Health check: FAILED - {}", e);
            all_ok = false;
        }
    }

    match bounded(call_timeout, plugin.check_ready()).await {
        Ok(()) => info!("✓ Readiness check: PASSED"),
        Err(e) => {
            error!("✗ Readiness check: FAILED - {}", e);
            all_ok = false;
        }
    }

    plugin.close();

    if all_ok {
        info!("\n✓ All checks passed");
        Ok(())
    } else {
        Err(HealthError::Unhealthy("one or more checks failed".to_string()).into())
    }
}

async fn bounded<T>(limit: Duration, call: impl Future<Output = Result<T>>) -> Result<T> {
    timeout(limit, call).await.map_err(|_| PluginError::Timeout {
        timeout_ms: limit.as_millis() as u64,
    })?
}

fn display_or_unset(value: &str) -> &str {
    if value.is_empty() {
        "(unset)"
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::BuiltinPlugin;
    use crate::server::PluginServer;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_check_passes_for_healthy_plugin() {
        let server = PluginServer::new(BuiltinPlugin::Passthrough.build(), Endpoint::tcp("127.0.0.1:0"))
            .bind()
            .await
            .unwrap();
        let endpoint = server.endpoint().clone();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(server.serve(shutdown.clone()));

        tokio_test::assert_ok!(run_plugin_check(&endpoint, Duration::from_secs(2)).await);

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_check_fails_when_not_ready() {
        // bearer-auth reports not ready until it has a token
        let server = PluginServer::new(BuiltinPlugin::BearerAuth.build(), Endpoint::tcp("127.0.0.1:0"))
            .bind()
            .await
            .unwrap();
        let endpoint = server.endpoint().clone();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(server.serve(shutdown.clone()));

        let result = run_plugin_check(&endpoint, Duration::from_secs(2)).await;
        assert!(matches!(result, Err(PluginError::Health(_))));

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }
}
