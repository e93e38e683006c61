//! Plugin process side: listen on an endpoint and answer contract calls
//!
//! A plugin binary hands its [`Plugin`] to [`run`], which parses the
//! standard flags, loads configuration, binds the endpoint and serves until
//! SIGINT or SIGTERM.

pub mod client;
pub mod listener;
pub mod serve;
pub mod wire;

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{self, CliOverrides, Config};
use crate::error::{PluginError, Result};
use crate::logging;
use crate::plugin::contract::Plugin;

pub use client::RemotePlugin;
pub use listener::{Endpoint, Network};
pub use serve::{BoundServer, PluginServer};

/// Flags every plugin binary accepts
#[derive(Parser, Debug, Clone, Default)]
pub struct ServeArgs {
    /// Transport to listen on
    #[arg(long, value_enum)]
    pub network: Option<Network>,

    /// Socket path (unix) or host:port (tcp)
    #[arg(long)]
    pub address: Option<String>,

    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    pub debug: bool,
}

impl ServeArgs {
    pub fn overrides(&self) -> CliOverrides {
        CliOverrides {
            network: self.network,
            address: self.address.clone(),
            debug: self.debug,
        }
    }

    pub fn load_config(&self) -> Result<Config> {
        Ok(config::load(self.config.as_deref(), &self.overrides())?)
    }
}

/// Entry point for a plugin binary. Returns once the server has shut down.
pub async fn run<P: Plugin>(plugin: P) -> Result<()> {
    let args = ServeArgs::parse();
    let config = args.load_config()?;
    logging::init(&config.logging);

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            shutdown.cancel();
        });
    }

    serve(Arc::new(plugin), &config, shutdown).await
}

/// Serve `plugin` on the configured endpoint until `shutdown` fires
pub async fn serve(plugin: Arc<dyn Plugin>, config: &Config, shutdown: CancellationToken) -> Result<()> {
    let endpoint = config.server.endpoint().ok_or_else(|| {
        PluginError::Startup("no listen address configured (use --address)".to_string())
    })?;

    info!("Starting plugin server on {}", endpoint);

    PluginServer::new(plugin, endpoint)
        .with_grace_period(config.server.grace_period())
        .bind()
        .await?
        .serve(shutdown)
        .await
}

/// Resolves on Ctrl+C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::DefaultPlugin;

    #[tokio::test]
    async fn test_serve_without_address_is_startup_error() {
        let config = Config::default();
        let result = serve(Arc::new(DefaultPlugin), &config, CancellationToken::new()).await;

        assert!(matches!(result, Err(PluginError::Startup(_))));
    }

    #[test]
    fn test_serve_args_parse() {
        let args = ServeArgs::parse_from([
            "plugin",
            "--network",
            "tcp",
            "--address",
            "127.0.0.1:9000",
            "--debug",
        ]);

        let overrides = args.overrides();
        assert_eq!(overrides.network, Some(Network::Tcp));
        assert_eq!(overrides.address.as_deref(), Some("127.0.0.1:9000"));
        assert!(overrides.debug);
    }
}
