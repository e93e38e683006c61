use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use http_mediator::commands;
use http_mediator::config::{self, CliOverrides, Config};
use http_mediator::logging;
use http_mediator::plugins::BuiltinPlugin;
use http_mediator::server::{self, Network};

#[derive(Parser, Debug)]
#[command(name = "http-mediator")]
#[command(about = "Serve and inspect HTTP mediation plugins", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Path to configuration file (YAML/JSON/TOML)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Serve a built-in plugin until SIGINT or SIGTERM
    Serve {
        /// Transport to listen on
        #[arg(long, value_enum)]
        network: Option<Network>,

        /// Socket path (unix) or host:port (tcp)
        #[arg(long)]
        address: Option<String>,

        /// Which plugin to serve
        #[arg(long, value_enum, default_value_t = BuiltinPlugin::Passthrough)]
        plugin: BuiltinPlugin,
    },
    /// Connect to a running plugin and run its probes
    Check {
        #[arg(long, value_enum)]
        network: Option<Network>,

        #[arg(long)]
        address: Option<String>,

        /// Per-call timeout in milliseconds
        #[arg(long, default_value_t = 5000)]
        timeout_ms: u64,
    },
}

fn load_config(args: &Args, network: Option<Network>, address: Option<String>) -> anyhow::Result<Config> {
    let overrides = CliOverrides {
        network,
        address,
        debug: args.debug,
    };

    let config = config::load(args.config.as_deref(), &overrides).with_context(|| match &args.config {
        Some(path) => format!("Failed to load configuration from {}", path.display()),
        None => "Failed to load configuration".to_string(),
    })?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match &args.command {
        Command::Serve {
            network,
            address,
            plugin,
        } => {
            let config = load_config(&args, *network, address.clone())?;
            logging::init(&config.logging);

            info!("Starting HTTP mediator plugin '{}'", plugin);

            let shutdown = CancellationToken::new();
            let mut handle = {
                let config = config.clone();
                let shutdown = shutdown.clone();
                let plugin = plugin.build();
                tokio::spawn(async move { server::serve(plugin, &config, shutdown).await })
            };

            tokio::select! {
                // Startup failures end the process before any signal arrives
                result = &mut handle => {
                    return result.context("Plugin server task failed")?.map_err(|e| {
                        error!("Plugin server failed: {}", e);
                        e.into()
                    });
                }
                _ = server::shutdown_signal() => {}
            }

            info!("Shutting down HTTP mediator plugin");
            shutdown.cancel();

            // Graceful shutdown with timeout
            let limit = config.server.grace_period() + Duration::from_secs(5);
            match tokio::time::timeout(limit, handle).await {
                Ok(result) => {
                    result.context("Plugin server task failed")??;
                    info!("Graceful shutdown completed");
                }
                Err(_) => {
                    error!("Shutdown timeout exceeded, forcing exit");
                    std::process::exit(1);
                }
            }
        }
        Command::Check {
            network,
            address,
            timeout_ms,
        } => {
            let config = load_config(&args, *network, address.clone())?;
            logging::init(&config.logging);

            let endpoint = config
                .server
                .endpoint()
                .context("No plugin address given (use --address)")?;

            commands::run_plugin_check(&endpoint, Duration::from_millis(*timeout_ms)).await?;
        }
    }

    Ok(())
}
