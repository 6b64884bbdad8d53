//! Authenticating reverse proxy.
//!
//! # Architecture Overview
//!
//! ```text
//!     Client ──▶ net::listener ──▶ proxy::server (task per connection)
//!                                        │
//!                                        ▼
//!                               proxy::handler ──▶ policy (once)
//!                                  │         │
//!                     allow ◀──────┘         └──────▶ deny
//!                       │                              │
//!                       ▼                              ▼
//!              relay raw bytes to backend     composed error response,
//!              (backend reply copied back)    close after writing
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use auth_proxy::config::{load_config, ProxyConfig};
use auth_proxy::lifecycle::{signals, Shutdown};
use auth_proxy::net::listener::Listener;
use auth_proxy::observability::{logging, metrics};
use auth_proxy::policy::ApiKeyPolicy;
use auth_proxy::proxy::{ProxyServer, SharedPolicy};

#[derive(Parser)]
#[command(name = "auth-proxy")]
#[command(about = "Authenticating reverse proxy", long_about = None)]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listener bind address.
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ProxyConfig::default(),
    };
    if let Some(bind) = cli.bind {
        config.listener.bind_address = bind;
    }

    logging::init_logging(&config.observability);
    tracing::info!("auth-proxy v{} starting", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        bind_address = %config.listener.bind_address,
        max_connections = config.listener.max_connections,
        backend = %config.backend.target(),
        max_header_bytes = config.limits.max_header_bytes,
        api_keys = config.policy.keys.len(),
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => {
                if let Err(err) = metrics::init_metrics(addr) {
                    tracing::error!(error = %err, "Failed to start metrics exporter");
                }
            }
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let listener = Listener::bind(&config.listener).await?;
    let policy: SharedPolicy = Arc::new(ApiKeyPolicy::from_config(&config.policy));
    let server = ProxyServer::new(&config, policy);

    let shutdown = Shutdown::new();
    let server_shutdown = shutdown.subscribe();
    let server_task = tokio::spawn(server.run(listener, server_shutdown));

    signals::wait_for_termination().await;
    shutdown.trigger();
    server_task.await??;

    tracing::info!("Shutdown complete");
    Ok(())
}
