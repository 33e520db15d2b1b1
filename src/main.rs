//! Wire Gateway - Main entry point

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tokio::signal;
use wire_gateway::{Gateway, admin, config::GatewayConfig, config::split_opts, metrics};

#[derive(Parser, Debug)]
#[command(name = "wire-gateway")]
#[command(about = "gRPC gateway for framed internal RPC services", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// gRPC listen address
    #[arg(long)]
    addr: Option<String>,

    /// Registry kind (direct, multi, zookeeper, etcdv3, consul)
    #[arg(long)]
    reg: Option<String>,

    /// Registry parameters, space separated
    #[arg(long)]
    opts: Option<String>,

    /// Admin HTTP port (health, metrics, endpoints)
    #[arg(long)]
    admin_port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log format (json or pretty)
    #[arg(long, default_value = "json")]
    log_format: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    match cli.log_format.as_str() {
        "pretty" => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .json()
                .init();
        }
    }

    tracing::info!("Starting Wire Gateway");

    // Load configuration
    let mut config = GatewayConfig::load(cli.config)?;

    // CLI overrides
    if let Some(addr) = cli.addr {
        config.listen_addr = addr;
    }
    if let Some(reg) = cli.reg {
        config.registry.kind = reg;
    }
    if let Some(opts) = cli.opts {
        config.registry.opts = split_opts(&opts);
    }
    if let Some(port) = cli.admin_port {
        config.admin_port = Some(port);
    }

    config.validate()?;

    tracing::info!(
        listen_addr = %config.listen_addr,
        registry = %config.registry.kind,
        opts = ?config.registry.opts,
        admin_port = ?config.admin_port,
        "Configuration loaded"
    );

    // Setup metrics
    let prometheus_handle = metrics::setup_metrics()?;

    let gateway = Gateway::bind(&config)
        .await
        .context("Failed to start gateway")?;
    let stop = gateway.stop_handle();

    // Admin API
    let admin_handle = match config.admin_port {
        Some(port) => {
            let app = admin::create_router(admin::AdminState {
                client: gateway.client(),
                prometheus_handle,
            });

            let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
            tracing::info!(addr = %addr, "Starting admin server");

            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .context("Failed to bind admin server")?;

            Some(tokio::spawn(async move {
                if let Err(e) = axum::serve(listener, app).await {
                    tracing::error!(error = %e, "Admin server error");
                }
            }))
        }
        None => None,
    };

    tokio::spawn(async move {
        shutdown_signal().await;
        stop.stop();
    });

    gateway.serve().await.context("gRPC server error")?;

    tracing::info!("Shutting down...");

    if let Some(handle) = admin_handle {
        handle.abort();
    }

    tracing::info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
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
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM signal");
        },
    }
}
