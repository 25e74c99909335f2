mod cli;
mod config;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use ws_proxy::{Proxy, Transport};

use crate::cli::Cli;
use crate::config::{ConfigSource, LogFormat};

/// Resolves on ctrl-c, or SIGTERM on unix.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("received SIGINT (ctrl-c)"),
                    _ = sigterm.recv() => info!("received SIGTERM"),
                }
                return;
            }
            Err(err) => warn!(%err, "failed to register SIGTERM handler"),
        }
    }

    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(%err, "failed to listen for ctrl-c; running until killed");
        std::future::pending::<()>().await;
    }
    info!("received SIGINT (ctrl-c)");
}

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Parse CLI args.
    let cli = Cli::parse();

    // 2. Load config, then merge CLI overrides.
    let (mut cfg, source) = config::load(&cli.config)?;

    if let Some(ref listen) = cli.listen {
        cfg.network.listen_addr = listen.clone();
    }
    if let Some(ref backend) = cli.backend {
        cfg.backend.url = backend.clone();
    }
    if cli.tls {
        cfg.tls.enabled = true;
    }
    if let Some(ref cert) = cli.tls_cert {
        cfg.tls.cert_path = cert.clone();
    }
    if let Some(ref key) = cli.tls_key {
        cfg.tls.key_path = key.clone();
    }

    // 3. Init tracing-subscriber.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.logging.level));

    match cfg.logging.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .init(),
    }

    if source == ConfigSource::Defaults {
        warn!(
            path = %cli.config.display(),
            "configuration file not found; using defaults"
        );
    }

    // 4. Build the relay configuration.
    let proxy_config = cfg.proxy_config()?;

    info!(
        config_file = %cli.config.display(),
        listen = %proxy_config.listen_addr,
        backend = %proxy_config.backend_url,
        tls = matches!(proxy_config.transport, Transport::Tls { .. }),
        verify_backend_certificate = proxy_config.verify_backend_certificate,
        "ws-relay starting"
    );

    // 5. Load certificates and bind. Either failing stops the process.
    let proxy = Proxy::bind(proxy_config)
        .await
        .context("failed to start WebSocket relay")?;

    // 6. Serve until ctrl-c / SIGTERM.
    proxy
        .run_until(shutdown_signal())
        .await
        .context("WebSocket relay exited with an error")?;

    info!("ws-relay shutting down");
    Ok(())
}
