use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Arg, ArgMatches, Command};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use workerhub_core::{AppConfig, LogFormat};

mod app;
mod shutdown;

use app::{AppMode, Application};
use shutdown::ShutdownManager;

fn cli() -> Command {
    Command::new("workerhub")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Worker dispatch hub")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .global(true)
                .help("Configuration file (TOML)"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .global(true)
                .value_parser(["trace", "debug", "info", "warn", "error"])
                .help("Log level, overrides the configured one"),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .global(true)
                .value_parser(["json", "pretty"])
                .help("Log format, overrides the configured one"),
        )
        .subcommand(Command::new("serve").about("Run the dispatcher"))
        .subcommand(
            Command::new("worker")
                .about("Run a worker agent")
                .arg(
                    Arg::new("worker-id")
                        .long("worker-id")
                        .value_name("ID")
                        .help("Worker id, overrides the configured one"),
                )
                .arg(
                    Arg::new("server-url")
                        .long("server-url")
                        .value_name("URL")
                        .help("Dispatcher WebSocket URL, overrides the configured one"),
                ),
        )
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();

    let config_path = matches.get_one::<String>("config").map(String::as_str);
    let mut config = AppConfig::load(config_path).with_context(|| match config_path {
        Some(path) => format!("failed to load config file {path}"),
        None => "failed to load configuration".to_string(),
    })?;
    apply_overrides(&mut config, &matches)?;

    init_logging(&config.logging.level, config.logging.format)?;

    let mode = match matches.subcommand_name() {
        Some("worker") => AppMode::Worker,
        _ => AppMode::Serve,
    };
    info!(mode = ?mode, config = ?config_path, "starting workerhub");

    let app = Arc::new(Application::new(config, mode)?);
    let shutdown_manager = ShutdownManager::new();

    let shutdown_rx = shutdown_manager.subscribe().await;
    let running = Arc::clone(&app);
    let mut app_handle = tokio::spawn(async move { running.run(shutdown_rx).await });

    tokio::select! {
        _ = wait_for_shutdown_signal() => {
            info!("shutdown signal received, stopping gracefully");
        }
        result = &mut app_handle => {
            return match result {
                Ok(Ok(())) => {
                    warn!("application exited without a shutdown signal");
                    Ok(())
                }
                Ok(Err(e)) => {
                    error!(error = ?e, "application failed");
                    Err(e)
                }
                Err(e) => Err(e).context("application task failed"),
            };
        }
    }

    shutdown_manager.shutdown().await;
    match app_handle.await {
        Ok(Ok(())) => info!("workerhub stopped"),
        Ok(Err(e)) => error!(error = %e, "error during shutdown"),
        Err(e) => error!(error = %e, "application task failed"),
    }

    Ok(())
}

fn apply_overrides(config: &mut AppConfig, matches: &ArgMatches) -> Result<()> {
    if let Some(level) = matches.get_one::<String>("log-level") {
        config.logging.level = level.clone();
    }
    if let Some(format) = matches.get_one::<String>("log-format") {
        config.logging.format = format.parse()?;
    }
    if let Some(("worker", worker)) = matches.subcommand() {
        if let Some(id) = worker.get_one::<String>("worker-id") {
            config.worker.worker_id = id.clone();
        }
        if let Some(url) = worker.get_one::<String>("server-url") {
            config.worker.server_url = url.clone();
        }
    }
    Ok(())
}

/// `RUST_LOG` wins over the configured level.
fn init_logging(log_level: &str, log_format: LogFormat) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    match log_format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .context("failed to initialize JSON logging")?,
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init()
            .context("failed to initialize pretty logging")?,
    }

    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
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
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C"),
        _ = terminate => info!("received SIGTERM"),
    }
}
