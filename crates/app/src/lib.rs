use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use kometa_ui_core::config::{config_path, data_dir, initialize_data_dir, AppConfig};
use kometa_ui_core::logging::{self, LogSetup, ServiceLogSink, DEFAULT_LOG_FILTER};
use kometa_ui_core::server::{app_router, app_state_with_config, orchestrator_for_config};

#[derive(Parser)]
#[command(
    name = "kometa-ui",
    about = "Web service that runs Kometa inside its container and keeps the logs",
    args_conflicts_with_subcommands = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(long)]
    host: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Report whether the Kometa container can run commands, then exit.
    Check,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    log_startup_metadata(cli.command.is_some(), &resolved_data_dir);

    match cli.command {
        Some(Commands::Check) => run_check(resolved_data_dir).await,
        None => run_server(cli.port, cli.host, resolved_data_dir).await,
    }
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let setup = LogSetup {
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let filters = logging::log_filters(&setup);
    let console_env_filter = parse_env_filter_with_fallback(&filters.console, "console");

    match logging::service_log_sink(&setup) {
        ServiceLogSink::Ready { appender, .. } => {
            let file_env_filter = parse_env_filter_with_fallback(&filters.file, "file");

            let subscriber = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(console_env_filter),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(logging::redacting_make_writer(appender))
                        .with_filter(file_env_filter),
                );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
            }
        }
        ServiceLogSink::Disabled { dir, reason } => {
            let attempted_dir = dir
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<none>".to_string());

            let subscriber = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(console_env_filter),
            );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }

            warn!(
                attempted_dir = %attempted_dir,
                reason = %reason,
                "Service log file unavailable; continuing with console-only logging"
            );
        }
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn log_startup_metadata(is_check: bool, data_dir: &Path) {
    info!(
        mode = if is_check { "check" } else { "server" },
        pid = std::process::id(),
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %data_dir.display(),
        config_path = %config_path(data_dir).display(),
        "Runtime startup metadata"
    );
}

/// Loads, anchors, and validates the service config for `data_dir`.
fn load_config(data_dir: &Path) -> Result<AppConfig> {
    if let Err(err) = initialize_data_dir(data_dir) {
        warn!(error = %err, "Failed to initialize data directory");
    }

    let cfg_path = config_path(data_dir);
    let mut config = match AppConfig::load_from_path(&cfg_path) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load config file, using defaults");
            AppConfig::default()
        }
    };
    config.resolve_paths(data_dir);
    config
        .validate()
        .with_context(|| format!("invalid configuration in {}", cfg_path.display()))?;
    Ok(config)
}

async fn run_check(data_dir: PathBuf) -> Result<()> {
    let config = load_config(&data_dir)?;
    let orchestrator = orchestrator_for_config(&config, &data_dir)?;

    let container = &orchestrator.settings().container_name;
    let availability = orchestrator.executor().check_available(container).await;
    if !availability.ok {
        bail!(
            "container '{container}' is unavailable: {}",
            availability.reason.as_deref().unwrap_or("unknown reason")
        );
    }

    println!("container '{container}' is running and reachable");
    if orchestrator.run_in_progress() {
        println!("a run is currently in progress");
    }
    Ok(())
}

async fn run_server(
    port_override: Option<u16>,
    host_override: Option<String>,
    data_dir: PathBuf,
) -> Result<()> {
    let config = load_config(&data_dir)?;

    let port = port_override
        .or_else(|| std::env::var("PORT").ok().and_then(|v| v.parse().ok()))
        .unwrap_or(config.server.port);
    let host = host_override.unwrap_or_else(|| config.server.host.clone());

    let state = app_state_with_config(config, config_path(&data_dir), data_dir)?;
    let app = app_router(state);

    let addr = format!("{host}:{port}");
    info!(%addr, "Starting kometa-ui server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app).await?;
    Ok(())
}
