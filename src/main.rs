use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use noded::config::{NodeConfig, TriggerConfig};
use noded::trigger::timer;
use noded::{Agent, HttpHandler};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser)]
#[command(
    name = "noded",
    about = "Long-lived node agent: task sync, cron and stream dispatch",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to the agent configuration file
    #[arg(long, env = "NODED_CONFIG", default_value = "node.toml")]
    config: PathBuf,

    /// Log level filter (trace, debug, info, warn, error)
    #[arg(long, env = "NODED_LOG")]
    log: Option<String>,

    /// Log format: "pretty" or "json"
    #[arg(long, env = "NODED_LOG_FORMAT")]
    log_format: Option<String>,

    /// Write logs to this file path (rotated daily). Optional.
    #[arg(long, env = "NODED_LOG_FILE")]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the agent in the foreground (default when no subcommand given).
    ///
    /// Examples:
    ///   noded serve
    ///   noded
    Serve,
    /// Validate the configuration and print the triggers it would arm.
    ///
    /// Exit code 0 when the file parses and every cron expression compiles.
    ///
    /// Examples:
    ///   noded check
    ///   noded check --config /etc/noded/node.toml
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = NodeConfig::load(&args.config)
        .with_context(|| format!("cannot load {}", args.config.display()))?;

    match args.command {
        Some(Command::Check) => run_check(&config),
        None | Some(Command::Serve) => {
            // CLI/env flags win over the [log] section of the config file.
            let log_level = args.log.unwrap_or_else(|| config.log.level.clone());
            let log_format = args.log_format.unwrap_or_else(|| config.log.format.clone());
            let log_file = args
                .log_file
                .or_else(|| config.log.file.as_ref().map(PathBuf::from));
            let _file_guard = setup_logging(&log_level, log_file.as_deref(), &log_format);
            run_serve(config).await
        }
    }
}

async fn run_serve(config: NodeConfig) -> Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        artifact_version = %config.system.version,
        "noded starting"
    );

    let handler_cfg = config
        .handler
        .clone()
        .context("a [handler] section is required to serve")?;
    let handler = Arc::new(HttpHandler::from_config(&handler_cfg));

    let agent = Agent::new(config, handler);
    let shutdown = CancellationToken::new();

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        make_shutdown_future().await;
        info!("shutdown signal received");
        signal_token.cancel();
    });

    // A fatal sync outcome (version mismatch) surfaces here as an error, so
    // the process exits nonzero and the platform restarts it on a new build.
    agent.run(shutdown).await?;
    Ok(())
}

fn run_check(config: &NodeConfig) -> Result<()> {
    println!(
        "system:    {} (version {:?})",
        config.system.name, config.system.version
    );
    if config.heartbeat.authority_host.is_empty() {
        println!("heartbeat: authority unset, waits for a probe");
    } else {
        println!(
            "heartbeat: {}:{} every {}s",
            config.heartbeat.authority_host,
            config.heartbeat.authority_port,
            config.heartbeat.interval_secs
        );
    }
    match &config.handler {
        Some(h) => println!("handler:   '{}' at {}", h.name, h.base_url),
        None => println!("handler:   none ([handler] is required for serve)"),
    }

    for trigger in &config.triggers {
        match trigger {
            TriggerConfig::Timer { name, settings } => {
                let (_, granularity) = timer::compile(&settings.cron)
                    .with_context(|| format!("trigger '{name}'"))?;
                println!(
                    "  timer   {name:<20} cron=\"{}\" granularity={granularity}",
                    settings.cron
                );
            }
            TriggerConfig::Stream { name, settings } => {
                println!(
                    "  stream  {name:<20} stream={} subject={}",
                    settings.stream, settings.subject
                );
            }
        }
    }
    println!("{} trigger(s) OK", config.triggers.len());
    Ok(())
}

/// Initialize the tracing subscriber.
/// If `log_file` is set, logs go to both stdout and a daily-rolling file.
/// Returns a `WorkerGuard` that must stay alive for the process lifetime.
///
/// `log_format` may be `"pretty"` (human-readable compact format) or `"json"`
/// (structured JSON for log aggregators).
///
/// If the log directory cannot be created, falls back to stdout-only logging
/// with a warning. Never panics.
fn setup_logging(
    log_level: &str,
    log_file: Option<&std::path::Path>,
    log_format: &str,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let use_json = log_format == "json";

    if let Some(path) = log_file {
        let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let filename = path
            .file_name()
            .unwrap_or_else(|| std::ffi::OsStr::new("noded.log"));

        // Ensure the directory exists before tracing-appender tries to open it.
        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!(
                "warn: could not create log directory '{}': {e}, falling back to stdout",
                dir.display()
            );
            if use_json {
                tracing_subscriber::fmt()
                    .json()
                    .with_env_filter(log_level)
                    .init();
            } else {
                tracing_subscriber::fmt()
                    .with_env_filter(log_level)
                    .compact()
                    .init();
            }
            return None;
        }

        let appender = tracing_appender::rolling::daily(dir, filename);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);

        if use_json {
            tracing_subscriber::registry()
                .with(EnvFilter::new(log_level))
                .with(fmt::layer().json())
                .with(fmt::layer().json().with_writer(non_blocking))
                .init();
        } else {
            tracing_subscriber::registry()
                .with(EnvFilter::new(log_level))
                .with(fmt::layer().compact())
                .with(fmt::layer().with_writer(non_blocking))
                .init();
        }

        Some(guard)
    } else if use_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(log_level)
            .init();
        None
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(log_level)
            .compact()
            .init();
        None
    }
}

/// Returns a future that resolves when a shutdown signal is received.
///
/// On Unix we listen for SIGTERM *and* Ctrl-C.
/// On other platforms we listen for Ctrl-C only.
async fn make_shutdown_future() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}
