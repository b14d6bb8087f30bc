// MIT License - Copyright (c) 2026 Peter Wright
// MQTT bridge

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use tuya_bridge::config::{self, DEFAULT_DEVICES_FILE, DEFAULT_SETTINGS_FILE};
use tuya_bridge::{BridgeRunner, ConfigError, Registry, Settings, TcpConnectionFactory};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser)]
#[command(name = "tuya2mqtt")]
#[command(about = "Bridge between smart-device sessions and MQTT")]
struct Cli {
    /// Path to the TOML settings file [default: tuya2mqtt.toml in the
    /// working directory, then next to the executable]
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Path to the JSON device inventory [default: devices.json, searched
    /// like the settings file]
    #[arg(long)]
    devices: Option<PathBuf>,

    /// Detach from the terminal and run in the background
    #[arg(short, long)]
    daemon: bool,

    /// Debug logging (RUST_LOG takes precedence)
    #[arg(short, long)]
    verbose: bool,
}

// ---------------------------------------------------------------------------
// Startup
// ---------------------------------------------------------------------------

fn init_tracing(verbose: bool) {
    // RUST_LOG controls verbosity (e.g. RUST_LOG=tuya_bridge=trace).
    let default_level = if verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    // systemd journal already adds timestamps, so omit them when running under systemd
    if std::env::var_os("JOURNAL_STREAM").is_some() {
        tracing_subscriber::fmt().without_time().with_env_filter(env_filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }
}

fn load_config(cli: &Cli) -> Result<(Settings, Registry), ConfigError> {
    let search_dirs = config::default_search_dirs();

    let settings_path = config::locate(cli.config.as_deref(), DEFAULT_SETTINGS_FILE, &search_dirs)?;
    let devices_path = config::locate(cli.devices.as_deref(), DEFAULT_DEVICES_FILE, &search_dirs)?;
    info!(
        "Using settings {} and devices {}",
        settings_path.display(),
        devices_path.display()
    );

    let inventory = config::load_inventory(&devices_path)?;
    let registry = Registry::from_inventory(inventory)?;
    let settings = config::load_settings(&settings_path)?;
    Ok((settings, registry))
}

/// Fork into the background, start a new session and move to /var/tmp.
///
/// Must run before the tokio runtime (or any other thread) exists.
#[cfg(unix)]
fn daemonize() -> Result<()> {
    // SAFETY: single-threaded at this point; the child continues with a copy
    // of this process and the parent exits without touching shared state.
    match unsafe { libc::fork() } {
        -1 => return Err(std::io::Error::last_os_error()).context("fork failed"),
        0 => {}
        _ => std::process::exit(0),
    }
    // SAFETY: plain syscall with no arguments.
    if unsafe { libc::setsid() } == -1 {
        return Err(std::io::Error::last_os_error()).context("setsid failed");
    }
    std::env::set_current_dir("/var/tmp").context("Failed to change directory to /var/tmp")?;
    Ok(())
}

#[cfg(not(unix))]
fn daemonize() -> Result<()> {
    anyhow::bail!("--daemon is only supported on unix")
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let (settings, registry) = match load_config(&cli) {
        Ok(loaded) => loaded,
        Err(e) => {
            error!("{e}");
            std::process::exit(e.exit_code());
        }
    };
    info!(
        "Loaded {} devices ({} behind gateways)",
        registry.len(),
        registry.names().len()
    );

    if cli.daemon {
        daemonize()?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start tokio runtime")?;
    runtime.block_on(run(settings, registry))
}

async fn run(settings: Settings, registry: Registry) -> Result<()> {
    let cancel = CancellationToken::new();
    let factory = TcpConnectionFactory {
        response_timeout: settings.bridge.response_timeout(),
        ..TcpConnectionFactory::default()
    };
    let runner = BridgeRunner::new(registry, settings, Arc::new(factory), cancel.clone());

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut devices = tokio::spawn(runner.run());

    info!("Bridge running. Send SIGINT/SIGTERM to stop.");
    let finished = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT, shutting down...");
            None
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down...");
            None
        }
        joined = &mut devices => Some(joined?),
    };
    let failed = match finished {
        Some(failed) => failed,
        None => {
            cancel.cancel();
            devices.await?
        }
    };

    if failed > 0 {
        warn!("{failed} device loop(s) ended with an error");
    }
    info!("Shutdown complete");
    Ok(())
}
