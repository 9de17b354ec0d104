//! `tape-service` entry point.
//!
//! ## Modes
//!
//! - **`serve`** (default): open the store, bind the socket, answer requests
//!   until Ctrl+C or until `[service] idle_timeout_secs` pass with no client.
//! - **`ping`**: connect to a running service, send a `hello` handshake and
//!   report whether it answered.
//! - **`doctor`**: run the consistency checks directly against the database
//!   file (no service needed) and print the report as JSON.

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tape_service::engine::TapeEngine;
use tape_service::{PROTOCOL_VERSION, configured_socket_path, ipc};
use tape_store::{TapeConfig, TapeStore};

/// Poll interval for the idle timer.
const IDLE_POLL_INTERVAL_SECS: u64 = 10;

#[derive(Debug, Parser)]
#[command(name = "tape-service", version, about = "Tape store service")]
struct Cli {
    /// Config file (defaults to ~/.config/tape/tape.toml)
    #[arg(long, env = "TAPE_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Socket path override
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the service (default)
    Serve,
    /// Check that a running service answers the handshake
    Ping,
    /// Check database consistency without a running service
    Doctor {
        /// Rebuild derived state (the search index) when it drifted
        #[arg(long)]
        repair: bool,
    },
}

fn load_config(path: Option<&Path>) -> anyhow::Result<TapeConfig> {
    let cfg = match path {
        Some(path) => TapeConfig::load_from(path)?,
        None => TapeConfig::load()?,
    };
    Ok(cfg)
}

/// Install the global subscriber. Logs go to stderr so `doctor` output on
/// stdout stays machine readable. Returns false if one was already set.
fn init_tracing() -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init()
        .is_ok()
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();
    let cfg = load_config(cli.config.as_deref())?;
    let socket_path = cli
        .socket
        .unwrap_or_else(|| configured_socket_path(&cfg));

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => run_service(cfg, socket_path),
        Command::Ping => ping(&socket_path),
        Command::Doctor { repair } => doctor(cfg, repair),
    }
}

/// Connect to the service socket, send a hello handshake, verify the response.
fn ping(path: &Path) -> anyhow::Result<()> {
    let mut stream = std::os::unix::net::UnixStream::connect(path)
        .with_context(|| format!("ping: cannot connect to {}", path.display()))?;
    stream.set_read_timeout(Some(Duration::from_secs(10)))?;
    stream.set_write_timeout(Some(Duration::from_secs(5)))?;

    let hello = serde_json::json!({
        "id": 0,
        "method": "hello",
        "params": {
            "protocol_version": PROTOCOL_VERSION,
            "client_version": env!("CARGO_PKG_VERSION"),
        }
    });
    let mut bytes = serde_json::to_vec(&hello)?;
    bytes.push(b'\n');
    stream.write_all(&bytes)?;
    stream.flush()?;

    let mut reader = std::io::BufReader::new(&stream);
    let mut line = String::new();
    reader.read_line(&mut line)?;

    let resp: serde_json::Value =
        serde_json::from_str(line.trim()).context("ping: invalid response JSON")?;
    if resp.get("result").is_some() {
        eprintln!("ping: service is alive");
        Ok(())
    } else {
        let msg = resp
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|m| m.as_str())
            .unwrap_or("unknown error");
        anyhow::bail!("ping: hello failed: {msg}")
    }
}

fn doctor(cfg: TapeConfig, repair: bool) -> anyhow::Result<()> {
    let store = TapeStore::open(cfg).context("failed to open tape store")?;
    let report = store.doctor(repair)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.is_healthy() {
        anyhow::bail!("doctor found problems");
    }
    Ok(())
}

#[tokio::main]
async fn run_service(cfg: TapeConfig, socket_path: PathBuf) -> anyhow::Result<()> {
    tracing::info!("tape-service v{} starting", env!("CARGO_PKG_VERSION"));

    let idle_timeout_secs = cfg.service.idle_timeout_secs;
    let store = tokio::task::spawn_blocking(move || TapeStore::open(cfg))
        .await?
        .context("failed to open tape store")?;
    let engine = Arc::new(TapeEngine::new(store));

    let listener = ipc::bind(&socket_path)
        .with_context(|| format!("failed to bind {}", socket_path.display()))?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let shutdown_tx_signal = shutdown_tx.clone();
    let engine_signal = Arc::clone(&engine);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!(
            "Signal received, shutting down (open connections: {})",
            engine_signal.connection_count()
        );
        let _ = shutdown_tx_signal.send(true);
    });

    if idle_timeout_secs > 0 {
        let engine_idle = Arc::clone(&engine);
        tokio::spawn(async move {
            let poll_interval = Duration::from_secs(IDLE_POLL_INTERVAL_SECS.min(idle_timeout_secs));
            let idle_timeout = Duration::from_secs(idle_timeout_secs);
            loop {
                tokio::time::sleep(poll_interval).await;

                let connections = engine_idle.connection_count();
                let elapsed = engine_idle.last_activity_elapsed().await;
                if connections == 0 && elapsed >= idle_timeout {
                    tracing::info!("Idle timeout ({idle_timeout_secs}s): no connections. Exiting.");
                    let _ = shutdown_tx.send(true);
                    break;
                }
            }
        });
    }

    ipc::serve(engine, listener, shutdown_rx).await?;

    if let Err(e) = std::fs::remove_file(&socket_path) {
        tracing::warn!("Failed to remove {}: {e}", socket_path.display());
    }
    tracing::info!("tape-service exiting cleanly");
    Ok(())
}
