//! `pgnhub` – PGN telemetry hub.
//!
//! This binary wires the stack together and keeps it running:
//!
//! 1. Initialises `tracing` (`RUST_LOG`, `PGNHUB_LOG_FORMAT=json`, optional
//!    OTLP export via `OTEL_EXPORTER_OTLP_ENDPOINT`).
//! 2. Opens the configuration document and the recordings directory (see
//!    [`config::Bootstrap`] for the environment overrides).
//! 3. Spawns the session, which resumes the persisted active connection.
//! 4. Serves the REST API and the real-time WebSocket until **Ctrl-C**, then
//!    stops any recording and disconnects before exiting.

mod config;

use std::process::ExitCode;

use colored::Colorize;
use pgnhub_cockpit::CockpitServer;
use pgnhub_middleware::BroadcastHub;
use pgnhub_recorder::Recorder;
use pgnhub_runtime::{ProfileStore, Session, TelemetryConfig, init_tracing};
use pgnhub_types::HubError;
use tracing::{info, warn};

use crate::config::Bootstrap;

#[tokio::main]
async fn main() -> ExitCode {
    let _telemetry = init_tracing(&TelemetryConfig::from_env("pgnhub"));

    print_banner();

    match run(Bootstrap::from_env()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}: {e}", "pgnhub failed".red().bold());
            ExitCode::FAILURE
        }
    }
}

async fn run(boot: Bootstrap) -> Result<(), HubError> {
    let store = ProfileStore::open(&boot.config_path)?;
    let port = boot.port_override.unwrap_or(store.config().server.port);
    let active = store.active_id().map(str::to_string);

    std::fs::create_dir_all(&boot.recordings_dir)?;
    let recorder = Recorder::new(boot.recordings_dir.clone());

    println!(
        "  Config     {}",
        boot.config_path.display().to_string().bold()
    );
    println!(
        "  Recordings {}",
        boot.recordings_dir.display().to_string().bold()
    );
    match &active {
        Some(id) => println!("  Resuming   {}", id.green()),
        None => println!("  {}", "No active connection".dimmed()),
    }
    println!("  Listening  {}", format!("http://0.0.0.0:{port}").cyan());
    println!();

    let handle = Session::new(store, recorder, BroadcastHub::default()).spawn();
    let server = CockpitServer::new(handle.clone()).with_port(port);

    let serve = server.run();
    tokio::pin!(serve);
    tokio::select! {
        result = &mut serve => result?,
        signal = tokio::signal::ctrl_c() => match signal {
            Ok(()) => {
                println!();
                println!("{}", "⚠  Ctrl-C received – shutting down …".yellow().bold());
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for Ctrl-C; serving until the listener stops");
                serve.await?;
            }
        }
    }

    handle.shutdown().await?;
    info!("pgnhub stopped");
    println!("{}", "  ✓ Session closed.".green());
    Ok(())
}

fn print_banner() {
    println!();
    println!("{}", r#"                    __          __ "#.bold().cyan());
    println!("{}", r#"   ___  ___ ____   / /  __ __  / / "#.bold().cyan());
    println!("{}", r#"  / _ \/ _ `/ _ \ / _ \/ // / / _ \"#.bold().cyan());
    println!("{}", r#" / .__/\_, /_//_//_//_/\_,_/ /_.__/"#.bold().cyan());
    println!("{}", r#"/_/   /___/                        "#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "pgnhub".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Marine PGN telemetry hub");
    println!();
}
