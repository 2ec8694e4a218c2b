//! lap-board: a lap timing server for kart races
//!
//! Timing stations report line crossings per kart; the server turns them
//! into best and average lap times and answers every request with the
//! full scoreboard.
//!
//! Features:
//! - Single-crossing and batch registration over a compact binary protocol
//! - One request/response cycle per connection
//! - Timing file import (`kart,HH:MM:SS` per line)
//! - Configuration via CLI arguments or TOML file

mod board;
mod client;
mod config;
mod protocol;
mod race;
mod server;
mod timing_file;

use client::ScoresClient;
use config::{Command, Config};
use race::ScoreEntry;
use server::Server;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

fn main() -> Result<(), BoxError> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let mut runtime = tokio::runtime::Builder::new_multi_thread();
    if let Some(workers) = config.workers.filter(|&w| w > 0) {
        runtime.worker_threads(workers);
    }
    let runtime = runtime.enable_all().build()?;

    runtime.block_on(async move {
        match config.command.clone() {
            Command::Serve => run_server(config).await,
            Command::Send { kart, timestamp } => {
                let timestamp = timestamp.unwrap_or_else(|| chrono::Utc::now().timestamp_millis());
                let result = scores_client(&config).send_measurement(kart, timestamp).await;
                report(result);
                Ok(())
            }
            Command::Import { file } => {
                let result = scores_client(&config).import_file(&file).await;
                report(result);
                Ok(())
            }
        }
    })
}

/// Run the lap server until the process is stopped
async fn run_server(config: Config) -> Result<(), BoxError> {
    info!(
        listen = %config.listen,
        workers = ?config.workers,
        max_connections = config.max_connections,
        ordering = ?config.ordering,
        "Starting lap-board server"
    );

    // Failing to bind ends the process
    Server::new(config).run().await
}

fn scores_client(config: &Config) -> ScoresClient {
    ScoresClient::new(config.listen.clone(), config.connect_timeout)
}

/// Print the ranked scoreboard, or log why there is none
fn report(result: Result<Vec<ScoreEntry>, client::ClientError>) {
    match result {
        Ok(entries) => print!("{}", board::render(&board::standings(entries))),
        Err(e) => warn!(error = %e, "Request failed"),
    }
}
