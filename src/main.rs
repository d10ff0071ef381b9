#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # hydra-agent
//!
//! Relay agent: keeps an outbound Socket.IO connection to a command endpoint,
//! authenticates with a shared token, forwards each inbound command to a
//! local HTTP service and returns the result over the same connection.
//!
//! ## Subcommands
//!
//! - `hydra-agent run` (default): connect and relay until told to stop
//! - `hydra-agent check-config`: validate configuration and print the endpoint
//!
//! ## Events
//!
//! | Direction | Event        | Payload                                   |
//! |-----------|--------------|-------------------------------------------|
//! | in        | `welcome`    | free-form; starts the handshake           |
//! | out       | `register`   | `{id, token}`                             |
//! | in        | `registered` | `{sid}`                                   |
//! | out       | `ping`       | `""`                                      |
//! | in        | `predict`    | `{id, timestamp, data}`                   |
//! | out       | `predicted`  | `{id, success, data}`                     |
//! | in        | `handle`     | `{id, timestamp, method, path, data}`     |
//! | out       | `response`   | `{id, success, data, header}`             |
//!
//! ## Exit codes
//!
//! - `0`: SIGINT / SIGTERM
//! - `1`: protocol error reported by the remote side
//! - `2`: invalid configuration or startup failure

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use hydra_agent::{tunnel, AgentState, Config, ExitReason};

/// Relay agent bridging remote commands to a local HTTP service.
#[derive(Parser)]
#[command(name = "hydra-agent", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to TOML config file (used when no subcommand is given).
    #[arg(long, global = true)]
    config: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and relay commands (default when no subcommand given).
    Run,
    /// Validate the configuration and print the resolved endpoint.
    CheckConfig,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("hydra-agent: {e}");
            std::process::exit(2);
        }
    };

    match cli.command.unwrap_or(Commands::Run) {
        Commands::CheckConfig => check_config(&config),
        Commands::Run => {
            let code = run_agent(config).await;
            std::process::exit(code);
        }
    }
}

fn check_config(config: &Config) {
    println!("configuration OK");
    println!("  endpoint:  {}", config.remote.ws_url());
    println!("  predict:   POST {}", config.forward.post_url);
    println!("  handle:    {}<path>", config.forward.base_url);
    println!("  identity:  {:?}", config.auth.identity);
    println!("  ready on:  {:?}", config.auth.ready_event);
    println!("  ping:      {}ms", config.keepalive.ping_frequency_ms);
}

async fn run_agent(config: Config) -> i32 {
    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("hydra-agent v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Command endpoint: {}", config.remote.ws_url());
    if config.auth.token.is_empty() {
        warn!("No shared token configured: set HYDRA_TOKEN or [auth] token");
    }

    let state = match AgentState::new(config) {
        Ok(s) => s,
        Err(e) => {
            error!("Startup failed: {e}");
            return 2;
        }
    };

    let manager = tunnel::client::spawn(state.clone());

    let reason = tokio::select! {
        reason = state.exit.wait() => reason,
        () = shutdown_signal() => {
            state.exit.trigger(ExitReason::Shutdown);
            state.exit.wait().await
        }
    };

    info!("Exiting: {reason}");
    if let Err(e) = manager.await {
        warn!("Connection manager ended abnormally: {e}");
    }
    let stats = state.stats.snapshot();
    info!(
        uptime_s = state.start_time.elapsed().as_secs(),
        attempts = stats.attempts,
        commands = stats.commands_received,
        responses = stats.responses_sent,
        "Goodbye"
    );
    reason.exit_code()
}

/// Resolves on SIGINT, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Cannot listen for SIGINT: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    () = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {e}");
                ctrl_c.await;
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await;
        info!("Received SIGINT");
    }
}
