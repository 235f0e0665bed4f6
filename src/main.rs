use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use dx_refine::{
    cli::{execute_command, SessionCommands},
    config::{Config, DatabaseConfig, LogFormat, LoggingConfig},
    engine::HttpEngineClient,
    server::{AppState, McpServer},
    storage::SqliteStorage,
};

/// Diagnostic refinement MCP server
#[derive(Parser, Debug)]
#[command(name = "dx-refine", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Serve MCP over stdio (default)
    Serve,

    /// Inspect persisted sessions
    #[command(subcommand)]
    Sessions(SessionCommands),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            // The server needs the full configuration, engine token included
            let config = match Config::from_env() {
                Ok(c) => c,
                Err(e) => {
                    eprintln!("Configuration error: {}", e);
                    std::process::exit(1);
                }
            };
            init_logging(&config.logging);

            let storage = open_storage(&config.database).await?;
            serve(config, storage).await
        }
        Command::Sessions(command) => {
            init_logging(&LoggingConfig::from_env());

            let storage = open_storage(&DatabaseConfig::from_env()).await?;
            let result = execute_command(command, &storage).await;
            if result.exit_code == 0 {
                println!("{}", result.message);
            } else {
                eprintln!("{}", result.message);
            }
            std::process::exit(result.exit_code);
        }
    }
}

async fn open_storage(database: &DatabaseConfig) -> anyhow::Result<SqliteStorage> {
    match SqliteStorage::new(database).await {
        Ok(s) => {
            info!(path = %database.path.display(), "Database initialized");
            Ok(s)
        }
        Err(e) => {
            error!(error = %e, "Failed to initialize database");
            Err(e.into())
        }
    }
}

async fn serve(config: Config, storage: SqliteStorage) -> anyhow::Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        "dx-refine server starting..."
    );

    // Initialize engine client
    let engine = match HttpEngineClient::new(&config.engine, config.request.clone()) {
        Ok(c) => {
            info!(base_url = %config.engine.base_url, "Engine client initialized");
            c
        }
        Err(e) => {
            error!(error = %e, "Failed to initialize engine client");
            return Err(e.into());
        }
    };

    // Create application state
    let state = Arc::new(AppState::new(config, storage, Arc::new(engine)));

    let shutdown = state.shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupt received, shutting down");
                shutdown.cancel();
            }
            Err(e) => warn!(error = %e, "Failed to listen for interrupt"),
        }
    });

    // Start MCP server
    let server = McpServer::new(state);

    info!("Server ready, waiting for requests on stdin...");

    if let Err(e) = server.run().await {
        error!(error = %e, "Server error");
        return Err(e.into());
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Initialize tracing/logging
fn init_logging(logging: &LoggingConfig) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    match logging.format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}
