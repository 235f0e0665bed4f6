//! Server module for MCP protocol handling.
//!
//! This module provides:
//! - MCP server implementation over stdio
//! - Tool call handlers and routing
//! - Shared application state management

mod handlers;
mod mcp;

pub use handlers::*;
pub use mcp::*;

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::engine::EngineClient;
use crate::service::DiagnosisService;
use crate::storage::SqliteStorage;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Config,
    /// SQLite storage backend.
    pub storage: SqliteStorage,
    /// Diagnosis session operations.
    pub diagnosis: DiagnosisService,
    /// Cancelled on shutdown; aborts in-flight engine calls.
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Create new application state
    pub fn new(config: Config, storage: SqliteStorage, engine: Arc<dyn EngineClient>) -> Self {
        let shutdown = CancellationToken::new();
        let diagnosis = DiagnosisService::new(storage.clone(), engine, &config, shutdown.clone());

        tracing::info!(
            engine_url = %config.engine.base_url,
            max_rounds = config.workflow.max_rounds,
            model_override = config.engine.model_override.is_some(),
            "AppState initialized"
        );

        Self {
            config,
            storage,
            diagnosis,
            shutdown,
        }
    }
}

/// Shared application state handle
pub type SharedState = Arc<AppState>;
