//! # dx-refine
//!
//! A Model Context Protocol (MCP) server that drives a diagnostic refinement
//! session against a remote diagnosis engine.
//!
//! ## Features
//!
//! - **Follow-up Rounds**: Up to three rounds of questions and answers; the
//!   last round always converges on one candidate
//! - **Rare-Disease Confirmation**: Symptom check, test selection and result
//!   submission per rare candidate
//! - **Final Diagnosis**: One final diagnosis per session with an
//!   append-only archive of every candidate it displaced
//! - **Persistence**: Sessions survive restarts as SQLite snapshots
//!
//! ## Architecture
//!
//! ```text
//! MCP Client → MCP Server (Rust) → Diagnosis engine (HTTP)
//!                    ↓
//!              SQLite (State)
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use dx_refine::{Config, AppState, McpServer};
//! use dx_refine::engine::HttpEngineClient;
//! use dx_refine::storage::SqliteStorage;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let storage = SqliteStorage::new(&config.database).await?;
//!     let engine = HttpEngineClient::new(&config.engine, config.request.clone())?;
//!     let state = Arc::new(AppState::new(config, storage, Arc::new(engine)));
//!     McpServer::new(state).run().await?;
//!     Ok(())
//! }
//! ```

/// Session inspection commands.
pub mod cli;
/// Configuration loaded from the environment.
pub mod config;
/// Diagnosis engine client and wire types.
pub mod engine;
/// Error types and result aliases for the application.
pub mod error;
/// MCP server implementation and request handling.
pub mod server;
/// Session operations behind the MCP tools.
pub mod service;
/// SQLite storage layer for persistence.
pub mod storage;
/// Follow-up rounds, rare-disease confirmation and final-diagnosis resolution.
pub mod workflow;

pub use config::Config;
pub use error::{AppError, AppResult};
pub use server::{AppState, McpServer, SharedState};
