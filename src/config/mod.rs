use std::env;
use std::path::PathBuf;

use crate::error::AppError;

/// Upper bound on follow-up rounds; the round counter never exceeds it.
pub const MAX_FOLLOW_UP_ROUNDS: u32 = 3;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub engine: EngineConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub request: RequestConfig,
    pub workflow: WorkflowConfig,
}

/// Diagnosis engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub api_token: String,
    pub base_url: String,
    /// Model override forwarded to the engine as `openaiConfig`.
    pub model_override: Option<ModelOverride>,
}

/// Per-deployment model selection passed through to the engine
#[derive(Debug, Clone, PartialEq)]
pub struct ModelOverride {
    pub api_key: String,
    pub model: String,
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub max_connections: u32,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Log output format
#[derive(Debug, Clone, PartialEq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// HTTP request configuration.
///
/// No retry budget: engine failures go back to the user.
#[derive(Debug, Clone)]
pub struct RequestConfig {
    pub timeout_ms: u64,
}

/// Workflow tuning
#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    pub max_rounds: u32,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, AppError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let model_override = match (env::var("ENGINE_MODEL"), env::var("ENGINE_MODEL_API_KEY")) {
            (Ok(model), Ok(api_key)) if !model.trim().is_empty() => Some(ModelOverride {
                api_key,
                model: model.trim().to_string(),
            }),
            _ => None,
        };

        let engine = EngineConfig {
            api_token: env::var("ENGINE_API_TOKEN").map_err(|_| AppError::Config {
                message: "ENGINE_API_TOKEN is required".to_string(),
            })?,
            base_url: env::var("ENGINE_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:8080".to_string()),
            model_override,
        };

        let database = DatabaseConfig::from_env();
        let logging = LoggingConfig::from_env();

        let request = RequestConfig {
            timeout_ms: env::var("REQUEST_TIMEOUT_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(30000),
        };

        let workflow = WorkflowConfig {
            max_rounds: env::var("MAX_FOLLOW_UP_ROUNDS")
                .ok()
                .and_then(|s| s.parse::<u32>().ok())
                .map(|n| n.clamp(1, MAX_FOLLOW_UP_ROUNDS))
                .unwrap_or(MAX_FOLLOW_UP_ROUNDS),
        };

        Ok(Config {
            engine,
            database,
            logging,
            request,
            workflow,
        })
    }
}

impl DatabaseConfig {
    /// Database settings alone; needs no engine credentials
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        Self {
            path: PathBuf::from(
                env::var("DATABASE_PATH").unwrap_or_else(|_| "./data/dx-refine.db".to_string()),
            ),
            max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(5),
        }
    }
}

impl LoggingConfig {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        Self {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            format: match env::var("LOG_FORMAT")
                .unwrap_or_else(|_| "pretty".to_string())
                .to_lowercase()
                .as_str()
            {
                "json" => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
        }
    }
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self { timeout_ms: 30000 }
    }
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_rounds: MAX_FOLLOW_UP_ROUNDS,
        }
    }
}
