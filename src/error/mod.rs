use thiserror::Error;

/// Application-level errors
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("MCP protocol error: {0}")]
    Mcp(#[from] McpError),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Storage layer errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database connection failed: {message}")]
    Connection { message: String },

    #[error("Query failed: {message}")]
    Query { message: String },

    #[error("Session not found: {session_id}")]
    SessionNotFound { session_id: String },

    #[error("Migration failed: {message}")]
    Migration { message: String },

    #[error("Snapshot encoding failed: {0}")]
    Snapshot(#[from] serde_json::Error),

    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

/// Diagnosis engine errors.
///
/// Everything except `MalformedResponse` is a transport failure: the user
/// is told and may resubmit by hand.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("Malformed engine response: {message}")]
    MalformedResponse { message: String },

    #[error("Request timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Request cancelled")]
    Cancelled,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl EngineError {
    /// True for failures reaching the engine, as opposed to bad payloads.
    pub fn is_transport(&self) -> bool {
        !matches!(self, EngineError::MalformedResponse { .. })
    }
}

/// Workflow state-machine errors
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Validation failed: {field} - {reason}")]
    Validation { field: String, reason: String },

    #[error("No follow-up round is on offer: {reason}")]
    RoundNotOffered { reason: String },

    #[error("Final follow-up round failed and has no diagnosis; retry the final round")]
    Stuck,

    #[error("Unknown rare candidate: {candidate}")]
    UnknownRareCandidate { candidate: String },

    #[error("Symptom presence already recorded for {candidate}")]
    SymptomAlreadyRecorded { candidate: String },

    #[error("Cannot {action} while {candidate} is {stage}")]
    InvalidTransition {
        candidate: String,
        action: String,
        stage: String,
    },

    #[error("Engine call failed: {0}")]
    Engine(#[from] EngineError),
}

/// MCP protocol errors
#[derive(Debug, Error)]
pub enum McpError {
    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Unknown tool: {tool_name}")]
    UnknownTool { tool_name: String },

    #[error("Invalid parameters for {tool_name}: {message}")]
    InvalidParameters { tool_name: String, message: String },

    #[error("Tool execution failed: {message}")]
    ExecutionFailed { message: String },

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<AppError> for McpError {
    fn from(err: AppError) -> Self {
        McpError::ExecutionFailed {
            message: err.to_string(),
        }
    }
}

/// Result type alias for application errors
pub type AppResult<T> = Result<T, AppError>;

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Result type alias for workflow operations
pub type WorkflowResult<T> = Result<T, WorkflowError>;

/// Result type alias for MCP operations
pub type McpResult<T> = Result<T, McpError>;
