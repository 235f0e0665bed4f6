//! Storage layer for diagnosis session persistence.
//!
//! This module provides SQLite-based storage for workflow snapshots, the
//! append-only archive ledger and the engine invocation log.

mod sqlite;


pub use sqlite::SqliteStorage;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StorageResult;
use crate::workflow::{ArchivedDiagnosis, DiagnosisWorkflow};

/// A persisted diagnosis session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Session identifier (same as the workflow's session id).
    pub id: String,
    /// Engine-side conversation id, once known.
    pub conversation_id: Option<i64>,
    /// Round phase at save time, for listing without decoding the snapshot.
    pub phase: String,
    /// Completed follow-up rounds at save time.
    pub round_index: i64,
    /// Final diagnosis name, if one was reached.
    pub final_diagnosis: Option<String>,
    /// Full workflow state.
    pub snapshot: serde_json::Value,
    /// When the session was created.
    pub created_at: DateTime<Utc>,
    /// When the session was last saved.
    pub updated_at: DateTime<Utc>,
}

impl SessionRecord {
    /// Capture the current state of a workflow
    pub fn from_workflow(workflow: &DiagnosisWorkflow) -> StorageResult<Self> {
        let now = Utc::now();
        Ok(Self {
            id: workflow.session_id().to_string(),
            conversation_id: workflow.context().conversation_id,
            phase: workflow.rounds().phase().to_string(),
            round_index: i64::from(workflow.rounds().round_index()),
            final_diagnosis: workflow.final_diagnosis().map(|c| c.diagnosis.clone()),
            snapshot: serde_json::to_value(workflow)?,
            created_at: now,
            updated_at: now,
        })
    }

    /// Restore the workflow from its snapshot
    pub fn to_workflow(&self) -> StorageResult<DiagnosisWorkflow> {
        Ok(serde_json::from_value(self.snapshot.clone())?)
    }
}

/// Invocation log entry for debugging and tracing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invocation {
    /// Unique invocation identifier.
    pub id: String,
    /// Optional parent session ID.
    pub session_id: Option<String>,
    /// Name of the MCP tool invoked.
    pub tool_name: String,
    /// Input parameters as JSON.
    pub input: serde_json::Value,
    /// Output result as JSON (if successful).
    pub output: Option<serde_json::Value>,
    /// Engine endpoint called, if any.
    pub endpoint: Option<String>,
    /// Latency in milliseconds.
    pub latency_ms: Option<i64>,
    /// Whether the invocation succeeded.
    pub success: bool,
    /// Error message (if failed).
    pub error: Option<String>,
    /// When the invocation occurred.
    pub created_at: DateTime<Utc>,
}

impl Invocation {
    /// Create a new invocation log entry
    pub fn new(tool_name: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: None,
            tool_name: tool_name.into(),
            input,
            output: None,
            endpoint: None,
            latency_ms: None,
            success: true,
            error: None,
            created_at: Utc::now(),
        }
    }

    /// Set the session ID
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Set the engine endpoint
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Mark as successful with output
    pub fn success(mut self, output: serde_json::Value, latency_ms: i64) -> Self {
        self.success = true;
        self.output = Some(output);
        self.latency_ms = Some(latency_ms);
        self
    }

    /// Mark as failed with error
    pub fn failure(mut self, error: impl Into<String>, latency_ms: i64) -> Self {
        self.success = false;
        self.error = Some(error.into());
        self.latency_ms = Some(latency_ms);
        self
    }
}

/// Storage trait for database operations.
///
/// The archive has no update or delete operation.
#[async_trait]
pub trait Storage: Send + Sync {
    // Session operations

    /// Insert or replace a session snapshot. `created_at` of an existing
    /// session is kept.
    async fn save_session(&self, session: &SessionRecord) -> StorageResult<()>;
    /// Get a session by ID.
    async fn get_session(&self, id: &str) -> StorageResult<Option<SessionRecord>>;
    /// Most recently updated sessions first.
    async fn list_sessions(&self, limit: u32) -> StorageResult<Vec<SessionRecord>>;

    // Archive ledger

    /// Append archived diagnoses for a session.
    async fn append_archive(
        &self,
        session_id: &str,
        entries: &[ArchivedDiagnosis],
    ) -> StorageResult<()>;
    /// Save a session snapshot and append its newly archived diagnoses in
    /// one transaction. Neither write lands if the other fails.
    async fn save_session_with_archive(
        &self,
        session: &SessionRecord,
        entries: &[ArchivedDiagnosis],
    ) -> StorageResult<()>;
    /// Archived diagnoses for a session in the order they were filed.
    async fn get_archive(&self, session_id: &str) -> StorageResult<Vec<ArchivedDiagnosis>>;

    // Invocation logging

    /// Log a tool invocation.
    async fn log_invocation(&self, invocation: &Invocation) -> StorageResult<()>;
    /// Invocations for a session, oldest first.
    async fn get_session_invocations(&self, session_id: &str) -> StorageResult<Vec<Invocation>>;
}
