use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use tracing::{debug, info};

use super::{Invocation, SessionRecord, Storage};
use crate::config::DatabaseConfig;
use crate::error::{StorageError, StorageResult};
use crate::workflow::ArchivedDiagnosis;

/// Static migrator that embeds migrations at compile time
static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// SQLite-backed storage implementation
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Create a new SQLite storage instance
    pub async fn new(config: &DatabaseConfig) -> StorageResult<Self> {
        // Ensure parent directory exists
        if let Some(parent) = config.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Connection {
                message: format!("Failed to create database directory: {}", e),
            })?;
        }

        let database_url = format!("sqlite://{}?mode=rwc", config.path.display());

        let options = SqliteConnectOptions::from_str(&database_url)
            .map_err(|e| StorageError::Connection {
                message: format!("Invalid database URL: {}", e),
            })?
            .create_if_missing(true);

        Self::connect(options, config.max_connections).await
    }

    /// In-memory database, one connection so every query sees the same data
    pub async fn new_in_memory() -> StorageResult<Self> {
        let options =
            SqliteConnectOptions::from_str("sqlite::memory:").map_err(|e| {
                StorageError::Connection {
                    message: format!("Invalid database URL: {}", e),
                }
            })?;

        Self::connect(options, 1).await
    }

    async fn connect(options: SqliteConnectOptions, max_connections: u32) -> StorageResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to connect to database: {}", e),
            })?;

        let storage = Self { pool };
        storage.run_migrations().await?;

        Ok(storage)
    }

    /// Run database migrations using embedded sqlx migrations
    async fn run_migrations(&self) -> StorageResult<()> {
        info!("Running database migrations...");

        MIGRATOR.run(&self.pool).await.map_err(|e| StorageError::Migration {
            message: format!("Failed to run migrations: {}", e),
        })?;

        info!("Database migrations completed successfully");
        Ok(())
    }

    /// Get the underlying pool for advanced queries
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn save_session(&self, session: &SessionRecord) -> StorageResult<()> {
        let mut conn = self.pool.acquire().await?;
        upsert_session(&mut *conn, session).await?;

        debug!(session_id = %session.id, phase = %session.phase, "Session saved");
        Ok(())
    }

    async fn get_session(&self, id: &str) -> StorageResult<Option<SessionRecord>> {
        let row: Option<SessionRow> = sqlx::query_as(
            r#"
            SELECT id, conversation_id, phase, round_index, final_diagnosis, snapshot, created_at, updated_at
            FROM sessions
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(SessionRecord::try_from).transpose()
    }

    async fn list_sessions(&self, limit: u32) -> StorageResult<Vec<SessionRecord>> {
        let rows: Vec<SessionRow> = sqlx::query_as(
            r#"
            SELECT id, conversation_id, phase, round_index, final_diagnosis, snapshot, created_at, updated_at
            FROM sessions
            ORDER BY updated_at DESC
            LIMIT ?
            "#,
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(SessionRecord::try_from).collect()
    }

    async fn append_archive(
        &self,
        session_id: &str,
        entries: &[ArchivedDiagnosis],
    ) -> StorageResult<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        insert_archive_entries(&mut *tx, session_id, entries).await?;
        tx.commit().await?;

        info!(session_id = %session_id, count = entries.len(), "Archived diagnoses");
        Ok(())
    }

    async fn save_session_with_archive(
        &self,
        session: &SessionRecord,
        entries: &[ArchivedDiagnosis],
    ) -> StorageResult<()> {
        let mut tx = self.pool.begin().await?;
        upsert_session(&mut *tx, session).await?;
        insert_archive_entries(&mut *tx, &session.id, entries).await?;
        tx.commit().await?;

        debug!(
            session_id = %session.id,
            phase = %session.phase,
            archived = entries.len(),
            "Session saved with archive"
        );
        Ok(())
    }

    async fn get_archive(&self, session_id: &str) -> StorageResult<Vec<ArchivedDiagnosis>> {
        let rows: Vec<ArchiveRow> = sqlx::query_as(
            r#"
            SELECT diagnosis, treatment, probability, archived_at, reason
            FROM archived_diagnoses
            WHERE session_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }

    async fn log_invocation(&self, invocation: &Invocation) -> StorageResult<()> {
        let input = serde_json::to_string(&invocation.input)?;
        let output = invocation
            .output
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO invocations (id, session_id, tool_name, input, output, endpoint, latency_ms, success, error, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&invocation.id)
        .bind(&invocation.session_id)
        .bind(&invocation.tool_name)
        .bind(&input)
        .bind(&output)
        .bind(&invocation.endpoint)
        .bind(invocation.latency_ms)
        .bind(invocation.success)
        .bind(&invocation.error)
        .bind(invocation.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_session_invocations(&self, session_id: &str) -> StorageResult<Vec<Invocation>> {
        let rows: Vec<InvocationRow> = sqlx::query_as(
            r#"
            SELECT id, session_id, tool_name, input, output, endpoint, latency_ms, success, error, created_at
            FROM invocations
            WHERE session_id = ?
            ORDER BY created_at ASC
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }
}

async fn upsert_session(conn: &mut SqliteConnection, session: &SessionRecord) -> StorageResult<()> {
    let snapshot = serde_json::to_string(&session.snapshot)?;

    sqlx::query(
        r#"
        INSERT INTO sessions (id, conversation_id, phase, round_index, final_diagnosis, snapshot, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            conversation_id = excluded.conversation_id,
            phase = excluded.phase,
            round_index = excluded.round_index,
            final_diagnosis = excluded.final_diagnosis,
            snapshot = excluded.snapshot,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&session.id)
    .bind(session.conversation_id)
    .bind(&session.phase)
    .bind(session.round_index)
    .bind(&session.final_diagnosis)
    .bind(&snapshot)
    .bind(session.created_at.to_rfc3339())
    .bind(session.updated_at.to_rfc3339())
    .execute(&mut *conn)
    .await?;

    Ok(())
}

async fn insert_archive_entries(
    conn: &mut SqliteConnection,
    session_id: &str,
    entries: &[ArchivedDiagnosis],
) -> StorageResult<()> {
    for entry in entries {
        sqlx::query(
            r#"
            INSERT INTO archived_diagnoses (session_id, diagnosis, treatment, probability, archived_at, reason)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(session_id)
        .bind(&entry.diagnosis)
        .bind(&entry.treatment)
        .bind(&entry.probability)
        .bind(entry.archived_at_epoch_seconds)
        .bind(&entry.reason)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

fn parse_timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

// Internal row types for SQLx mapping
#[derive(sqlx::FromRow)]
struct SessionRow {
    id: String,
    conversation_id: Option<i64>,
    phase: String,
    round_index: i64,
    final_diagnosis: Option<String>,
    snapshot: String,
    created_at: String,
    updated_at: String,
}

impl TryFrom<SessionRow> for SessionRecord {
    type Error = StorageError;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        Ok(Self {
            snapshot: serde_json::from_str(&row.snapshot)?,
            id: row.id,
            conversation_id: row.conversation_id,
            phase: row.phase,
            round_index: row.round_index,
            final_diagnosis: row.final_diagnosis,
            created_at: parse_timestamp(&row.created_at),
            updated_at: parse_timestamp(&row.updated_at),
        })
    }
}

#[derive(sqlx::FromRow)]
struct ArchiveRow {
    diagnosis: String,
    treatment: String,
    probability: String,
    archived_at: i64,
    reason: String,
}

impl From<ArchiveRow> for ArchivedDiagnosis {
    fn from(row: ArchiveRow) -> Self {
        Self {
            diagnosis: row.diagnosis,
            treatment: row.treatment,
            probability: row.probability,
            archived_at_epoch_seconds: row.archived_at,
            reason: row.reason,
        }
    }
}

#[derive(sqlx::FromRow)]
struct InvocationRow {
    id: String,
    session_id: Option<String>,
    tool_name: String,
    input: String,
    output: Option<String>,
    endpoint: Option<String>,
    latency_ms: Option<i64>,
    success: bool,
    error: Option<String>,
    created_at: String,
}

impl From<InvocationRow> for Invocation {
    fn from(row: InvocationRow) -> Self {
        Self {
            id: row.id,
            session_id: row.session_id,
            tool_name: row.tool_name,
            input: serde_json::from_str(&row.input).unwrap_or_default(),
            output: row.output.and_then(|s| serde_json::from_str(&s).ok()),
            endpoint: row.endpoint,
            latency_ms: row.latency_ms,
            success: row.success,
            error: row.error,
            created_at: parse_timestamp(&row.created_at),
        }
    }
}
