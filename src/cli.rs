//! CLI commands for inspecting persisted diagnosis sessions.
//!
//! These read the database directly and never call the engine.

use chrono::{DateTime, Utc};
use clap::Subcommand;

use crate::storage::{SessionRecord, SqliteStorage, Storage};
use crate::workflow::ArchivedDiagnosis;

/// Session inspection subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum SessionCommands {
    /// List recently updated sessions
    List {
        /// Maximum number of sessions to show
        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// Show the current status of a session
    Show {
        /// Session ID
        session_id: String,
    },

    /// Show the final diagnosis and archive ledger of a session
    Archive {
        /// Session ID
        session_id: String,

        /// Print the ledger as JSON
        #[arg(long)]
        json: bool,
    },
}

/// Result of CLI command execution.
pub struct CliResult {
    /// Exit code (0 = success)
    pub exit_code: i32,
    /// Output message
    pub message: String,
}

impl CliResult {
    /// Create a success result with the given message.
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            message: message.into(),
        }
    }

    /// Create an error result with the given message.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            exit_code: 1,
            message: message.into(),
        }
    }
}

/// Execute a session CLI command.
pub async fn execute_command(command: SessionCommands, storage: &SqliteStorage) -> CliResult {
    match command {
        SessionCommands::List { limit } => execute_list(storage, limit).await,
        SessionCommands::Show { session_id } => execute_show(storage, &session_id).await,
        SessionCommands::Archive { session_id, json } => {
            execute_archive(storage, &session_id, json).await
        }
    }
}

const RULE: &str =
    "═══════════════════════════════════════════════════════════════════════════════\n\n";

async fn load_record(storage: &SqliteStorage, session_id: &str) -> Result<SessionRecord, CliResult> {
    match storage.get_session(session_id).await {
        Ok(Some(record)) => Ok(record),
        Ok(None) => Err(CliResult::error(format!("Session not found: {}", session_id))),
        Err(e) => Err(CliResult::error(format!("Failed to load session: {}", e))),
    }
}

/// Execute list command.
async fn execute_list(storage: &SqliteStorage, limit: u32) -> CliResult {
    let sessions = match storage.list_sessions(limit).await {
        Ok(s) => s,
        Err(e) => return CliResult::error(format!("Failed to list sessions: {}", e)),
    };

    let mut output = String::new();
    output.push_str("\nDiagnosis Sessions\n");
    output.push_str(RULE);

    if sessions.is_empty() {
        output.push_str("No sessions recorded.\n");
        return CliResult::success(output);
    }

    for record in &sessions {
        output.push_str(&format!(
            "  {}  {:<16} round {}  {}  (updated {} ago)\n",
            record.id,
            record.phase,
            record.round_index,
            record.final_diagnosis.as_deref().unwrap_or("-"),
            format_duration(Utc::now() - record.updated_at)
        ));
    }

    CliResult::success(output)
}

/// Execute show command.
async fn execute_show(storage: &SqliteStorage, session_id: &str) -> CliResult {
    let record = match load_record(storage, session_id).await {
        Ok(r) => r,
        Err(result) => return result,
    };
    let workflow = match record.to_workflow() {
        Ok(w) => w,
        Err(e) => return CliResult::error(format!("Corrupt session snapshot: {}", e)),
    };
    let status = workflow.status();

    let mut output = String::new();
    output.push_str(&format!("\nSession {}\n", status.session_id));
    output.push_str(RULE);
    output.push_str(&format!(
        "Phase: {} (round {}/{})\n",
        status.phase, status.round_index, status.max_rounds
    ));
    if let Some(id) = status.conversation_id {
        output.push_str(&format!("Conversation: {}\n", id));
    }
    output.push_str(&format!(
        "Final diagnosis: {}\n\n",
        status
            .final_diagnosis
            .as_ref()
            .map(|c| c.diagnosis.as_str())
            .unwrap_or("-")
    ));

    output.push_str(&format!("Candidates: {}\n", status.common_candidates.len()));
    for candidate in &status.common_candidates {
        output.push_str(&format!(
            "  - {} [{}]: {}\n",
            candidate.diagnosis, candidate.probability, candidate.treatment
        ));
    }

    if !status.follow_up_questions.is_empty() {
        output.push_str("\nFollow-up questions:\n");
        for (i, question) in status.follow_up_questions.iter().enumerate() {
            output.push_str(&format!("  {}. {}\n", i, question));
        }
    }

    if !status.rare_candidates.is_empty() {
        output.push_str("\nRare candidates:\n");
        for rare in &status.rare_candidates {
            output.push_str(&format!("  - {} ({})\n", rare.candidate.diagnosis, rare.stage));
        }
    }

    output.push_str(&format!("\nArchived: {}\n", status.archive_size));

    CliResult::success(output)
}

/// Execute archive command.
async fn execute_archive(storage: &SqliteStorage, session_id: &str, json: bool) -> CliResult {
    let record = match load_record(storage, session_id).await {
        Ok(r) => r,
        Err(result) => return result,
    };
    let archive = match storage.get_archive(session_id).await {
        Ok(a) => a,
        Err(e) => return CliResult::error(format!("Failed to load archive: {}", e)),
    };

    if json {
        let ledger = serde_json::json!({
            "session_id": record.id,
            "final_diagnosis": record.final_diagnosis,
            "archive": archive,
        });
        return match serde_json::to_string_pretty(&ledger) {
            Ok(s) => CliResult::success(s),
            Err(e) => CliResult::error(format!("Failed to encode archive: {}", e)),
        };
    }

    let mut output = String::new();
    output.push_str(&format!("\nArchive for {}\n", record.id));
    output.push_str(RULE);
    output.push_str(&format!(
        "Final diagnosis: {}\n\n",
        record.final_diagnosis.as_deref().unwrap_or("-")
    ));

    if archive.is_empty() {
        output.push_str("No archived diagnoses.\n");
    }
    for entry in &archive {
        output.push_str(&format_archive_entry(entry));
    }

    CliResult::success(output)
}

fn format_archive_entry(entry: &ArchivedDiagnosis) -> String {
    let at = DateTime::<Utc>::from_timestamp(entry.archived_at_epoch_seconds, 0)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| entry.archived_at_epoch_seconds.to_string());
    format!(
        "  [{}] {} ({}): {}\n",
        at, entry.diagnosis, entry.probability, entry.reason
    )
}

/// Format a duration in human-readable form.
fn format_duration(duration: chrono::Duration) -> String {
    let secs = duration.num_seconds();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m", secs / 60)
    } else if secs < 86400 {
        format!("{}h", secs / 3600)
    } else {
        format!("{}d", secs / 86400)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkflowConfig;
    use crate::engine::{EngineDiagnoses, PatientInfo};
    use crate::workflow::{DiagnosisCandidate, DiagnosisWorkflow, SessionContext};

    async fn seeded_storage() -> (SqliteStorage, String) {
        let storage = SqliteStorage::new_in_memory().await.unwrap();
        let initial = EngineDiagnoses {
            disclaimer: "Not medical advice".to_string(),
            common_diagnoses: vec![DiagnosisCandidate::new("Migraine", "Rest", "High")],
            rare_diagnoses: None,
            follow_up_questions: vec![],
            conversation_id: Some(3),
        };
        let workflow = DiagnosisWorkflow::new(
            SessionContext::new(PatientInfo::default()),
            initial,
            &WorkflowConfig::default(),
            Utc::now(),
        );
        let record = SessionRecord::from_workflow(&workflow).unwrap();
        storage.save_session(&record).await.unwrap();
        (storage, record.id)
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(chrono::Duration::seconds(30)), "30s");
        assert_eq!(format_duration(chrono::Duration::seconds(120)), "2m");
        assert_eq!(format_duration(chrono::Duration::seconds(7200)), "2h");
        assert_eq!(format_duration(chrono::Duration::seconds(172800)), "2d");
    }

    #[test]
    fn test_format_archive_entry() {
        let entry = ArchivedDiagnosis {
            diagnosis: "Influenza".to_string(),
            treatment: "Fluids".to_string(),
            probability: "Low".to_string(),
            archived_at_epoch_seconds: 0,
            reason: "displaced".to_string(),
        };
        assert_eq!(
            format_archive_entry(&entry),
            "  [1970-01-01 00:00:00] Influenza (Low): displaced\n"
        );
    }

    #[test]
    fn test_cli_result_success() {
        let result = CliResult::success("ok");
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.message, "ok");
    }

    #[test]
    fn test_cli_result_error() {
        let result = CliResult::error("bad");
        assert_eq!(result.exit_code, 1);
        assert_eq!(result.message, "bad");
    }

    #[tokio::test]
    async fn test_execute_list() {
        let (storage, id) = seeded_storage().await;

        let result = execute_command(SessionCommands::List { limit: 10 }, &storage).await;

        assert_eq!(result.exit_code, 0);
        assert!(result.message.contains(&id));
        assert!(result.message.contains("Migraine"));
    }

    #[tokio::test]
    async fn test_execute_show() {
        let (storage, id) = seeded_storage().await;

        let result = execute_command(SessionCommands::Show { session_id: id }, &storage).await;

        assert_eq!(result.exit_code, 0);
        assert!(result.message.contains("Phase: terminal"));
        assert!(result.message.contains("Final diagnosis: Migraine"));
    }

    #[tokio::test]
    async fn test_execute_archive_json() {
        let (storage, id) = seeded_storage().await;

        let result = execute_command(
            SessionCommands::Archive {
                session_id: id.clone(),
                json: true,
            },
            &storage,
        )
        .await;

        assert_eq!(result.exit_code, 0);
        let value: serde_json::Value = serde_json::from_str(&result.message).unwrap();
        assert_eq!(value["session_id"], id);
        assert_eq!(value["final_diagnosis"], "Migraine");
        assert_eq!(value["archive"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_execute_missing_session() {
        let storage = SqliteStorage::new_in_memory().await.unwrap();

        let result = execute_command(
            SessionCommands::Show {
                session_id: "nope".to_string(),
            },
            &storage,
        )
        .await;

        assert_eq!(result.exit_code, 1);
        assert!(result.message.contains("Session not found: nope"));
    }
}
