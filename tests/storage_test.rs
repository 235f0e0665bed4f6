//! Integration tests for SQLite storage layer
//!
//! Tests database operations using in-memory and on-disk SQLite databases.

use chrono::{Duration, Utc};
use serde_json::json;
use tempfile::TempDir;

use dx_refine::config::{DatabaseConfig, WorkflowConfig};
use dx_refine::engine::{EngineDiagnoses, PatientInfo};
use dx_refine::storage::{Invocation, SessionRecord, SqliteStorage, Storage};
use dx_refine::workflow::{ArchivedDiagnosis, DiagnosisCandidate, DiagnosisWorkflow, SessionContext};

/// Create an in-memory storage instance for testing
async fn create_test_storage() -> SqliteStorage {
    SqliteStorage::new_in_memory()
        .await
        .expect("Failed to create in-memory storage")
}

fn workflow(common: &[&str]) -> DiagnosisWorkflow {
    let initial = EngineDiagnoses {
        disclaimer: "Not medical advice".to_string(),
        common_diagnoses: common
            .iter()
            .map(|n| DiagnosisCandidate::new(*n, "rest", "Medium"))
            .collect(),
        rare_diagnoses: None,
        follow_up_questions: vec!["Any rash?".to_string()],
        conversation_id: Some(4),
    };
    DiagnosisWorkflow::new(
        SessionContext::new(PatientInfo::default()),
        initial,
        &WorkflowConfig::default(),
        Utc::now(),
    )
}

fn archived(name: &str, reason: &str) -> ArchivedDiagnosis {
    ArchivedDiagnosis {
        diagnosis: name.to_string(),
        treatment: "rest".to_string(),
        probability: "Low".to_string(),
        archived_at_epoch_seconds: 1_717_228_800,
        reason: reason.to_string(),
    }
}

async fn saved_session(storage: &SqliteStorage) -> SessionRecord {
    let record = SessionRecord::from_workflow(&workflow(&["A", "B"])).unwrap();
    storage.save_session(&record).await.unwrap();
    record
}

#[cfg(test)]
mod session_tests {
    use super::*;

    #[tokio::test]
    async fn test_save_and_get_session() {
        let storage = create_test_storage().await;
        let record = saved_session(&storage).await;

        let retrieved = storage.get_session(&record.id).await.unwrap();

        assert!(retrieved.is_some(), "Session should exist");
        let retrieved = retrieved.unwrap();
        assert_eq!(retrieved.id, record.id);
        assert_eq!(retrieved.conversation_id, Some(4));
        assert_eq!(retrieved.phase, "initial");
        assert_eq!(retrieved.round_index, 0);
        assert_eq!(retrieved.snapshot, record.snapshot);
        assert_eq!(retrieved.to_workflow().unwrap(), record.to_workflow().unwrap());
    }

    #[tokio::test]
    async fn test_get_nonexistent_session() {
        let storage = create_test_storage().await;

        let result = storage.get_session("nonexistent-id").await.unwrap();

        assert!(
            result.is_none(),
            "Should return None for nonexistent session"
        );
    }

    #[tokio::test]
    async fn test_save_session_upserts() {
        let storage = create_test_storage().await;
        let record = saved_session(&storage).await;

        let mut updated = record.clone();
        updated.phase = "terminal".to_string();
        updated.round_index = 3;
        updated.final_diagnosis = Some("A".to_string());
        updated.created_at = record.created_at + Duration::hours(1);
        updated.updated_at = record.updated_at + Duration::hours(1);
        storage.save_session(&updated).await.unwrap();

        let retrieved = storage.get_session(&record.id).await.unwrap().unwrap();
        assert_eq!(retrieved.phase, "terminal");
        assert_eq!(retrieved.round_index, 3);
        assert_eq!(retrieved.final_diagnosis.as_deref(), Some("A"));
        assert_eq!(
            retrieved.created_at.timestamp(),
            record.created_at.timestamp(),
            "created_at should survive an upsert"
        );
        assert_eq!(retrieved.updated_at.timestamp(), updated.updated_at.timestamp());
    }

    #[tokio::test]
    async fn test_list_sessions_most_recent_first() {
        let storage = create_test_storage().await;

        let mut older = SessionRecord::from_workflow(&workflow(&["A", "B"])).unwrap();
        older.updated_at = Utc::now() - Duration::hours(2);
        let newer = SessionRecord::from_workflow(&workflow(&["C", "D"])).unwrap();
        storage.save_session(&older).await.unwrap();
        storage.save_session(&newer).await.unwrap();

        let sessions = storage.list_sessions(10).await.unwrap();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].id, newer.id);
        assert_eq!(sessions[1].id, older.id);

        let limited = storage.list_sessions(1).await.unwrap();
        assert_eq!(limited.len(), 1);
    }
}

#[cfg(test)]
mod archive_tests {
    use super::*;

    #[tokio::test]
    async fn test_archive_appends_in_order() {
        let storage = create_test_storage().await;
        let record = saved_session(&storage).await;

        storage
            .append_archive(&record.id, &[archived("A", "first"), archived("B", "first")])
            .await
            .unwrap();
        storage
            .append_archive(&record.id, &[archived("C", "second")])
            .await
            .unwrap();

        let archive = storage.get_archive(&record.id).await.unwrap();
        let names: Vec<&str> = archive.iter().map(|a| a.diagnosis.as_str()).collect();
        assert_eq!(names, vec!["A", "B", "C"]);
        assert_eq!(archive[2].reason, "second");
        assert_eq!(archive[0].archived_at_epoch_seconds, 1_717_228_800);
    }

    #[tokio::test]
    async fn test_archive_keeps_duplicates() {
        let storage = create_test_storage().await;
        let record = saved_session(&storage).await;

        storage
            .append_archive(&record.id, &[archived("A", "first")])
            .await
            .unwrap();
        storage
            .append_archive(&record.id, &[archived("A", "first")])
            .await
            .unwrap();

        assert_eq!(storage.get_archive(&record.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_archive_empty_append_is_noop() {
        let storage = create_test_storage().await;
        let record = saved_session(&storage).await;

        storage.append_archive(&record.id, &[]).await.unwrap();

        assert!(storage.get_archive(&record.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_archive_is_per_session() {
        let storage = create_test_storage().await;
        let first = saved_session(&storage).await;
        let second = saved_session(&storage).await;

        storage
            .append_archive(&first.id, &[archived("A", "first")])
            .await
            .unwrap();

        assert_eq!(storage.get_archive(&first.id).await.unwrap().len(), 1);
        assert!(storage.get_archive(&second.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_with_archive_writes_both() {
        let storage = create_test_storage().await;
        let mut record = SessionRecord::from_workflow(&workflow(&["A", "B"])).unwrap();

        storage
            .save_session_with_archive(&record, &[archived("A", "first")])
            .await
            .unwrap();
        record.phase = "terminal".to_string();
        storage
            .save_session_with_archive(&record, &[])
            .await
            .unwrap();

        let loaded = storage.get_session(&record.id).await.unwrap().unwrap();
        assert_eq!(loaded.phase, "terminal");
        assert_eq!(storage.get_archive(&record.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_save_with_archive_rolls_back_session_on_archive_failure() {
        let storage = create_test_storage().await;
        let record = saved_session(&storage).await;

        sqlx::query(
            r#"
            CREATE TRIGGER reject_archive BEFORE INSERT ON archived_diagnoses
            BEGIN
                SELECT RAISE(ABORT, 'archive rejected');
            END
            "#,
        )
        .execute(storage.pool())
        .await
        .unwrap();

        let mut changed = record.clone();
        changed.phase = "terminal".to_string();
        changed.round_index = 3;
        let result = storage
            .save_session_with_archive(&changed, &[archived("A", "first")])
            .await;

        assert!(result.is_err());
        let loaded = storage.get_session(&record.id).await.unwrap().unwrap();
        assert_eq!(loaded.phase, record.phase);
        assert_eq!(loaded.round_index, record.round_index);
        assert!(storage.get_archive(&record.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_archive_requires_session() {
        let storage = create_test_storage().await;

        let result = storage
            .append_archive("no-such-session", &[archived("A", "orphan")])
            .await;

        assert!(result.is_err(), "Archive rows need an existing session");
    }
}

#[cfg(test)]
mod invocation_tests {
    use super::*;

    #[tokio::test]
    async fn test_log_and_read_invocations() {
        let storage = create_test_storage().await;
        let record = saved_session(&storage).await;

        let ok = Invocation::new("diagnosis_follow_up", json!({ "session_id": record.id }))
            .with_session(&record.id)
            .with_endpoint("/diagnoses/followup")
            .success(json!({ "outcome": "round_applied" }), 120);
        storage.log_invocation(&ok).await.unwrap();

        let mut failed = Invocation::new("rare_submit_results", json!({}))
            .with_session(&record.id)
            .failure("Request timeout after 30000ms", 30000);
        failed.created_at = ok.created_at + Duration::seconds(1);
        storage.log_invocation(&failed).await.unwrap();

        let invocations = storage.get_session_invocations(&record.id).await.unwrap();
        assert_eq!(invocations.len(), 2);

        assert_eq!(invocations[0].tool_name, "diagnosis_follow_up");
        assert!(invocations[0].success);
        assert_eq!(invocations[0].endpoint.as_deref(), Some("/diagnoses/followup"));
        assert_eq!(invocations[0].output, Some(json!({ "outcome": "round_applied" })));
        assert_eq!(invocations[0].latency_ms, Some(120));

        assert!(!invocations[1].success);
        assert_eq!(
            invocations[1].error.as_deref(),
            Some("Request timeout after 30000ms")
        );
    }

    #[tokio::test]
    async fn test_invocations_for_unknown_session() {
        let storage = create_test_storage().await;

        let invocations = storage.get_session_invocations("missing").await.unwrap();
        assert!(invocations.is_empty());
    }
}

#[cfg(test)]
mod file_database_tests {
    use super::*;

    #[tokio::test]
    async fn test_sessions_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let config = DatabaseConfig {
            path: dir.path().join("nested").join("dx.db"),
            max_connections: 2,
        };

        let id = {
            let storage = SqliteStorage::new(&config).await.unwrap();
            let record = saved_session(&storage).await;
            storage
                .append_archive(&record.id, &[archived("B", "kept")])
                .await
                .unwrap();
            storage.pool().close().await;
            record.id
        };

        let reopened = SqliteStorage::new(&config).await.unwrap();
        let record = reopened.get_session(&id).await.unwrap();
        assert!(record.is_some());
        assert_eq!(reopened.get_archive(&id).await.unwrap().len(), 1);
    }
}
