//! Session operations behind the MCP tools.
//!
//! Each operation loads the session snapshot, applies one workflow
//! transition, then saves the snapshot and any new archive entries in one
//! transaction. Engine-backed operations also save right after the request
//! is built, so a round is on disk as in flight before the engine is called.
//! The snapshot is saved even when the engine call fails, since a failed
//! round still consumes its increment.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::Config;
use crate::engine::{
    EngineClient, ModelConfig, PatientInfo, ASK_PATH, FOLLOW_UP_PATH, SUBMIT_PATH,
    TEST_RESULT_PATH,
};
use crate::error::{AppResult, StorageError};
use crate::storage::{Invocation, SessionRecord, SqliteStorage, Storage};
use crate::workflow::{
    ArchivedDiagnosis, DecisionOutcome, DiagnosisCandidate, DiagnosisWorkflow, QaPair,
    RoundOutcome, RoundSubmission, SessionContext, SymptomOutcome, WorkflowRunner,
    WorkflowStatus,
};

/// Input for `diagnosis_start`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartParams {
    /// Intake form fields.
    pub patient: PatientInfo,
}

/// Input naming an existing session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionParams {
    pub session_id: String,
}

/// Input for `diagnosis_follow_up`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowUpParams {
    pub session_id: String,
    /// Answers keyed by question index.
    #[serde(default)]
    pub answers: BTreeMap<usize, String>,
    #[serde(default)]
    pub additional_info: String,
}

/// Input for `rare_record_symptoms`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymptomParams {
    pub session_id: String,
    pub candidate: String,
    pub present: bool,
}

/// Input for `rare_select_tests`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectTestsParams {
    pub session_id: String,
    pub candidate: String,
    pub tests: Vec<String>,
}

/// Input for `rare_toggle_test`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToggleTestParams {
    pub session_id: String,
    pub candidate: String,
    pub test: String,
}

/// Input for `rare_skip_tests`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateParams {
    pub session_id: String,
    pub candidate: String,
}

/// Input for `rare_submit_results`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResultsParams {
    pub session_id: String,
    pub candidate: String,
    /// Result text keyed by test name.
    pub results: BTreeMap<String, String>,
}

/// Input for `diagnosis_ask`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AskParams {
    pub session_id: String,
    pub question: String,
}

/// Output of a round submission
#[derive(Debug, Clone, Serialize)]
pub struct RoundResult {
    pub outcome: RoundOutcome,
    pub status: WorkflowStatus,
}

/// Output of recording symptom presence
#[derive(Debug, Clone, Serialize)]
pub struct SymptomResult {
    pub effect: SymptomOutcome,
    pub status: WorkflowStatus,
}

/// Output of changing the test selection
#[derive(Debug, Clone, Serialize)]
pub struct SelectionResult {
    pub candidate: String,
    pub selected_tests: Vec<String>,
}

/// Output of a test submission
#[derive(Debug, Clone, Serialize)]
pub struct DecisionResult {
    pub outcome: DecisionOutcome,
    pub status: WorkflowStatus,
}

/// Output of a free-form question
#[derive(Debug, Clone, Serialize)]
pub struct AskResult {
    pub question: String,
    pub answer: String,
    /// Every answered question of the session, oldest first.
    pub history: Vec<QaPair>,
}

/// Persisted archive ledger of a session
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveResult {
    pub session_id: String,
    pub final_diagnosis: Option<DiagnosisCandidate>,
    pub archive: Vec<ArchivedDiagnosis>,
}

/// Diagnosis session operations
#[derive(Clone)]
pub struct DiagnosisService {
    storage: SqliteStorage,
    runner: WorkflowRunner,
    model: Option<ModelConfig>,
    shutdown: CancellationToken,
}

impl DiagnosisService {
    /// Create a new service
    pub fn new(
        storage: SqliteStorage,
        engine: Arc<dyn EngineClient>,
        config: &Config,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            storage,
            runner: WorkflowRunner::new(engine, config.workflow.clone()),
            model: config.engine.model_override.as_ref().map(ModelConfig::from),
            shutdown,
        }
    }

    async fn load(&self, session_id: &str) -> AppResult<DiagnosisWorkflow> {
        let record = self
            .storage
            .get_session(session_id)
            .await?
            .ok_or_else(|| StorageError::SessionNotFound {
                session_id: session_id.to_string(),
            })?;
        let mut workflow = record.to_workflow()?;

        if workflow.recover_interrupted() {
            self.persist(&workflow, workflow.archive().len()).await?;
        }
        Ok(workflow)
    }

    /// Save the snapshot and file archive entries added since `archived_before`
    async fn persist(&self, workflow: &DiagnosisWorkflow, archived_before: usize) -> AppResult<()> {
        let record = SessionRecord::from_workflow(workflow)?;
        let added = workflow.archive().get(archived_before..).unwrap_or_default();
        self.storage.save_session_with_archive(&record, added).await?;

        Ok(())
    }

    /// Log an engine-backed tool call
    async fn log<R: Serialize, E: std::fmt::Display>(
        &self,
        tool_name: &str,
        endpoint: &str,
        input: &impl Serialize,
        session_id: Option<&str>,
        result: &Result<R, E>,
        start: Instant,
    ) -> AppResult<()> {
        let latency = start.elapsed().as_millis() as i64;
        let mut invocation =
            Invocation::new(tool_name, serde_json::to_value(input).unwrap_or_default())
                .with_endpoint(endpoint);
        if let Some(id) = session_id {
            invocation = invocation.with_session(id);
        }

        let invocation = match result {
            Ok(output) => {
                invocation.success(serde_json::to_value(output).unwrap_or_default(), latency)
            }
            Err(e) => invocation.failure(e.to_string(), latency),
        };

        self.storage.log_invocation(&invocation).await?;
        Ok(())
    }

    /// Submit the intake form and open a session
    pub async fn start(&self, params: StartParams) -> AppResult<WorkflowStatus> {
        let start = Instant::now();
        let context = SessionContext::new(params.patient.clone()).with_model(self.model.clone());
        let session_id = context.session_id.clone();

        let result = self.runner.start(context, Some(&self.shutdown)).await;
        self.log(
            "diagnosis_start",
            SUBMIT_PATH,
            &params,
            Some(&session_id),
            &result.as_ref().map(|wf| wf.status()),
            start,
        )
        .await?;

        let workflow = result?;
        self.persist(&workflow, 0).await?;

        info!(
            session_id = %session_id,
            latency_ms = start.elapsed().as_millis(),
            "Session opened"
        );
        Ok(workflow.status())
    }

    /// Run one follow-up round
    pub async fn follow_up(&self, params: FollowUpParams) -> AppResult<RoundResult> {
        let start = Instant::now();
        let mut workflow = self.load(&params.session_id).await?;
        let archived_before = workflow.archive().len();

        let submission = RoundSubmission {
            answers: params.answers.clone(),
            additional_info: params.additional_info.clone(),
        };
        let request = workflow.begin_round(&submission)?;
        self.persist(&workflow, archived_before).await?;

        let sent = self.runner.send_round(&request, Some(&self.shutdown)).await;
        let result = workflow.apply_round(sent, Utc::now());

        self.persist(&workflow, archived_before).await?;
        self.log(
            "diagnosis_follow_up",
            FOLLOW_UP_PATH,
            &params,
            Some(&params.session_id),
            &result,
            start,
        )
        .await?;

        Ok(RoundResult {
            outcome: result?,
            status: workflow.status(),
        })
    }

    /// Resend a failed final round
    pub async fn retry_final_round(&self, params: SessionParams) -> AppResult<RoundResult> {
        let start = Instant::now();
        let mut workflow = self.load(&params.session_id).await?;
        let archived_before = workflow.archive().len();

        let request = workflow.begin_retry()?;
        self.persist(&workflow, archived_before).await?;

        let sent = self.runner.send_round(&request, Some(&self.shutdown)).await;
        let result = workflow.apply_round(sent, Utc::now());

        self.persist(&workflow, archived_before).await?;
        self.log(
            "diagnosis_retry_final_round",
            FOLLOW_UP_PATH,
            &params,
            Some(&params.session_id),
            &result,
            start,
        )
        .await?;

        Ok(RoundResult {
            outcome: result?,
            status: workflow.status(),
        })
    }

    /// Ask a free-form question about the session's candidates
    pub async fn ask(&self, params: AskParams) -> AppResult<AskResult> {
        let start = Instant::now();
        let mut workflow = self.load(&params.session_id).await?;

        let request = workflow.begin_ask(&params.question)?;
        let sent = self
            .runner
            .send_question(&request, Some(&self.shutdown))
            .await;
        let result = workflow.apply_ask(&request, sent);

        if result.is_ok() {
            self.persist(&workflow, workflow.archive().len()).await?;
        }
        self.log(
            "diagnosis_ask",
            ASK_PATH,
            &params,
            Some(&params.session_id),
            &result,
            start,
        )
        .await?;

        let pair = result?;
        Ok(AskResult {
            question: pair.question,
            answer: pair.answer,
            history: workflow.ask_history().snapshot(),
        })
    }

    /// Current view of a session
    pub async fn status(&self, params: SessionParams) -> AppResult<WorkflowStatus> {
        Ok(self.load(&params.session_id).await?.status())
    }

    /// Final diagnosis and archive ledger as persisted
    pub async fn archive(&self, params: SessionParams) -> AppResult<ArchiveResult> {
        let workflow = self.load(&params.session_id).await?;
        let archive = self.storage.get_archive(&params.session_id).await?;

        debug!(session_id = %params.session_id, entries = archive.len(), "Archive read");

        Ok(ArchiveResult {
            session_id: params.session_id,
            final_diagnosis: workflow.final_diagnosis().cloned(),
            archive,
        })
    }

    /// Record symptom presence for a rare candidate
    pub async fn record_symptoms(&self, params: SymptomParams) -> AppResult<SymptomResult> {
        let mut workflow = self.load(&params.session_id).await?;
        let effect = self
            .runner
            .record_symptoms(&mut workflow, &params.candidate, params.present)?;
        self.persist(&workflow, workflow.archive().len()).await?;

        Ok(SymptomResult {
            effect,
            status: workflow.status(),
        })
    }

    /// Replace the selected tests for a rare candidate
    pub async fn select_tests(&self, params: SelectTestsParams) -> AppResult<SelectionResult> {
        let mut workflow = self.load(&params.session_id).await?;
        let selected = workflow.select_tests(&params.candidate, params.tests)?;
        self.persist(&workflow, workflow.archive().len()).await?;

        Ok(SelectionResult {
            candidate: params.candidate,
            selected_tests: selected.into_iter().collect(),
        })
    }

    /// Toggle one test for a rare candidate
    pub async fn toggle_test(&self, params: ToggleTestParams) -> AppResult<SelectionResult> {
        let mut workflow = self.load(&params.session_id).await?;
        let selected = workflow.toggle_test(&params.candidate, &params.test)?;
        self.persist(&workflow, workflow.archive().len()).await?;

        Ok(SelectionResult {
            candidate: params.candidate,
            selected_tests: selected.into_iter().collect(),
        })
    }

    /// Close test selection for a rare candidate without submitting
    pub async fn skip_tests(&self, params: CandidateParams) -> AppResult<WorkflowStatus> {
        let mut workflow = self.load(&params.session_id).await?;
        workflow.skip_tests(&params.candidate)?;
        self.persist(&workflow, workflow.archive().len()).await?;
        Ok(workflow.status())
    }

    /// Submit test results for a rare candidate
    pub async fn submit_results(&self, params: SubmitResultsParams) -> AppResult<DecisionResult> {
        let start = Instant::now();
        let mut workflow = self.load(&params.session_id).await?;
        let archived_before = workflow.archive().len();

        let request = workflow.begin_test_submission(&params.candidate, &params.results)?;
        self.persist(&workflow, archived_before).await?;

        let sent = self
            .runner
            .send_test_results(&request, Some(&self.shutdown))
            .await;
        let result = workflow.apply_test_decision(&params.candidate, sent, Utc::now());

        self.persist(&workflow, archived_before).await?;
        self.log(
            "rare_submit_results",
            TEST_RESULT_PATH,
            &params,
            Some(&params.session_id),
            &result,
            start,
        )
        .await?;

        Ok(DecisionResult {
            outcome: result?,
            status: workflow.status(),
        })
    }
}
