//! Async driver connecting [`DiagnosisWorkflow`] to an [`EngineClient`].
//!
//! Each call builds the request from the workflow, makes one engine call and
//! applies the result. Calls accept an optional cancellation token; `None`
//! means the call cannot be cancelled.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::conversation::QaPair;
use super::rare::SymptomOutcome;
use super::rounds::RoundSubmission;
use super::session::{DecisionOutcome, DiagnosisWorkflow, RoundOutcome, SessionContext};
use crate::config::WorkflowConfig;
use crate::engine::{
    AskRequest, EngineClient, EngineDiagnoses, FollowUpRequest, TestResultRequest,
    TestResultResponse,
};
use crate::error::{EngineError, EngineResult, WorkflowResult};

/// Await an engine call, giving up early if `cancel` fires
pub async fn with_cancellation<T, F>(cancel: Option<&CancellationToken>, call: F) -> EngineResult<T>
where
    F: Future<Output = EngineResult<T>>,
{
    match cancel {
        None => call.await,
        Some(token) => {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    warn!("Engine call cancelled");
                    Err(EngineError::Cancelled)
                }
                result = call => result,
            }
        }
    }
}

/// Runs workflow transitions that need the engine
#[derive(Clone)]
pub struct WorkflowRunner {
    engine: Arc<dyn EngineClient>,
    config: WorkflowConfig,
}

impl WorkflowRunner {
    pub fn new(engine: Arc<dyn EngineClient>, config: WorkflowConfig) -> Self {
        Self { engine, config }
    }

    /// Submit the intake form and open a session
    pub async fn start(
        &self,
        context: SessionContext,
        cancel: Option<&CancellationToken>,
    ) -> WorkflowResult<DiagnosisWorkflow> {
        let submission = context.submission();
        let initial = with_cancellation(cancel, self.engine.submit_patient(&submission)).await?;
        Ok(DiagnosisWorkflow::new(context, initial, &self.config, Utc::now()))
    }

    /// Send a round request built by `begin_round` or `begin_retry`
    pub async fn send_round(
        &self,
        request: &FollowUpRequest,
        cancel: Option<&CancellationToken>,
    ) -> EngineResult<EngineDiagnoses> {
        with_cancellation(cancel, self.engine.follow_up(request)).await
    }

    /// Send a test submission built by `begin_test_submission`
    pub async fn send_test_results(
        &self,
        request: &TestResultRequest,
        cancel: Option<&CancellationToken>,
    ) -> EngineResult<TestResultResponse> {
        with_cancellation(cancel, self.engine.submit_test_results(request)).await
    }

    /// Send a free-form question built by `begin_ask`
    pub async fn send_question(
        &self,
        request: &AskRequest,
        cancel: Option<&CancellationToken>,
    ) -> EngineResult<String> {
        with_cancellation(cancel, self.engine.ask(request)).await
    }

    /// Run one follow-up round
    pub async fn submit_round(
        &self,
        workflow: &mut DiagnosisWorkflow,
        submission: &RoundSubmission,
        cancel: Option<&CancellationToken>,
    ) -> WorkflowResult<RoundOutcome> {
        let request = workflow.begin_round(submission)?;
        let result = self.send_round(&request, cancel).await;
        workflow.apply_round(result, Utc::now())
    }

    /// Resend a failed final round
    pub async fn retry_final_round(
        &self,
        workflow: &mut DiagnosisWorkflow,
        cancel: Option<&CancellationToken>,
    ) -> WorkflowResult<RoundOutcome> {
        let request = workflow.begin_retry()?;
        let result = self.send_round(&request, cancel).await;
        workflow.apply_round(result, Utc::now())
    }

    /// Ask a free-form question about the current candidates
    pub async fn ask(
        &self,
        workflow: &mut DiagnosisWorkflow,
        question: &str,
        cancel: Option<&CancellationToken>,
    ) -> WorkflowResult<QaPair> {
        let request = workflow.begin_ask(question)?;
        let result = self.send_question(&request, cancel).await;
        workflow.apply_ask(&request, result)
    }

    /// Validate and submit rare-disease test results.
    ///
    /// Validation runs before any network call.
    pub async fn submit_test_results(
        &self,
        workflow: &mut DiagnosisWorkflow,
        candidate_id: &str,
        results: &BTreeMap<String, String>,
        cancel: Option<&CancellationToken>,
    ) -> WorkflowResult<DecisionOutcome> {
        let request = workflow.begin_test_submission(candidate_id, results)?;
        let result = self.send_test_results(&request, cancel).await;
        workflow.apply_test_decision(candidate_id, result, Utc::now())
    }

    /// Record symptom presence; no engine call involved
    pub fn record_symptoms(
        &self,
        workflow: &mut DiagnosisWorkflow,
        candidate_id: &str,
        present: bool,
    ) -> WorkflowResult<SymptomOutcome> {
        debug!(session_id = %workflow.session_id(), candidate = %candidate_id, "Recording symptoms");
        workflow.record_symptom_presence(candidate_id, present)
    }
}
