use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

use super::types::{
    answer_from_value, normalize_diagnosis_payload, AskRequest, EngineDiagnoses,
    FollowUpRequest, PatientSubmission, TestResultRequest, TestResultResponse,
};
use crate::config::{EngineConfig, RequestConfig};
use crate::error::{EngineError, EngineResult};

/// Initial patient submission endpoint.
pub const SUBMIT_PATH: &str = "/diagnoses/submit";
/// Follow-up round endpoint.
pub const FOLLOW_UP_PATH: &str = "/diagnoses/followup";
/// Rare-disease test result endpoint.
pub const TEST_RESULT_PATH: &str = "/diagnosis/test-result";
/// Free-form question endpoint.
pub const ASK_PATH: &str = "/diagnosis/followup";

/// Contract with the remote diagnosis engine.
///
/// Implementations make exactly one attempt per call; retrying is the
/// user's decision.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EngineClient: Send + Sync {
    /// Submit the intake form and get the first candidate set.
    async fn submit_patient(&self, submission: &PatientSubmission) -> EngineResult<EngineDiagnoses>;

    /// Run one follow-up round.
    async fn follow_up(&self, request: &FollowUpRequest) -> EngineResult<EngineDiagnoses>;

    /// Submit rare-disease test results and get the engine's verdict.
    async fn submit_test_results(
        &self,
        request: &TestResultRequest,
    ) -> EngineResult<TestResultResponse>;

    /// Ask a free-form question about the current candidates.
    async fn ask(&self, request: &AskRequest) -> EngineResult<String>;
}

/// HTTP client for the diagnosis engine
#[derive(Clone)]
pub struct HttpEngineClient {
    client: Client,
    base_url: String,
    api_token: String,
    request_config: RequestConfig,
}

impl HttpEngineClient {
    /// Create a new engine client
    pub fn new(config: &EngineConfig, request_config: RequestConfig) -> EngineResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(request_config.timeout_ms))
            .build()
            .map_err(EngineError::Http)?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_token: config.api_token.clone(),
            request_config,
        })
    }

    /// Get the base URL (for testing)
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// POST a JSON body and return the decoded JSON response
    async fn post_json<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> EngineResult<Value> {
        let url = format!("{}{}", self.base_url, path);
        let start = Instant::now();

        debug!(endpoint = %path, "Calling diagnosis engine");

        let result = self.execute_request(&url, body).await;
        let latency = start.elapsed();

        match &result {
            Ok(_) => info!(
                endpoint = %path,
                latency_ms = latency.as_millis(),
                "Engine call succeeded"
            ),
            Err(e) => error!(
                endpoint = %path,
                error = %e,
                latency_ms = latency.as_millis(),
                "Engine call failed"
            ),
        }

        result
    }

    /// Execute a single request (internal)
    async fn execute_request<B: Serialize + ?Sized>(&self, url: &str, body: &B) -> EngineResult<Value> {
        let response = self
            .client
            .post(url)
            .header("Authorization", format!("Bearer {}", self.api_token))
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    EngineError::Timeout {
                        timeout_ms: self.request_config.timeout_ms,
                    }
                } else {
                    EngineError::Http(e)
                }
            })?;

        let status = response.status();

        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            return Err(EngineError::Api {
                status: status.as_u16(),
                message: error_body,
            });
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| EngineError::MalformedResponse {
                message: format!("Failed to parse response: {}", e),
            })
    }
}

#[async_trait]
impl EngineClient for HttpEngineClient {
    async fn submit_patient(&self, submission: &PatientSubmission) -> EngineResult<EngineDiagnoses> {
        let body = self.post_json(SUBMIT_PATH, submission).await?;
        normalize_diagnosis_payload(body)
    }

    async fn follow_up(&self, request: &FollowUpRequest) -> EngineResult<EngineDiagnoses> {
        debug!(
            answers = request.follow_up_answers.len(),
            history = request.conversation_history.len(),
            "Submitting follow-up round"
        );
        let body = self.post_json(FOLLOW_UP_PATH, request).await?;
        normalize_diagnosis_payload(body)
    }

    async fn submit_test_results(
        &self,
        request: &TestResultRequest,
    ) -> EngineResult<TestResultResponse> {
        debug!(
            rare_disease = %request.rare_disease_id,
            tests = request.test_names.len(),
            "Submitting rare-disease test results"
        );
        let body = self.post_json(TEST_RESULT_PATH, request).await?;
        TestResultResponse::from_value(body)
    }

    async fn ask(&self, request: &AskRequest) -> EngineResult<String> {
        debug!(
            history = request.conversation_history.len(),
            "Asking free-form question"
        );
        let body = self.post_json(ASK_PATH, request).await?;
        answer_from_value(body)
    }
}
