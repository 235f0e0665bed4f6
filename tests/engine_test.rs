//! Integration tests for the diagnosis engine client
//!
//! Tests HTTP client behavior using wiremock for request/response mocking.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use wiremock::{
    matchers::{body_partial_json, header, method, path},
    Mock, MockServer, ResponseTemplate,
};

use dx_refine::config::{EngineConfig, RequestConfig, WorkflowConfig};
use dx_refine::engine::{
    EngineClient, EngineDiagnoses, HttpEngineClient, ModelConfig, PatientInfo, ASK_PATH,
    FOLLOW_UP_PATH, SUBMIT_PATH, TEST_RESULT_PATH,
};
use dx_refine::error::EngineError;
use dx_refine::workflow::{DiagnosisCandidate, DiagnosisWorkflow, RoundSubmission, SessionContext};

/// Create a test client pointing to mock server
fn create_test_client(base_url: &str) -> HttpEngineClient {
    let config = EngineConfig {
        api_token: "test-token".to_string(),
        base_url: base_url.to_string(),
        model_override: None,
    };

    HttpEngineClient::new(&config, RequestConfig { timeout_ms: 5000 })
        .expect("Failed to create client")
}

fn patient() -> PatientInfo {
    serde_json::from_value(json!({
        "patientName": "Jane Doe",
        "age": "45",
        "gender": "female",
        "symptoms": "fever, joint pain",
        "medicalHistory": "",
        "allergies": "penicillin",
        "currentMedications": ""
    }))
    .unwrap()
}

fn payload() -> serde_json::Value {
    json!({
        "disclaimer": "Not medical advice",
        "common_diagnoses": [
            { "diagnosis": "Influenza", "treatment": "Rest", "probability": "High" },
            { "diagnosis": "Dengue", "treatment": "Fluids", "probability": "Medium" }
        ],
        "rare_diagnoses": [
            {
                "diagnosis": "Lupus",
                "treatment": "Immunosuppressants",
                "probability": "Low",
                "prevalence": "1 in 2,000",
                "discriminatorSymptoms": ["Butterfly rash"],
                "recommendedTests": ["ANA", "Anti-dsDNA"]
            }
        ],
        "follow_up_questions": ["Any rash?", "Recent travel?"]
    })
}

/// A workflow with a round on offer, to build follow-up requests from
fn workflow() -> DiagnosisWorkflow {
    let initial = EngineDiagnoses {
        disclaimer: "Not medical advice".to_string(),
        common_diagnoses: vec![
            DiagnosisCandidate::new("Influenza", "Rest", "High"),
            DiagnosisCandidate::new("Dengue", "Fluids", "Medium"),
        ],
        rare_diagnoses: None,
        follow_up_questions: vec!["Any rash?".to_string(), "Recent travel?".to_string()],
        conversation_id: Some(12),
    };
    DiagnosisWorkflow::new(
        SessionContext::new(patient()),
        initial,
        &WorkflowConfig::default(),
        Utc::now(),
    )
}

#[cfg(test)]
mod submit_tests {
    use super::*;

    #[tokio::test]
    async fn test_submit_patient_bare_payload() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path(SUBMIT_PATH))
            .and(header("Authorization", "Bearer test-token"))
            .and(header("Content-Type", "application/json"))
            .and(body_partial_json(json!({
                "patientName": "Jane Doe",
                "age": 45,
                "allergies": "penicillin"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(payload()))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server.uri());
        let submission = SessionContext::new(patient()).submission();

        let result = client.submit_patient(&submission).await.unwrap();

        assert_eq!(result.disclaimer, "Not medical advice");
        assert_eq!(result.common_diagnoses.len(), 2);
        assert_eq!(result.follow_up_questions.len(), 2);
        let rare = result.rare_diagnoses.unwrap();
        assert_eq!(rare[0].recommended_tests(), ["ANA", "Anti-dsDNA"]);
        assert_eq!(rare[0].prevalence.as_deref(), Some("1 in 2,000"));
        assert!(result.conversation_id.is_none());
    }

    #[tokio::test]
    async fn test_submit_patient_wrapped_in_array() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path(SUBMIT_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                { "diagnoses": payload(), "conversationId": 77 }
            ])))
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server.uri());
        let submission = SessionContext::new(patient()).submission();

        let result = client.submit_patient(&submission).await.unwrap();

        assert_eq!(result.common_diagnoses[0].diagnosis, "Influenza");
        assert_eq!(result.conversation_id, Some(77));
    }

    #[tokio::test]
    async fn test_submit_patient_forwards_model_override() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path(SUBMIT_PATH))
            .and(body_partial_json(json!({
                "openaiConfig": { "apiKey": "sk-test", "model": "gpt-4o" }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(payload()))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server.uri());
        let submission = SessionContext::new(patient())
            .with_model(Some(ModelConfig {
                api_key: "sk-test".to_string(),
                model: "gpt-4o".to_string(),
            }))
            .submission();

        assert!(client.submit_patient(&submission).await.is_ok());
    }
}

#[cfg(test)]
mod follow_up_tests {
    use super::*;

    #[tokio::test]
    async fn test_follow_up_request_body() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path(FOLLOW_UP_PATH))
            .and(body_partial_json(json!({
                "followUpAnswers": ["yes", ""],
                "additionalInfo": "worse at night",
                "conversationHistory": [
                    { "question": "Any rash?", "response": "yes" },
                    { "question": "Recent travel?", "response": "" },
                    { "question": "Additional Information", "response": "worse at night" }
                ],
                "initialResponse": { "disclaimer": "Not medical advice" }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "followUpResponse": payload(),
                "conversationId": "31"
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server.uri());
        let mut wf = workflow();
        let request = wf
            .begin_round(
                &RoundSubmission::new()
                    .answer(0, "yes")
                    .with_additional_info("worse at night"),
            )
            .unwrap();

        let result = client.follow_up(&request).await.unwrap();

        assert_eq!(result.common_diagnoses.len(), 2);
        assert_eq!(result.conversation_id, Some(31));
    }

    #[tokio::test]
    async fn test_follow_up_missing_common_diagnoses() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path(FOLLOW_UP_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "followUpResponse": { "disclaimer": "x", "follow_up_questions": [] }
            })))
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server.uri());
        let mut wf = workflow();
        let request = wf.begin_round(&RoundSubmission::new()).unwrap();

        let result = client.follow_up(&request).await;

        match result {
            Err(EngineError::MalformedResponse { message }) => {
                assert!(message.contains("common_diagnoses"), "got: {}", message)
            }
            other => panic!("expected malformed response, got {:?}", other),
        }
    }
}

#[cfg(test)]
mod ask_tests {
    use super::*;

    #[tokio::test]
    async fn test_ask_request_body_and_answer() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path(ASK_PATH))
            .and(header("Authorization", "Bearer test-token"))
            .and(body_partial_json(json!({
                "originalPatientInfo": { "patientName": "Jane Doe" },
                "initialResponse": {
                    "diagnoses": [{ "diagnosis": "Influenza" }, { "diagnosis": "Dengue" }]
                },
                "followUpQuestion": "Could it be dengue?",
                "conversationHistory": [{ "question": "Could it be dengue?" }]
            })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!([{ "response": "Check platelet count." }])),
            )
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server.uri());
        let request = workflow().begin_ask("Could it be dengue?").unwrap();

        let answer = client.ask(&request).await.unwrap();

        assert_eq!(answer, "Check platelet count.");
        assert!(request.conversation_history[0].response.is_none());
    }

    #[tokio::test]
    async fn test_ask_without_response_field() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path(ASK_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "answer": "?" })))
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server.uri());
        let request = workflow().begin_ask("Anything else?").unwrap();

        let result = client.ask(&request).await;

        assert!(
            matches!(result, Err(EngineError::MalformedResponse { .. })),
            "got {:?}",
            result
        );
    }
}

#[cfg(test)]
mod test_result_tests {
    use super::*;
    use dx_refine::workflow::RareDiseaseDecision;

    fn rare_workflow() -> DiagnosisWorkflow {
        let mut initial: EngineDiagnoses =
            dx_refine::engine::normalize_diagnosis_payload(payload()).unwrap();
        initial.conversation_id = Some(5);
        let mut wf = DiagnosisWorkflow::new(
            SessionContext::new(patient()),
            initial,
            &WorkflowConfig::default(),
            Utc::now(),
        );
        wf.record_symptom_presence("Lupus", true).unwrap();
        wf.select_tests("Lupus", vec!["ANA".to_string()]).unwrap();
        wf
    }

    #[tokio::test]
    async fn test_submit_test_results_confirm() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path(TEST_RESULT_PATH))
            .and(body_partial_json(json!({
                "testNames": ["ANA"],
                "results": { "ANA": "positive 1:640" },
                "rareDiseaseId": "Lupus",
                "conversationId": 5,
                "currentDiagnoses": {
                    "rare_diagnoses": [{ "diagnosis": "Lupus" }]
                }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "decision": "CONFIRM",
                "action": {
                    "shouldBecomePrimary": true,
                    "probability": 85,
                    "updatedDiagnosis": { "treatment": "Hydroxychloroquine" }
                }
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server.uri());
        let mut wf = rare_workflow();
        let mut results = BTreeMap::new();
        results.insert("ANA".to_string(), "positive 1:640".to_string());
        let request = wf.begin_test_submission("Lupus", &results).unwrap();

        let response = client.submit_test_results(&request).await.unwrap();
        let candidate = &wf.rare().active_candidates()[0];
        let decision = response.into_decision(candidate).unwrap();

        match decision {
            RareDiseaseDecision::Confirm {
                becomes_terminal,
                updated_candidate,
            } => {
                assert!(becomes_terminal);
                assert_eq!(updated_candidate.probability, "85");
                assert_eq!(updated_candidate.treatment, "Hydroxychloroquine");
            }
            other => panic!("expected confirmation, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_submit_test_results_unreadable_verdict() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path(TEST_RESULT_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "verdict": "yes" })))
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server.uri());
        let mut wf = rare_workflow();
        let mut results = BTreeMap::new();
        results.insert("ANA".to_string(), "negative".to_string());
        let request = wf.begin_test_submission("Lupus", &results).unwrap();

        let result = client.submit_test_results(&request).await;
        assert!(matches!(result, Err(EngineError::MalformedResponse { .. })));
    }
}

#[cfg(test)]
mod error_handling_tests {
    use super::*;

    #[tokio::test]
    async fn test_api_error_status() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path(SUBMIT_PATH))
            .respond_with(ResponseTemplate::new(500).set_body_string("engine exploded"))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server.uri());
        let submission = SessionContext::new(patient()).submission();

        let result = client.submit_patient(&submission).await;

        match result {
            Err(EngineError::Api { status, message }) => {
                assert_eq!(status, 500);
                assert_eq!(message, "engine exploded");
            }
            other => panic!("expected API error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unauthorized() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path(SUBMIT_PATH))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad token"))
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server.uri());
        let submission = SessionContext::new(patient()).submission();

        let result = client.submit_patient(&submission).await;
        assert!(matches!(result, Err(EngineError::Api { status: 401, .. })));
    }

    #[tokio::test]
    async fn test_non_json_body() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path(SUBMIT_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server.uri());
        let submission = SessionContext::new(patient()).submission();

        let result = client.submit_patient(&submission).await;
        assert!(matches!(result, Err(EngineError::MalformedResponse { .. })));
    }

    #[tokio::test]
    async fn test_empty_array_response() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path(SUBMIT_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server.uri());
        let submission = SessionContext::new(patient()).submission();

        let result = client.submit_patient(&submission).await;
        assert!(matches!(result, Err(EngineError::MalformedResponse { .. })));
    }

    #[tokio::test]
    async fn test_single_attempt_on_failure() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path(SUBMIT_PATH))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server.uri());
        let submission = SessionContext::new(patient()).submission();

        assert!(client.submit_patient(&submission).await.is_err());
    }
}

#[cfg(test)]
mod timeout_tests {
    use super::*;

    #[tokio::test]
    async fn test_request_timeout() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path(SUBMIT_PATH))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(payload())
                    .set_delay(Duration::from_secs(10)),
            )
            .mount(&mock_server)
            .await;

        let config = EngineConfig {
            api_token: "test-token".to_string(),
            base_url: mock_server.uri(),
            model_override: None,
        };
        let client = HttpEngineClient::new(&config, RequestConfig { timeout_ms: 100 }).unwrap();
        let submission = SessionContext::new(patient()).submission();

        let result = client.submit_patient(&submission).await;

        assert!(
            matches!(result, Err(EngineError::Timeout { timeout_ms: 100 })),
            "Should time out, got {:?}",
            result
        );
    }
}
