use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::config::ModelOverride;
use crate::error::{EngineError, EngineResult};
use crate::workflow::{DiagnosisCandidate, QaPair, RareDiseaseDecision};

/// Patient attributes as entered on the intake form.
///
/// Unknown fields are carried through untouched so the engine sees whatever
/// the caller supplied.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatientInfo {
    #[serde(default)]
    pub patient_name: String,
    #[serde(default, deserialize_with = "deserialize_age")]
    pub age: u32,
    #[serde(default)]
    pub gender: String,
    #[serde(default)]
    pub symptoms: String,
    #[serde(default)]
    pub medical_history: String,
    #[serde(default)]
    pub allergies: String,
    #[serde(default)]
    pub current_medications: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Accepts an integer, a numeric string or anything else (mapped to 0).
fn deserialize_age<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(0),
        Value::String(s) => parse_leading_int(&s),
        _ => 0,
    })
}

/// Leading-digits parse: "45 years" is 45, "abc" is 0.
fn parse_leading_int(s: &str) -> u32 {
    let digits: String = s.trim().chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().unwrap_or(0)
}

/// Model selection forwarded to the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelConfig {
    pub api_key: String,
    pub model: String,
}

impl From<&ModelOverride> for ModelConfig {
    fn from(value: &ModelOverride) -> Self {
        Self {
            api_key: value.api_key.clone(),
            model: value.model.clone(),
        }
    }
}

/// Patient info with the optional model override embedded, as the engine
/// expects it in every request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientSnapshot {
    #[serde(flatten)]
    pub patient: PatientInfo,
    #[serde(rename = "openaiConfig", skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelConfig>,
}

/// Prior engine output echoed back on a follow-up request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitialResponse {
    pub disclaimer: String,
    pub diagnoses: Vec<DiagnosisCandidate>,
    pub follow_up_questions: Vec<String>,
}

/// One transcript entry on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub question: String,
    pub response: String,
}

impl From<&QaPair> for ConversationTurn {
    fn from(pair: &QaPair) -> Self {
        Self {
            question: pair.question.clone(),
            response: pair.answer.clone(),
        }
    }
}

/// Follow-up round request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FollowUpRequest {
    pub original_patient_info: PatientSnapshot,
    pub initial_response: InitialResponse,
    /// One answer per follow-up question, aligned by index.
    pub follow_up_answers: Vec<String>,
    pub additional_info: String,
    pub conversation_history: Vec<ConversationTurn>,
    #[serde(rename = "openaiConfig", skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelConfig>,
}

/// One entry of the free-form question thread. The question being asked
/// goes last, without a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AskTurn {
    pub question: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
}

impl From<&QaPair> for AskTurn {
    fn from(pair: &QaPair) -> Self {
        Self {
            question: pair.question.clone(),
            response: Some(pair.answer.clone()),
        }
    }
}

/// Free-form question about the current candidates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AskRequest {
    pub original_patient_info: PatientSnapshot,
    pub initial_response: InitialResponse,
    pub follow_up_question: String,
    pub conversation_history: Vec<AskTurn>,
    #[serde(rename = "openaiConfig", skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelConfig>,
}

/// Read the engine's answer to a free-form question.
///
/// The answer sits under `response`, in an object or a one-element array.
pub fn answer_from_value(value: Value) -> EngineResult<String> {
    let outer = match value {
        Value::Array(items) => items
            .into_iter()
            .next()
            .ok_or_else(|| malformed("response array is empty"))?,
        other => other,
    };

    match outer.get("response") {
        Some(Value::String(answer)) => Ok(answer.clone()),
        Some(_) => Err(malformed("answer is not a string")),
        None => Err(malformed("missing response")),
    }
}

/// Initial patient submission
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PatientSubmission {
    #[serde(flatten)]
    pub patient: PatientSnapshot,
}

/// Candidates currently on screen, sent as context with test results
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CurrentDiagnoses {
    pub common_diagnoses: Vec<DiagnosisCandidate>,
    pub rare_diagnoses: Vec<DiagnosisCandidate>,
}

/// Rare-disease test submission
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResultRequest {
    pub test_names: Vec<String>,
    pub results: BTreeMap<String, String>,
    pub rare_disease_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<i64>,
    pub patient_info: PatientSnapshot,
    pub current_diagnoses: CurrentDiagnoses,
    #[serde(rename = "openaiConfig", skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelConfig>,
}

/// Diagnosis payload after shape normalisation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineDiagnoses {
    pub disclaimer: String,
    pub common_diagnoses: Vec<DiagnosisCandidate>,
    /// `None` when the engine did not send the field (or sent null).
    pub rare_diagnoses: Option<Vec<DiagnosisCandidate>>,
    pub follow_up_questions: Vec<String>,
    pub conversation_id: Option<i64>,
}

/// Raw payload fields; everything optional so the missing ones can be
/// reported precisely.
#[derive(Debug, Deserialize)]
struct RawDiagnosisPayload {
    #[serde(default)]
    disclaimer: Option<String>,
    #[serde(default)]
    common_diagnoses: Option<Vec<DiagnosisCandidate>>,
    #[serde(default)]
    rare_diagnoses: Option<Vec<DiagnosisCandidate>>,
    #[serde(default)]
    follow_up_questions: Option<Vec<String>>,
}

/// Normalise any diagnosis response shape the engine produces.
///
/// Accepted shapes: the bare payload, the payload under `followUpResponse`
/// (preferred) or `diagnoses`, and a one-element array of any of those.
/// A missing `common_diagnoses` array is a malformed response.
pub fn normalize_diagnosis_payload(value: Value) -> EngineResult<EngineDiagnoses> {
    let outer = match value {
        Value::Array(items) => items
            .into_iter()
            .next()
            .ok_or_else(|| malformed("response array is empty"))?,
        other => other,
    };

    let Value::Object(mut outer) = outer else {
        return Err(malformed("response is not a JSON object"));
    };

    let conversation_id = outer.get("conversationId").and_then(conversation_id_of);

    let payload = match (outer.remove("followUpResponse"), outer.remove("diagnoses")) {
        (Some(inner @ Value::Object(_)), _) => inner,
        (_, Some(inner @ Value::Object(_))) => inner,
        _ => Value::Object(outer),
    };

    let raw: RawDiagnosisPayload = serde_json::from_value(payload)
        .map_err(|e| malformed(format!("unreadable diagnosis payload: {}", e)))?;

    let common_diagnoses = raw
        .common_diagnoses
        .ok_or_else(|| malformed("missing common_diagnoses"))?;

    Ok(EngineDiagnoses {
        disclaimer: raw.disclaimer.unwrap_or_default(),
        common_diagnoses,
        rare_diagnoses: raw.rare_diagnoses,
        follow_up_questions: raw.follow_up_questions.unwrap_or_default(),
        conversation_id,
    })
}

fn conversation_id_of(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn malformed(message: impl Into<String>) -> EngineError {
    EngineError::MalformedResponse {
        message: message.into(),
    }
}

/// Engine verdict on a rare-disease test submission
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TestResultResponse {
    pub decision: String,
    #[serde(default)]
    pub action: TestAction,
}

/// Follow-up action attached to a test verdict
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestAction {
    #[serde(default)]
    pub should_become_primary: Option<bool>,
    #[serde(default)]
    pub should_be_dismissed: Option<bool>,
    /// Label or number; see [`probability_label`].
    #[serde(default)]
    pub probability: Option<Value>,
    #[serde(default)]
    pub updated_diagnosis: Option<UpdatedDiagnosis>,
    #[serde(default)]
    pub additional_tests_needed: Option<Vec<String>>,
}

/// Partial candidate update returned with a confirmation
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct UpdatedDiagnosis {
    #[serde(default)]
    pub treatment: Option<String>,
    #[serde(default)]
    pub probability: Option<Value>,
}

/// Probability labels are free text; numbers are rendered as-is.
pub fn probability_label(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl TestResultResponse {
    /// Parse an engine test verdict
    pub fn from_value(value: Value) -> EngineResult<Self> {
        serde_json::from_value(value)
            .map_err(|e| malformed(format!("unreadable test verdict: {}", e)))
    }

    /// Translate the verdict for `candidate` into a [`RareDiseaseDecision`].
    ///
    /// A confirmation carries `candidate` merged with the engine's updated
    /// probability and treatment.
    pub fn into_decision(self, candidate: &DiagnosisCandidate) -> EngineResult<RareDiseaseDecision> {
        let action = self.action;
        match self.decision.trim().to_ascii_uppercase().as_str() {
            "CONFIRM" => {
                let updated = action.updated_diagnosis.unwrap_or_default();
                let probability = action
                    .probability
                    .as_ref()
                    .and_then(probability_label)
                    .or_else(|| updated.probability.as_ref().and_then(probability_label));
                Ok(RareDiseaseDecision::Confirm {
                    becomes_terminal: action.should_become_primary.unwrap_or(false),
                    updated_candidate: candidate
                        .merged_with(probability.as_deref(), updated.treatment.as_deref()),
                })
            }
            "RULE_OUT" => Ok(RareDiseaseDecision::RuleOut {
                dismissed: action.should_be_dismissed.unwrap_or(false),
            }),
            "INCONCLUSIVE" => Ok(RareDiseaseDecision::Inconclusive {
                additional_tests_needed: action.additional_tests_needed.unwrap_or_default(),
            }),
            other => Err(malformed(format!("unknown decision '{}'", other))),
        }
    }
}
