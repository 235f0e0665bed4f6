//! Value types for diagnosis candidates and their archived form.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A candidate diagnosis as produced by the engine.
///
/// Rare candidates share this shape; they usually carry `prevalence`,
/// `discriminator_symptoms` and `recommended_tests`. The diagnosis name is
/// the identity of a candidate within one response cycle only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosisCandidate {
    /// Diagnosis name.
    pub diagnosis: String,
    /// Free-text treatment recommendation.
    #[serde(default)]
    pub treatment: String,
    /// Free-text probability label ("High", "62%", ...).
    #[serde(default)]
    pub probability: String,
    /// Prevalence label, mostly present on rare candidates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prevalence: Option<String>,
    /// Symptoms that separate this candidate from the common differential.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discriminator_symptoms: Option<Vec<String>>,
    /// Tests the engine recommends to confirm or rule out the candidate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommended_tests: Option<Vec<String>>,
}

impl DiagnosisCandidate {
    /// Create a candidate with name, treatment and probability label
    pub fn new(
        diagnosis: impl Into<String>,
        treatment: impl Into<String>,
        probability: impl Into<String>,
    ) -> Self {
        Self {
            diagnosis: diagnosis.into(),
            treatment: treatment.into(),
            probability: probability.into(),
            prevalence: None,
            discriminator_symptoms: None,
            recommended_tests: None,
        }
    }

    /// Set the prevalence label
    pub fn with_prevalence(mut self, prevalence: impl Into<String>) -> Self {
        self.prevalence = Some(prevalence.into());
        self
    }

    /// Set discriminator symptoms
    pub fn with_discriminator_symptoms(mut self, symptoms: Vec<String>) -> Self {
        self.discriminator_symptoms = Some(symptoms);
        self
    }

    /// Set recommended tests
    pub fn with_recommended_tests(mut self, tests: Vec<String>) -> Self {
        self.recommended_tests = Some(tests);
        self
    }

    /// Recommended tests, empty when the engine gave none
    pub fn recommended_tests(&self) -> &[String] {
        self.recommended_tests.as_deref().unwrap_or_default()
    }

    /// Copy of this candidate with engine-supplied probability and treatment
    /// applied over the current values. Blank updates are ignored.
    pub fn merged_with(&self, probability: Option<&str>, treatment: Option<&str>) -> Self {
        let mut merged = self.clone();
        if let Some(p) = probability.map(str::trim).filter(|p| !p.is_empty()) {
            merged.probability = p.to_string();
        }
        if let Some(t) = treatment.map(str::trim).filter(|t| !t.is_empty()) {
            merged.treatment = t.to_string();
        }
        merged
    }
}

/// A candidate displaced by convergence or by rare-disease confirmation.
///
/// Entries are append-only; nothing in the crate mutates or removes one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchivedDiagnosis {
    pub diagnosis: String,
    pub treatment: String,
    pub probability: String,
    pub archived_at_epoch_seconds: i64,
    pub reason: String,
}

impl ArchivedDiagnosis {
    /// Snapshot a candidate into the archive form
    pub fn from_candidate(
        candidate: &DiagnosisCandidate,
        at: DateTime<Utc>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            diagnosis: candidate.diagnosis.clone(),
            treatment: candidate.treatment.clone(),
            probability: candidate.probability.clone(),
            archived_at_epoch_seconds: at.timestamp(),
            reason: reason.into(),
        }
    }
}

/// Outcome of a rare-disease test submission, as decided by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum RareDiseaseDecision {
    /// Tests confirm the rare disease. When `becomes_terminal` is set the
    /// candidate replaces the whole common differential.
    Confirm {
        becomes_terminal: bool,
        updated_candidate: DiagnosisCandidate,
    },
    /// Tests rule the rare disease out. `dismissed` removes it from the
    /// active rare set for good.
    RuleOut { dismissed: bool },
    /// Tests were not decisive.
    Inconclusive { additional_tests_needed: Vec<String> },
}

impl RareDiseaseDecision {
    /// Short label used in logs and status views
    pub fn label(&self) -> &'static str {
        match self {
            RareDiseaseDecision::Confirm { .. } => "confirm",
            RareDiseaseDecision::RuleOut { .. } => "rule_out",
            RareDiseaseDecision::Inconclusive { .. } => "inconclusive",
        }
    }
}
