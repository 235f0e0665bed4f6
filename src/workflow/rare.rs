//! Rare-disease confirmation sub-flow.
//!
//! Each rare candidate moves through its own small state machine:
//!
//! ```text
//! NotAsked ─┬─> SymptomAbsent
//!           └─> SymptomPresent ─> TestsSelected ─> ResultsEntered ─> Submitted ─> Resolved
//!                     └───────────────┴──> TestsSkipped
//! ```
//!
//! The first non-empty rare list seen becomes the preserved set. Later
//! engine responses cannot change it; only a rule-out or a confirmation
//! handled here can.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::candidate::{DiagnosisCandidate, RareDiseaseDecision};
use crate::error::{WorkflowError, WorkflowResult};

/// Stage of one rare candidate
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RareStage {
    #[default]
    NotAsked,
    SymptomAbsent,
    SymptomPresent,
    TestsSelected,
    ResultsEntered,
    Submitted,
    TestsSkipped,
    Resolved,
}

impl RareStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            RareStage::NotAsked => "not_asked",
            RareStage::SymptomAbsent => "symptom_absent",
            RareStage::SymptomPresent => "symptom_present",
            RareStage::TestsSelected => "tests_selected",
            RareStage::ResultsEntered => "results_entered",
            RareStage::Submitted => "submitted",
            RareStage::TestsSkipped => "tests_skipped",
            RareStage::Resolved => "resolved",
        }
    }

    /// Tests may still be chosen or changed
    fn accepts_test_selection(&self) -> bool {
        matches!(
            self,
            RareStage::SymptomPresent | RareStage::TestsSelected | RareStage::ResultsEntered
        )
    }

    /// A submission may be attempted. `Submitted` is accepted again so a
    /// failed engine call can be resent by hand.
    fn accepts_submission(&self) -> bool {
        self.accepts_test_selection() || *self == RareStage::Submitted
    }
}

impl std::fmt::Display for RareStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-candidate progress through the sub-flow
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RareTrack {
    pub stage: RareStage,
    pub selected_tests: BTreeSet<String>,
    pub results: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<RareDiseaseDecision>,
}

/// Effect of recording symptom presence
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "effect", rename_all = "snake_case")]
pub enum SymptomOutcome {
    /// Symptoms present: the caller should open test selection.
    OpenTestSelection { recommended_tests: Vec<String> },
    /// Symptoms absent: nothing more to do for this candidate.
    Closed,
}

/// Validated payload for a test submission
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedSubmission {
    pub candidate: DiagnosisCandidate,
    pub test_names: Vec<String>,
    pub results: BTreeMap<String, String>,
}

/// Owner of the preserved rare set and every candidate's track
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RareFlow {
    /// `None` until a non-empty rare list is first observed.
    preserved: Option<Vec<DiagnosisCandidate>>,
    tracks: BTreeMap<String, RareTrack>,
}

impl RareFlow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer an engine rare list. Adopted only when nothing is preserved
    /// yet and the list is non-empty; returns whether it was adopted.
    pub fn observe(&mut self, rare: Option<&[DiagnosisCandidate]>) -> bool {
        if self.preserved.is_some() {
            return false;
        }
        match rare {
            Some(list) if !list.is_empty() => {
                info!(count = list.len(), "Preserving rare candidates");
                self.preserved = Some(list.to_vec());
                true
            }
            _ => false,
        }
    }

    /// Whether a rare list has been adopted
    pub fn is_preserved(&self) -> bool {
        self.preserved.is_some()
    }

    /// The preserved rare candidates still in play
    pub fn active_candidates(&self) -> &[DiagnosisCandidate] {
        self.preserved.as_deref().unwrap_or_default()
    }

    /// Track for a candidate, `None` before anything was recorded
    pub fn track(&self, candidate_id: &str) -> Option<&RareTrack> {
        self.tracks.get(candidate_id)
    }

    /// Stage of a candidate (`NotAsked` when untouched)
    pub fn stage(&self, candidate_id: &str) -> RareStage {
        self.tracks
            .get(candidate_id)
            .map(|t| t.stage)
            .unwrap_or_default()
    }

    fn active(&self, candidate_id: &str) -> WorkflowResult<&DiagnosisCandidate> {
        self.active_candidates()
            .iter()
            .find(|c| c.diagnosis == candidate_id)
            .ok_or_else(|| WorkflowError::UnknownRareCandidate {
                candidate: candidate_id.to_string(),
            })
    }

    fn track_mut(&mut self, candidate_id: &str) -> &mut RareTrack {
        self.tracks.entry(candidate_id.to_string()).or_default()
    }

    fn invalid(&self, candidate_id: &str, action: &str) -> WorkflowError {
        WorkflowError::InvalidTransition {
            candidate: candidate_id.to_string(),
            action: action.to_string(),
            stage: self.stage(candidate_id).to_string(),
        }
    }

    /// Record whether the discriminator symptoms are present. Once recorded
    /// the answer cannot change.
    pub fn record_symptom_presence(
        &mut self,
        candidate_id: &str,
        present: bool,
    ) -> WorkflowResult<SymptomOutcome> {
        let recommended = self.active(candidate_id)?.recommended_tests().to_vec();

        if self.stage(candidate_id) != RareStage::NotAsked {
            return Err(WorkflowError::SymptomAlreadyRecorded {
                candidate: candidate_id.to_string(),
            });
        }

        let track = self.track_mut(candidate_id);
        debug!(candidate = %candidate_id, present, "Recorded symptom presence");

        if present {
            track.stage = RareStage::SymptomPresent;
            Ok(SymptomOutcome::OpenTestSelection {
                recommended_tests: recommended,
            })
        } else {
            track.stage = RareStage::SymptomAbsent;
            Ok(SymptomOutcome::Closed)
        }
    }

    /// Replace the selected tests. Blank names are dropped; results for
    /// tests no longer selected are discarded.
    pub fn select_tests(
        &mut self,
        candidate_id: &str,
        tests: impl IntoIterator<Item = String>,
    ) -> WorkflowResult<&RareTrack> {
        self.active(candidate_id)?;
        if !self.stage(candidate_id).accepts_test_selection() {
            return Err(self.invalid(candidate_id, "select tests"));
        }

        let selected: BTreeSet<String> = tests
            .into_iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();

        let track = self.track_mut(candidate_id);
        track.results.retain(|name, _| selected.contains(name));
        track.stage = if selected.is_empty() {
            RareStage::SymptomPresent
        } else {
            RareStage::TestsSelected
        };
        track.selected_tests = selected;

        Ok(track)
    }

    /// Toggle one test on or off
    pub fn toggle_test(&mut self, candidate_id: &str, test: &str) -> WorkflowResult<&RareTrack> {
        self.active(candidate_id)?;
        if !self.stage(candidate_id).accepts_test_selection() {
            return Err(self.invalid(candidate_id, "toggle tests"));
        }

        let mut selected = self.track_mut(candidate_id).selected_tests.clone();
        let name = test.trim().to_string();
        if !selected.remove(&name) {
            selected.insert(name);
        }
        self.select_tests(candidate_id, selected)
    }

    /// Close test selection without submitting
    pub fn skip_tests(&mut self, candidate_id: &str) -> WorkflowResult<()> {
        self.active(candidate_id)?;
        if !self.stage(candidate_id).accepts_test_selection() {
            return Err(self.invalid(candidate_id, "skip tests"));
        }

        let track = self.track_mut(candidate_id);
        track.selected_tests.clear();
        track.results.clear();
        track.stage = RareStage::TestsSkipped;
        Ok(())
    }

    /// Validate and stage a test submission.
    ///
    /// Needs at least one selected test and a non-blank result for each.
    /// Validation failures leave the track untouched. Results for tests
    /// that are not selected are ignored.
    pub fn prepare_submission(
        &mut self,
        candidate_id: &str,
        results: &BTreeMap<String, String>,
    ) -> WorkflowResult<PreparedSubmission> {
        let candidate = self.active(candidate_id)?.clone();
        if !self.stage(candidate_id).accepts_submission() {
            return Err(self.invalid(candidate_id, "submit test results"));
        }

        let selected = self
            .track(candidate_id)
            .map(|t| t.selected_tests.clone())
            .unwrap_or_default();

        if selected.is_empty() {
            return Err(WorkflowError::Validation {
                field: "selected_tests".to_string(),
                reason: "select at least one test".to_string(),
            });
        }

        let mut accepted = BTreeMap::new();
        for test in &selected {
            match results.get(test).map(|r| r.trim()).filter(|r| !r.is_empty()) {
                Some(result) => {
                    accepted.insert(test.clone(), result.to_string());
                }
                None => {
                    return Err(WorkflowError::Validation {
                        field: "results".to_string(),
                        reason: format!("missing result for test '{}'", test),
                    });
                }
            }
        }

        let track = self.track_mut(candidate_id);
        track.results = accepted.clone();
        track.stage = RareStage::Submitted;

        Ok(PreparedSubmission {
            candidate,
            test_names: selected.into_iter().collect(),
            results: accepted,
        })
    }

    /// Record the engine's decision for a submitted candidate.
    ///
    /// A dismissed rule-out removes the candidate from the preserved set.
    /// Promotion on confirmation is the caller's job (it has to go through
    /// the resolver); see [`RareFlow::clear`].
    pub fn record_decision(
        &mut self,
        candidate_id: &str,
        decision: &RareDiseaseDecision,
    ) -> WorkflowResult<()> {
        self.active(candidate_id)?;
        if self.stage(candidate_id) != RareStage::Submitted {
            return Err(self.invalid(candidate_id, "record a decision"));
        }

        let track = self.track_mut(candidate_id);
        track.stage = RareStage::Resolved;
        track.decision = Some(decision.clone());

        if let RareDiseaseDecision::RuleOut { dismissed: true } = decision {
            if let Some(preserved) = self.preserved.as_mut() {
                preserved.retain(|c| c.diagnosis != candidate_id);
            }
            info!(candidate = %candidate_id, "Rare candidate ruled out");
        }

        Ok(())
    }

    /// Empty the preserved set after a confirmation took over. The set
    /// stays adopted, so later engine lists are still ignored.
    pub fn clear(&mut self) {
        self.preserved = Some(Vec::new());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rare(name: &str) -> DiagnosisCandidate {
        DiagnosisCandidate::new(name, "treat", "Low")
            .with_prevalence("1 in 100,000")
            .with_discriminator_symptoms(vec!["X".to_string()])
            .with_recommended_tests(vec!["CBC".to_string(), "MRI".to_string()])
    }

    fn flow_with(names: &[&str]) -> RareFlow {
        let mut flow = RareFlow::new();
        let list: Vec<_> = names.iter().map(|n| rare(n)).collect();
        assert!(flow.observe(Some(&list)));
        flow
    }

    fn results(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_first_non_empty_list_is_preserved() {
        let mut flow = RareFlow::new();
        assert!(!flow.observe(None));
        assert!(!flow.observe(Some(&[])));
        assert!(flow.observe(Some(&[rare("R1")])));
        assert!(!flow.observe(Some(&[rare("R2"), rare("R3")])));

        let names: Vec<_> = flow.active_candidates().iter().map(|c| &c.diagnosis).collect();
        assert_eq!(names, vec!["R1"]);
    }

    #[test]
    fn test_symptom_present_opens_test_selection() {
        let mut flow = flow_with(&["R1"]);
        let outcome = flow.record_symptom_presence("R1", true).unwrap();

        assert_eq!(
            outcome,
            SymptomOutcome::OpenTestSelection {
                recommended_tests: vec!["CBC".to_string(), "MRI".to_string()]
            }
        );
        assert_eq!(flow.stage("R1"), RareStage::SymptomPresent);
    }

    #[test]
    fn test_symptom_presence_is_immutable() {
        let mut flow = flow_with(&["R1"]);
        assert_eq!(
            flow.record_symptom_presence("R1", false).unwrap(),
            SymptomOutcome::Closed
        );

        let err = flow.record_symptom_presence("R1", true).unwrap_err();
        assert!(matches!(err, WorkflowError::SymptomAlreadyRecorded { .. }));
        assert_eq!(flow.stage("R1"), RareStage::SymptomAbsent);
        assert_eq!(flow.active_candidates().len(), 1);
    }

    #[test]
    fn test_unknown_candidate_rejected() {
        let mut flow = flow_with(&["R1"]);
        assert!(matches!(
            flow.record_symptom_presence("nope", true),
            Err(WorkflowError::UnknownRareCandidate { .. })
        ));
    }

    #[test]
    fn test_tests_can_be_toggled_before_submission() {
        let mut flow = flow_with(&["R1"]);
        flow.record_symptom_presence("R1", true).unwrap();

        flow.toggle_test("R1", "CBC").unwrap();
        flow.toggle_test("R1", "MRI").unwrap();
        let track = flow.toggle_test("R1", "CBC").unwrap();

        assert_eq!(track.stage, RareStage::TestsSelected);
        assert_eq!(track.selected_tests.iter().collect::<Vec<_>>(), vec!["MRI"]);

        let track = flow.select_tests("R1", vec!["  ".to_string()]).unwrap();
        assert!(track.selected_tests.is_empty());
        assert_eq!(track.stage, RareStage::SymptomPresent);
    }

    #[test]
    fn test_selection_requires_symptom_present() {
        let mut flow = flow_with(&["R1"]);
        let err = flow.select_tests("R1", vec!["CBC".to_string()]).unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidTransition { .. }));
    }

    #[test]
    fn test_submission_without_tests_is_blocked() {
        let mut flow = flow_with(&["R1"]);
        flow.record_symptom_presence("R1", true).unwrap();

        let err = flow.prepare_submission("R1", &BTreeMap::new()).unwrap_err();

        assert!(matches!(err, WorkflowError::Validation { ref field, .. } if field == "selected_tests"));
        assert_eq!(flow.stage("R1"), RareStage::SymptomPresent);
    }

    #[test]
    fn test_submission_needs_result_per_test() {
        let mut flow = flow_with(&["R1"]);
        flow.record_symptom_presence("R1", true).unwrap();
        flow.select_tests("R1", vec!["CBC".to_string(), "MRI".to_string()])
            .unwrap();

        let err = flow
            .prepare_submission("R1", &results(&[("CBC", "abnormal"), ("MRI", " ")]))
            .unwrap_err();

        assert!(matches!(err, WorkflowError::Validation { ref field, .. } if field == "results"));
        assert_eq!(flow.stage("R1"), RareStage::TestsSelected);
    }

    #[test]
    fn test_prepared_submission_filters_unselected_results() {
        let mut flow = flow_with(&["R1"]);
        flow.record_symptom_presence("R1", true).unwrap();
        flow.select_tests("R1", vec!["CBC".to_string()]).unwrap();

        let prepared = flow
            .prepare_submission("R1", &results(&[("CBC", " abnormal "), ("MRI", "normal")]))
            .unwrap();

        assert_eq!(prepared.test_names, vec!["CBC"]);
        assert_eq!(prepared.results, results(&[("CBC", "abnormal")]));
        assert_eq!(flow.stage("R1"), RareStage::Submitted);

        // A failed engine call leaves it submitted; it can be resent.
        assert!(flow
            .prepare_submission("R1", &results(&[("CBC", "abnormal")]))
            .is_ok());
    }

    #[test]
    fn test_rule_out_removes_candidate_permanently() {
        let mut flow = flow_with(&["R1", "R2"]);
        flow.record_symptom_presence("R1", true).unwrap();
        flow.select_tests("R1", vec!["CBC".to_string()]).unwrap();
        flow.prepare_submission("R1", &results(&[("CBC", "normal")]))
            .unwrap();

        flow.record_decision("R1", &RareDiseaseDecision::RuleOut { dismissed: true })
            .unwrap();

        let names: Vec<_> = flow.active_candidates().iter().map(|c| &c.diagnosis).collect();
        assert_eq!(names, vec!["R2"]);
        assert_eq!(flow.stage("R1"), RareStage::Resolved);
        assert!(!flow.observe(Some(&[rare("R1")])));
        assert!(matches!(
            flow.record_symptom_presence("R1", true),
            Err(WorkflowError::UnknownRareCandidate { .. })
        ));
    }

    #[test]
    fn test_inconclusive_keeps_candidate() {
        let mut flow = flow_with(&["R1"]);
        flow.record_symptom_presence("R1", true).unwrap();
        flow.select_tests("R1", vec!["CBC".to_string()]).unwrap();
        flow.prepare_submission("R1", &results(&[("CBC", "borderline")]))
            .unwrap();

        let decision = RareDiseaseDecision::Inconclusive {
            additional_tests_needed: vec!["Genetic panel".to_string()],
        };
        flow.record_decision("R1", &decision).unwrap();

        assert_eq!(flow.active_candidates().len(), 1);
        assert_eq!(flow.track("R1").unwrap().decision, Some(decision));
    }

    #[test]
    fn test_skip_tests_closes_track() {
        let mut flow = flow_with(&["R1"]);
        flow.record_symptom_presence("R1", true).unwrap();
        flow.select_tests("R1", vec!["CBC".to_string()]).unwrap();

        flow.skip_tests("R1").unwrap();

        assert_eq!(flow.stage("R1"), RareStage::TestsSkipped);
        assert!(flow.prepare_submission("R1", &BTreeMap::new()).is_err());
        assert_eq!(flow.active_candidates().len(), 1);
    }

    #[test]
    fn test_clear_keeps_set_authoritative() {
        let mut flow = flow_with(&["R1"]);
        flow.clear();

        assert!(flow.is_preserved());
        assert!(flow.active_candidates().is_empty());
        assert!(!flow.observe(Some(&[rare("R9")])));
    }
}
