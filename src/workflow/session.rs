//! Session context and the workflow aggregate.
//!
//! [`DiagnosisWorkflow`] ties the round controller, the rare sub-flow and
//! the resolver together. It never performs I/O: `begin_*` methods return
//! the request to send and `apply_*` methods take the engine's result.
//! Timestamps are passed in so archive entries are deterministic in tests.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::candidate::{ArchivedDiagnosis, DiagnosisCandidate, RareDiseaseDecision};
use super::conversation::{ConversationHistory, QaPair};
use super::rare::{RareFlow, RareStage, SymptomOutcome};
use super::resolver::{FinalDiagnosisResolver, Resolution, TerminalTrigger};
use super::rounds::{RoundApplication, RoundController, RoundPhase, RoundSubmission};
use crate::config::WorkflowConfig;
use crate::engine::{
    AskRequest, AskTurn, CurrentDiagnoses, EngineDiagnoses, FollowUpRequest, ModelConfig,
    PatientInfo, PatientSnapshot, PatientSubmission, TestResultRequest, TestResultResponse,
};
use crate::error::{EngineResult, WorkflowError, WorkflowResult};

/// Everything a session needs to talk to the engine on the patient's behalf
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionContext {
    pub session_id: String,
    /// Engine-side conversation id, learned from the first response.
    pub conversation_id: Option<i64>,
    pub patient: PatientInfo,
    pub model: Option<ModelConfig>,
}

impl SessionContext {
    /// New context with a fresh session id
    pub fn new(patient: PatientInfo) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            conversation_id: None,
            patient,
            model: None,
        }
    }

    /// Forward a model override with every request
    pub fn with_model(mut self, model: Option<ModelConfig>) -> Self {
        self.model = model;
        self
    }

    pub fn patient_snapshot(&self) -> PatientSnapshot {
        PatientSnapshot {
            patient: self.patient.clone(),
            model: self.model.clone(),
        }
    }

    pub fn submission(&self) -> PatientSubmission {
        PatientSubmission {
            patient: self.patient_snapshot(),
        }
    }
}

/// Result of applying a follow-up round
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RoundOutcome {
    /// Candidates replaced; another round may follow.
    RoundApplied {
        round_index: u32,
        offers_another: bool,
    },
    /// Only one candidate came back.
    Converged { resolution: Resolution },
    /// The final round forced a single candidate.
    ForcedConvergence { resolution: Resolution },
}

/// Result of applying a rare-disease test verdict
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DecisionOutcome {
    /// The rare candidate became the final diagnosis.
    Promoted { resolution: Resolution },
    /// The rare candidate left the active rare set.
    RuledOut { candidate: String },
    /// More tests are needed; nothing changed.
    Inconclusive { additional_tests_needed: Vec<String> },
    /// Decision recorded without its action flag; nothing changed.
    Recorded { decision: RareDiseaseDecision },
}

/// Rare candidate with its sub-flow progress, for status views
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RareCandidateStatus {
    pub candidate: DiagnosisCandidate,
    pub stage: RareStage,
    pub selected_tests: BTreeSet<String>,
    pub results: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<RareDiseaseDecision>,
}

/// Point-in-time view of a session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowStatus {
    pub session_id: String,
    pub conversation_id: Option<i64>,
    pub phase: RoundPhase,
    pub round_index: u32,
    pub max_rounds: u32,
    pub offers_follow_up: bool,
    pub disclaimer: String,
    pub common_candidates: Vec<DiagnosisCandidate>,
    pub follow_up_questions: Vec<String>,
    pub rare_candidates: Vec<RareCandidateStatus>,
    pub final_diagnosis: Option<DiagnosisCandidate>,
    pub archive_size: usize,
    pub transcript_len: usize,
    pub questions_asked: usize,
}

/// A diagnostic refinement session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosisWorkflow {
    context: SessionContext,
    rounds: RoundController,
    rare: RareFlow,
    resolver: FinalDiagnosisResolver,
    /// Free-form questions and answers, kept apart from the round transcript.
    #[serde(default)]
    ask_history: ConversationHistory,
}

impl DiagnosisWorkflow {
    /// Start from the engine's answer to the initial submission.
    ///
    /// A single initial candidate settles the diagnosis straight away.
    pub fn new(
        mut context: SessionContext,
        initial: EngineDiagnoses,
        config: &WorkflowConfig,
        at: DateTime<Utc>,
    ) -> Self {
        if context.conversation_id.is_none() {
            context.conversation_id = initial.conversation_id;
        }

        let mut rare = RareFlow::new();
        rare.observe(initial.rare_diagnoses.as_deref());

        let mut workflow = Self {
            rounds: RoundController::new(&initial, config.max_rounds),
            context,
            rare,
            resolver: FinalDiagnosisResolver::new(),
            ask_history: ConversationHistory::new(),
        };
        workflow.sync_rare_candidates();

        info!(
            session_id = %workflow.context.session_id,
            common = initial.common_diagnoses.len(),
            rare = workflow.rare.active_candidates().len(),
            questions = initial.follow_up_questions.len(),
            "Diagnosis session started"
        );

        workflow.settle_single_candidate(at);
        workflow
    }

    fn settle_single_candidate(&mut self, at: DateTime<Utc>) -> Option<Resolution> {
        if !self.rounds.is_converged() {
            return None;
        }
        let candidate = self.rounds.common_candidates().first()?.clone();
        self.rounds.mark_terminal();
        self.resolver
            .resolve(TerminalTrigger::SingleCandidate { candidate }, at)
    }

    /// Once a rare set is preserved the round state mirrors it, whatever
    /// later responses carry.
    fn sync_rare_candidates(&mut self) {
        if self.rare.is_preserved() {
            self.rounds
                .set_rare_candidates(Some(self.rare.active_candidates().to_vec()));
        }
    }

    /// Settle a round left in flight by an interrupted process.
    ///
    /// A snapshot saved mid-call is treated as a failed round: the increment
    /// stays and the final round becomes stuck. Returns whether anything
    /// changed.
    pub fn recover_interrupted(&mut self) -> bool {
        if self.rounds.phase() != RoundPhase::Submitting {
            return false;
        }
        warn!(
            session_id = %self.context.session_id,
            round = self.rounds.round_index(),
            "Recovering round interrupted mid-call"
        );
        self.rounds.fail_round();
        true
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    pub fn session_id(&self) -> &str {
        &self.context.session_id
    }

    pub fn rounds(&self) -> &RoundController {
        &self.rounds
    }

    pub fn rare(&self) -> &RareFlow {
        &self.rare
    }

    pub fn final_diagnosis(&self) -> Option<&DiagnosisCandidate> {
        self.resolver.final_candidate()
    }

    pub fn archive(&self) -> &[ArchivedDiagnosis] {
        self.resolver.archive()
    }

    /// Whether a follow-up round is on offer
    pub fn offers_follow_up(&self) -> bool {
        self.rounds.offers_round()
    }

    /// Build the request for the next follow-up round
    pub fn begin_round(&mut self, submission: &RoundSubmission) -> WorkflowResult<FollowUpRequest> {
        self.rounds.begin_round(&self.context, submission)
    }

    /// Build the replay of a failed final round
    pub fn begin_retry(&mut self) -> WorkflowResult<FollowUpRequest> {
        self.rounds.begin_retry()
    }

    /// Apply the engine's result for the in-flight round.
    ///
    /// Errors are reported as-is; the round counter keeps its increment.
    pub fn apply_round(
        &mut self,
        result: EngineResult<EngineDiagnoses>,
        at: DateTime<Utc>,
    ) -> WorkflowResult<RoundOutcome> {
        let response = match result {
            Ok(response) => response,
            Err(e) => {
                warn!(
                    session_id = %self.context.session_id,
                    round = self.rounds.round_index(),
                    error = %e,
                    "Follow-up round failed"
                );
                self.rounds.fail_round();
                return Err(e.into());
            }
        };

        let application = self.rounds.apply_response(&response)?;

        if self.context.conversation_id.is_none() {
            self.context.conversation_id = response.conversation_id;
        }
        self.rare.observe(response.rare_diagnoses.as_deref());
        self.sync_rare_candidates();

        match application {
            RoundApplication::Forced { returned, .. } => {
                let resolution = self
                    .resolver
                    .resolve(TerminalTrigger::ForcedConvergence { candidates: returned }, at)
                    .ok_or(WorkflowError::Stuck)?;
                Ok(RoundOutcome::ForcedConvergence { resolution })
            }
            RoundApplication::Replaced => match self.settle_single_candidate(at) {
                Some(resolution) => Ok(RoundOutcome::Converged { resolution }),
                None => Ok(RoundOutcome::RoundApplied {
                    round_index: self.rounds.round_index(),
                    offers_another: self.rounds.offers_round(),
                }),
            },
        }
    }

    pub fn record_symptom_presence(
        &mut self,
        candidate_id: &str,
        present: bool,
    ) -> WorkflowResult<SymptomOutcome> {
        self.rare.record_symptom_presence(candidate_id, present)
    }

    pub fn select_tests(
        &mut self,
        candidate_id: &str,
        tests: impl IntoIterator<Item = String>,
    ) -> WorkflowResult<BTreeSet<String>> {
        Ok(self
            .rare
            .select_tests(candidate_id, tests)?
            .selected_tests
            .clone())
    }

    pub fn toggle_test(&mut self, candidate_id: &str, test: &str) -> WorkflowResult<BTreeSet<String>> {
        Ok(self.rare.toggle_test(candidate_id, test)?.selected_tests.clone())
    }

    pub fn skip_tests(&mut self, candidate_id: &str) -> WorkflowResult<()> {
        self.rare.skip_tests(candidate_id)
    }

    /// Validate results and build the test submission.
    ///
    /// Nothing changes when validation fails.
    pub fn begin_test_submission(
        &mut self,
        candidate_id: &str,
        results: &BTreeMap<String, String>,
    ) -> WorkflowResult<TestResultRequest> {
        let prepared = self.rare.prepare_submission(candidate_id, results)?;

        debug!(
            session_id = %self.context.session_id,
            candidate = %candidate_id,
            tests = prepared.test_names.len(),
            "Submitting rare-disease test results"
        );

        Ok(TestResultRequest {
            test_names: prepared.test_names,
            results: prepared.results,
            rare_disease_id: prepared.candidate.diagnosis,
            conversation_id: self.context.conversation_id,
            patient_info: self.context.patient_snapshot(),
            current_diagnoses: CurrentDiagnoses {
                common_diagnoses: self.rounds.common_candidates().to_vec(),
                rare_diagnoses: self.rare.active_candidates().to_vec(),
            },
            model: self.context.model.clone(),
        })
    }

    /// Apply the engine's verdict on a test submission.
    ///
    /// On failure the candidate stays submitted and can be sent again.
    pub fn apply_test_decision(
        &mut self,
        candidate_id: &str,
        result: EngineResult<TestResultResponse>,
        at: DateTime<Utc>,
    ) -> WorkflowResult<DecisionOutcome> {
        let candidate = self
            .rare
            .active_candidates()
            .iter()
            .find(|c| c.diagnosis == candidate_id)
            .cloned()
            .ok_or_else(|| WorkflowError::UnknownRareCandidate {
                candidate: candidate_id.to_string(),
            })?;

        let decision = result?.into_decision(&candidate)?;
        self.rare.record_decision(candidate_id, &decision)?;
        self.sync_rare_candidates();

        info!(
            session_id = %self.context.session_id,
            candidate = %candidate_id,
            decision = decision.label(),
            "Rare-disease decision received"
        );

        let outcome = match decision {
            RareDiseaseDecision::Confirm {
                becomes_terminal: true,
                updated_candidate,
            } => {
                let displaced = self.rounds.common_candidates().to_vec();
                let trigger = TerminalTrigger::RareConfirmed {
                    confirmed: updated_candidate.clone(),
                    displaced,
                };
                match self.resolver.resolve(trigger, at) {
                    Some(resolution) => {
                        self.rounds.promote(updated_candidate);
                        self.rare.clear();
                        self.sync_rare_candidates();
                        DecisionOutcome::Promoted { resolution }
                    }
                    None => DecisionOutcome::Recorded {
                        decision: RareDiseaseDecision::Confirm {
                            becomes_terminal: true,
                            updated_candidate,
                        },
                    },
                }
            }
            RareDiseaseDecision::RuleOut { dismissed: true } => DecisionOutcome::RuledOut {
                candidate: candidate_id.to_string(),
            },
            RareDiseaseDecision::Inconclusive {
                additional_tests_needed,
            } => DecisionOutcome::Inconclusive {
                additional_tests_needed,
            },
            decision => DecisionOutcome::Recorded { decision },
        };

        Ok(outcome)
    }

    pub fn ask_history(&self) -> &ConversationHistory {
        &self.ask_history
    }

    /// Build a free-form question about the current candidates.
    ///
    /// Allowed in any phase. The question is not recorded until answered.
    pub fn begin_ask(&self, question: &str) -> WorkflowResult<AskRequest> {
        let question = question.trim();
        if question.is_empty() {
            return Err(WorkflowError::Validation {
                field: "question".to_string(),
                reason: "question is empty".to_string(),
            });
        }

        let mut conversation_history: Vec<AskTurn> =
            self.ask_history.entries().iter().map(AskTurn::from).collect();
        conversation_history.push(AskTurn {
            question: question.to_string(),
            response: None,
        });

        Ok(AskRequest {
            original_patient_info: self.context.patient_snapshot(),
            initial_response: self.rounds.initial_response(),
            follow_up_question: question.to_string(),
            conversation_history,
            model: self.context.model.clone(),
        })
    }

    /// Record the engine's answer. A failed call records nothing.
    pub fn apply_ask(
        &mut self,
        request: &AskRequest,
        result: EngineResult<String>,
    ) -> WorkflowResult<QaPair> {
        let answer = result?;
        let pair = QaPair::new(request.follow_up_question.clone(), answer);
        self.ask_history.append([pair.clone()]);

        debug!(
            session_id = %self.context.session_id,
            asked = self.ask_history.len(),
            "Free-form question answered"
        );
        Ok(pair)
    }

    /// Current view of the session
    pub fn status(&self) -> WorkflowStatus {
        let state = self.rounds.state();
        let rare_candidates = self
            .rare
            .active_candidates()
            .iter()
            .map(|candidate| {
                let track = self.rare.track(&candidate.diagnosis).cloned().unwrap_or_default();
                RareCandidateStatus {
                    candidate: candidate.clone(),
                    stage: track.stage,
                    selected_tests: track.selected_tests,
                    results: track.results,
                    decision: track.decision,
                }
            })
            .collect();

        WorkflowStatus {
            session_id: self.context.session_id.clone(),
            conversation_id: self.context.conversation_id,
            phase: self.rounds.phase(),
            round_index: state.round_index,
            max_rounds: self.rounds.max_rounds(),
            offers_follow_up: self.rounds.offers_round(),
            disclaimer: state.disclaimer.clone(),
            common_candidates: state.common_candidates.clone(),
            follow_up_questions: state.follow_up_questions.clone(),
            rare_candidates,
            final_diagnosis: self.resolver.final_candidate().cloned(),
            archive_size: self.resolver.archive().len(),
            transcript_len: self.rounds.conversation().len(),
            questions_asked: self.ask_history.len(),
        }
    }
}
