//! Follow-up round controller.
//!
//! Owns the [`RoundState`] and the conversation transcript. The controller
//! never talks to the engine itself: [`RoundController::begin_round`]
//! produces the request and [`RoundController::apply_response`] consumes
//! the engine's answer.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::candidate::DiagnosisCandidate;
use super::conversation::{round_entries, ConversationHistory};
use super::SessionContext;
use crate::engine::{ConversationTurn, EngineDiagnoses, FollowUpRequest, InitialResponse};
use crate::error::{WorkflowError, WorkflowResult};

/// Candidate set and questions for the current round
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoundState {
    /// Completed (or in-flight) rounds, `0..=max_rounds`.
    pub round_index: u32,
    pub disclaimer: String,
    pub common_candidates: Vec<DiagnosisCandidate>,
    /// Rare candidates on offer; once a rare set is preserved, that set.
    pub rare_candidates: Option<Vec<DiagnosisCandidate>>,
    pub follow_up_questions: Vec<String>,
}

/// Where the controller is in its round cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundPhase {
    /// Between rounds.
    Initial,
    /// The caller is collecting answers for the next round.
    AwaitingAnswers,
    /// A round request is with the engine.
    Submitting,
    /// The final round's engine call failed; only a retry of that round
    /// can move on.
    Stuck,
    /// A final diagnosis exists; no more rounds.
    Terminal,
}

impl RoundPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoundPhase::Initial => "initial",
            RoundPhase::AwaitingAnswers => "awaiting_answers",
            RoundPhase::Submitting => "submitting",
            RoundPhase::Stuck => "stuck",
            RoundPhase::Terminal => "terminal",
        }
    }
}

impl std::fmt::Display for RoundPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Answers for one round
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoundSubmission {
    /// Answers keyed by follow-up question index.
    #[serde(default)]
    pub answers: BTreeMap<usize, String>,
    /// Free-text information beyond the questions.
    #[serde(default)]
    pub additional_info: String,
}

impl RoundSubmission {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer question `index`
    pub fn answer(mut self, index: usize, answer: impl Into<String>) -> Self {
        self.answers.insert(index, answer.into());
        self
    }

    /// Set the additional information text
    pub fn with_additional_info(mut self, info: impl Into<String>) -> Self {
        self.additional_info = info.into();
        self
    }
}

/// How an engine response was applied to the round state
#[derive(Debug, Clone, PartialEq)]
pub enum RoundApplication {
    /// Candidates and questions replaced verbatim.
    Replaced,
    /// The final round: only `chosen` survives out of `returned`.
    Forced {
        chosen: DiagnosisCandidate,
        returned: Vec<DiagnosisCandidate>,
    },
}

/// Drives up to `max_rounds` follow-up rounds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundController {
    state: RoundState,
    phase: RoundPhase,
    conversation: ConversationHistory,
    max_rounds: u32,
    /// Last request sent; replayed by a final-round retry.
    pending: Option<FollowUpRequest>,
}

impl RoundController {
    /// Start at round 0 from the initial engine response
    pub fn new(initial: &EngineDiagnoses, max_rounds: u32) -> Self {
        Self {
            state: RoundState {
                round_index: 0,
                disclaimer: initial.disclaimer.clone(),
                common_candidates: initial.common_diagnoses.clone(),
                rare_candidates: initial.rare_diagnoses.clone(),
                follow_up_questions: initial.follow_up_questions.clone(),
            },
            phase: RoundPhase::Initial,
            conversation: ConversationHistory::new(),
            max_rounds,
            pending: None,
        }
    }

    pub fn state(&self) -> &RoundState {
        &self.state
    }

    pub fn phase(&self) -> RoundPhase {
        self.phase
    }

    pub fn conversation(&self) -> &ConversationHistory {
        &self.conversation
    }

    pub fn round_index(&self) -> u32 {
        self.state.round_index
    }

    pub fn max_rounds(&self) -> u32 {
        self.max_rounds
    }

    pub fn common_candidates(&self) -> &[DiagnosisCandidate] {
        &self.state.common_candidates
    }

    /// Current candidates and questions in the engine's request shape
    pub fn initial_response(&self) -> InitialResponse {
        InitialResponse {
            disclaimer: self.state.disclaimer.clone(),
            diagnoses: self.state.common_candidates.clone(),
            follow_up_questions: self.state.follow_up_questions.clone(),
        }
    }

    /// Exactly one common candidate left
    pub fn is_converged(&self) -> bool {
        self.state.common_candidates.len() == 1
    }

    /// Whether another round should be offered.
    ///
    /// Requires more than one candidate, at least one question, rounds
    /// left, and a phase that is neither terminal nor stuck.
    pub fn offers_round(&self) -> bool {
        self.state.common_candidates.len() > 1
            && !self.state.follow_up_questions.is_empty()
            && self.state.round_index < self.max_rounds
            && matches!(self.phase, RoundPhase::Initial | RoundPhase::AwaitingAnswers)
    }

    /// Reason a round is not on offer, for error reporting
    fn not_offered_reason(&self) -> String {
        if self.phase == RoundPhase::Terminal {
            "a final diagnosis has been reached".to_string()
        } else if self.phase == RoundPhase::Submitting {
            "a round is already being submitted".to_string()
        } else if self.state.round_index >= self.max_rounds {
            format!("all {} rounds have been used", self.max_rounds)
        } else if self.state.common_candidates.len() <= 1 {
            "only one candidate remains".to_string()
        } else {
            "the engine asked no follow-up questions".to_string()
        }
    }

    /// Caller opened the question form
    pub fn open_round(&mut self) -> WorkflowResult<()> {
        self.ensure_offered()?;
        self.phase = RoundPhase::AwaitingAnswers;
        Ok(())
    }

    /// Caller dismissed the question form without submitting
    pub fn close_round(&mut self) {
        if self.phase == RoundPhase::AwaitingAnswers {
            self.phase = RoundPhase::Initial;
        }
    }

    fn ensure_offered(&self) -> WorkflowResult<()> {
        if self.phase == RoundPhase::Stuck {
            return Err(WorkflowError::Stuck);
        }
        if !self.offers_round() {
            return Err(WorkflowError::RoundNotOffered {
                reason: self.not_offered_reason(),
            });
        }
        Ok(())
    }

    /// Build the next round's request.
    ///
    /// The transcript grows and the round counter advances here, before the
    /// engine is called; a failed call does not give the round back.
    pub fn begin_round(
        &mut self,
        context: &SessionContext,
        submission: &RoundSubmission,
    ) -> WorkflowResult<FollowUpRequest> {
        self.ensure_offered()?;

        let question_count = self.state.follow_up_questions.len();
        if let Some(index) = submission.answers.keys().find(|i| **i >= question_count) {
            return Err(WorkflowError::Validation {
                field: "answers".to_string(),
                reason: format!(
                    "answer for question {} but only {} questions were asked",
                    index, question_count
                ),
            });
        }

        let entries = round_entries(
            &self.state.follow_up_questions,
            &submission.answers,
            &submission.additional_info,
        );
        self.conversation.append(entries);

        let follow_up_answers = (0..question_count)
            .map(|i| submission.answers.get(&i).cloned().unwrap_or_default())
            .collect();

        let request = FollowUpRequest {
            original_patient_info: context.patient_snapshot(),
            initial_response: self.initial_response(),
            follow_up_answers,
            additional_info: submission.additional_info.trim().to_string(),
            conversation_history: self
                .conversation
                .entries()
                .iter()
                .map(ConversationTurn::from)
                .collect(),
            model: context.model.clone(),
        };

        self.state.round_index += 1;
        self.phase = RoundPhase::Submitting;
        self.pending = Some(request.clone());

        info!(
            session_id = %context.session_id,
            round = self.state.round_index,
            max_rounds = self.max_rounds,
            transcript = self.conversation.len(),
            "Follow-up round submitted"
        );

        Ok(request)
    }

    /// Replay the final round's request after it failed
    pub fn begin_retry(&mut self) -> WorkflowResult<FollowUpRequest> {
        if self.phase != RoundPhase::Stuck {
            return Err(WorkflowError::RoundNotOffered {
                reason: "only a failed final round can be retried".to_string(),
            });
        }
        let request = self.pending.clone().ok_or(WorkflowError::Stuck)?;
        self.phase = RoundPhase::Submitting;
        debug!(round = self.state.round_index, "Retrying final follow-up round");
        Ok(request)
    }

    /// Whether the in-flight round is the last one
    pub fn is_final_round(&self) -> bool {
        self.state.round_index >= self.max_rounds
    }

    /// The engine call for the in-flight round failed.
    ///
    /// The counter stays where it is. Failing the final round leaves the
    /// controller stuck rather than falling back to earlier candidates.
    pub fn fail_round(&mut self) {
        if self.phase != RoundPhase::Submitting {
            return;
        }
        if self.is_final_round() {
            warn!(round = self.state.round_index, "Final follow-up round failed");
            self.phase = RoundPhase::Stuck;
        } else {
            self.phase = RoundPhase::Initial;
        }
    }

    /// Apply the engine's response to the in-flight round.
    ///
    /// On the final round the first returned common candidate is kept and
    /// the questions are cleared; an empty candidate list fails the round.
    /// Earlier rounds replace candidates and questions verbatim, and rare
    /// candidates only when the engine sent some.
    pub fn apply_response(&mut self, response: &EngineDiagnoses) -> WorkflowResult<RoundApplication> {
        if self.phase != RoundPhase::Submitting {
            return Err(WorkflowError::RoundNotOffered {
                reason: "no round is being submitted".to_string(),
            });
        }

        if response.rare_diagnoses.is_some() {
            self.state.rare_candidates = response.rare_diagnoses.clone();
        }
        self.state.disclaimer = response.disclaimer.clone();

        if self.is_final_round() {
            let Some(chosen) = response.common_diagnoses.first().cloned() else {
                self.phase = RoundPhase::Stuck;
                return Err(WorkflowError::Engine(
                    crate::error::EngineError::MalformedResponse {
                        message: "final round returned no common candidates".to_string(),
                    },
                ));
            };

            self.state.common_candidates = vec![chosen.clone()];
            self.state.follow_up_questions.clear();
            self.pending = None;
            self.phase = RoundPhase::Terminal;

            info!(
                round = self.state.round_index,
                returned = response.common_diagnoses.len(),
                chosen = %chosen.diagnosis,
                "Final round forced convergence"
            );

            return Ok(RoundApplication::Forced {
                chosen,
                returned: response.common_diagnoses.clone(),
            });
        }

        self.state.common_candidates = response.common_diagnoses.clone();
        self.state.follow_up_questions = response.follow_up_questions.clone();
        self.pending = None;
        self.phase = RoundPhase::Initial;

        debug!(
            round = self.state.round_index,
            candidates = self.state.common_candidates.len(),
            questions = self.state.follow_up_questions.len(),
            "Round applied"
        );

        Ok(RoundApplication::Replaced)
    }

    /// Make `candidate` the only common candidate and stop offering rounds
    pub fn promote(&mut self, candidate: DiagnosisCandidate) {
        self.state.common_candidates = vec![candidate];
        self.state.follow_up_questions.clear();
        self.pending = None;
        self.phase = RoundPhase::Terminal;
    }

    /// Stop offering rounds without changing candidates
    pub fn mark_terminal(&mut self) {
        self.pending = None;
        self.phase = RoundPhase::Terminal;
    }

    /// Replace the rare list held in the round state
    pub fn set_rare_candidates(&mut self, rare: Option<Vec<DiagnosisCandidate>>) {
        self.state.rare_candidates = rare;
    }
}
