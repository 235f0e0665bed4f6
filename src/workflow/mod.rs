//! Diagnostic refinement workflow.
//!
//! A session starts from the engine's first candidate set and narrows it
//! through up to three follow-up rounds. In parallel, each rare candidate
//! can be checked through symptom questions and lab tests. Whichever path
//! settles on a single candidate goes through the resolver, which archives
//! whatever it displaces.
//!
//! - [`conversation`]: the question/answer transcript
//! - [`rounds`]: follow-up round controller
//! - [`rare`]: rare-disease confirmation sub-flow
//! - [`resolver`]: final diagnosis and archive ledger
//! - [`session`]: the [`DiagnosisWorkflow`] aggregate
//! - [`runner`]: async driver over an [`EngineClient`](crate::engine::EngineClient)

pub mod candidate;
pub mod conversation;
pub mod rare;
pub mod resolver;
pub mod rounds;
pub mod runner;
pub mod session;

pub use candidate::{ArchivedDiagnosis, DiagnosisCandidate, RareDiseaseDecision};
pub use conversation::{ConversationHistory, QaPair, ADDITIONAL_INFORMATION_LABEL};
pub use rare::{RareFlow, RareStage, RareTrack, SymptomOutcome};
pub use resolver::{FinalDiagnosisResolver, Resolution, TerminalTrigger};
pub use rounds::{RoundApplication, RoundController, RoundPhase, RoundState, RoundSubmission};
pub use runner::{with_cancellation, WorkflowRunner};
pub use session::{
    DecisionOutcome, DiagnosisWorkflow, RareCandidateStatus, RoundOutcome, SessionContext,
    WorkflowStatus,
};
