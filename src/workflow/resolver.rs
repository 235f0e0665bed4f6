//! Final-diagnosis resolver.
//!
//! Every transition that settles on a final diagnosis passes through
//! [`FinalDiagnosisResolver::resolve`], which picks the final candidate and
//! appends displaced candidates to the archive. The archive only ever grows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::candidate::{ArchivedDiagnosis, DiagnosisCandidate};

/// What settled the diagnosis
#[derive(Debug, Clone, PartialEq)]
pub enum TerminalTrigger {
    /// Final round reached; `candidates` are the engine's candidates in
    /// engine order. The first one wins.
    ForcedConvergence { candidates: Vec<DiagnosisCandidate> },
    /// Exactly one common candidate remained.
    SingleCandidate { candidate: DiagnosisCandidate },
    /// A rare candidate was confirmed and replaces `displaced`.
    RareConfirmed {
        confirmed: DiagnosisCandidate,
        displaced: Vec<DiagnosisCandidate>,
    },
}

impl TerminalTrigger {
    pub fn label(&self) -> &'static str {
        match self {
            TerminalTrigger::ForcedConvergence { .. } => "forced_convergence",
            TerminalTrigger::SingleCandidate { .. } => "single_candidate",
            TerminalTrigger::RareConfirmed { .. } => "rare_confirmed",
        }
    }
}

/// Result of one resolution
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    pub final_candidate: DiagnosisCandidate,
    pub archived_additions: Vec<ArchivedDiagnosis>,
}

/// Holds the final diagnosis and the archive ledger.
///
/// Calling [`resolve`](Self::resolve) once per terminal transition is up to
/// the caller; a second call files another set of archive entries and
/// replaces the final candidate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FinalDiagnosisResolver {
    final_candidate: Option<DiagnosisCandidate>,
    archive: Vec<ArchivedDiagnosis>,
}

impl FinalDiagnosisResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn final_candidate(&self) -> Option<&DiagnosisCandidate> {
        self.final_candidate.as_ref()
    }

    pub fn archive(&self) -> &[ArchivedDiagnosis] {
        &self.archive
    }

    /// Settle on a final diagnosis.
    ///
    /// Returns `None` only for a forced convergence with no candidates.
    pub fn resolve(&mut self, trigger: TerminalTrigger, at: DateTime<Utc>) -> Option<Resolution> {
        let label = trigger.label();

        let (final_candidate, archived_additions) = match trigger {
            TerminalTrigger::ForcedConvergence { candidates } => {
                let mut candidates = candidates.into_iter();
                let chosen = candidates.next()?;
                let reason = format!(
                    "Not selected at final follow-up round; converged on {}",
                    chosen.diagnosis
                );
                let additions = candidates
                    .filter(|c| c.diagnosis != chosen.diagnosis)
                    .map(|c| ArchivedDiagnosis::from_candidate(&c, at, reason.clone()))
                    .collect();
                (chosen, additions)
            }
            TerminalTrigger::SingleCandidate { candidate } => (candidate, Vec::new()),
            TerminalTrigger::RareConfirmed {
                confirmed,
                displaced,
            } => {
                let reason = format!("Test confirmed rare disease: {}", confirmed.diagnosis);
                let additions = displaced
                    .iter()
                    .map(|c| ArchivedDiagnosis::from_candidate(c, at, reason.clone()))
                    .collect();
                (confirmed, additions)
            }
        };

        self.archive.extend(archived_additions.iter().cloned());
        self.final_candidate = Some(final_candidate.clone());

        info!(
            trigger = label,
            final_diagnosis = %final_candidate.diagnosis,
            archived = archived_additions.len(),
            archive_size = self.archive.len(),
            "Final diagnosis resolved"
        );

        Some(Resolution {
            final_candidate,
            archived_additions,
        })
    }
}
