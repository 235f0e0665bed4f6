use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Synthetic question label for free-text information added to a round.
pub const ADDITIONAL_INFORMATION_LABEL: &str = "Additional Information";

/// One question/answer exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QaPair {
    pub question: String,
    pub answer: String,
}

impl QaPair {
    pub fn new(question: impl Into<String>, answer: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            answer: answer.into(),
        }
    }
}

/// Ordered, append-only transcript of every exchange in a session.
///
/// Duplicate questions across rounds are kept; the engine tells them apart
/// by position.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationHistory {
    entries: Vec<QaPair>,
}

impl ConversationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Concatenate entries to the end of the transcript
    pub fn append(&mut self, entries: impl IntoIterator<Item = QaPair>) {
        self.entries.extend(entries);
    }

    /// Full ordered transcript for the next engine request
    pub fn snapshot(&self) -> Vec<QaPair> {
        self.entries.clone()
    }

    pub fn entries(&self) -> &[QaPair] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Build the transcript entries for one round.
///
/// Every question gets an entry (unanswered ones with an empty answer).
/// Additional information is appended as a final entry only when it has
/// non-whitespace content.
pub fn round_entries(
    questions: &[String],
    answers: &BTreeMap<usize, String>,
    additional_info: &str,
) -> Vec<QaPair> {
    let mut entries: Vec<QaPair> = questions
        .iter()
        .enumerate()
        .map(|(index, question)| {
            QaPair::new(
                question.clone(),
                answers.get(&index).cloned().unwrap_or_default(),
            )
        })
        .collect();

    let additional = additional_info.trim();
    if !additional.is_empty() {
        entries.push(QaPair::new(ADDITIONAL_INFORMATION_LABEL, additional));
    }

    entries
}
