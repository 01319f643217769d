//! Batch construction
//!
//! Builds the position-tagged token batches handed to the backend's decode step.

use crate::inference::backend::TokenId;

/// A single token placed at a sequence position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchEntry {
    /// Token to decode
    pub token: TokenId,
    /// Position of the token in the model's sequence
    pub position: u32,
    /// Whether the decode step should produce logits for this token
    pub logits: bool,
}

/// Tokens submitted to one decode step
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenBatch {
    entries: Vec<BatchEntry>,
}

impl TokenBatch {
    /// Builds the prompt batch.
    ///
    /// Positions start at 0 and only the final token requests logits, since
    /// the first sample is drawn from the end of the prompt.
    pub fn prompt(tokens: &[TokenId]) -> Self {
        let last = tokens.len().saturating_sub(1);
        let entries = tokens
            .iter()
            .enumerate()
            .map(|(i, &token)| BatchEntry {
                token,
                position: i as u32,
                logits: i == last,
            })
            .collect();

        Self { entries }
    }

    /// Builds a single-token continuation batch at `position`.
    pub fn continuation(token: TokenId, position: u32) -> Self {
        Self {
            entries: vec![BatchEntry {
                token,
                position,
                logits: true,
            }],
        }
    }

    pub fn entries(&self) -> &[BatchEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Index inside the batch whose logits the next sample reads
    pub fn logits_index(&self) -> i32 {
        self.entries.len() as i32 - 1
    }
}
