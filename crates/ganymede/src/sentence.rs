//
// sentence.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

use serde::Serialize;
use tower_lsp::lsp_types::Range;

use crate::prover::StateId;

/// Index of a sentence in the STM's arena. Parent links and the spine refer
/// to sentences by id, never by pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SentenceId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SentenceStatus {
    Parsed,
    Processing,
    InProgress,
    Incomplete,
    Processed,
    Complete,
    Error,
    Cleared,
}

impl SentenceStatus {
    /// Execution progress rank used to keep status updates monotone.
    /// `InProgress` and `Incomplete` share a rank and may alternate.
    fn rank(self) -> u8 {
        match self {
            SentenceStatus::Parsed => 0,
            SentenceStatus::Processing => 1,
            SentenceStatus::InProgress => 2,
            SentenceStatus::Incomplete => 2,
            SentenceStatus::Processed => 3,
            SentenceStatus::Complete => 4,
            SentenceStatus::Error => 5,
            SentenceStatus::Cleared => 6,
        }
    }

    /// Whether a prover-driven transition to `next` is admissible. `Cleared`
    /// is terminal and only ever set by a rewind, not by an event.
    pub(crate) fn advances_to(self, next: SentenceStatus) -> bool {
        if self == SentenceStatus::Cleared || next == SentenceStatus::Cleared {
            return false;
        }
        if next == SentenceStatus::Error {
            return true;
        }
        if self.rank() == 2 && next.rank() == 2 {
            // InProgress <-> Incomplete may flip as the prover re-enters a
            // subproof
            return self != next;
        }
        next.rank() > self.rank()
    }

    pub fn highlight(self) -> HighlightStyle {
        match self {
            SentenceStatus::Parsed => HighlightStyle::Parsing,
            SentenceStatus::Processing => HighlightStyle::Processing,
            SentenceStatus::InProgress => HighlightStyle::InProgress,
            SentenceStatus::Incomplete => HighlightStyle::Incomplete,
            SentenceStatus::Processed => HighlightStyle::Processed,
            SentenceStatus::Complete => HighlightStyle::Complete,
            SentenceStatus::Error => HighlightStyle::TacticFailure,
            SentenceStatus::Cleared => HighlightStyle::Clear,
        }
    }
}

/// The closed set of client-side highlight styles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HighlightStyle {
    Clear,
    Parsing,
    Processing,
    InProgress,
    Incomplete,
    Processed,
    Complete,
    TacticFailure,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HighlightUpdate {
    pub style: HighlightStyle,
    pub range: Range,
}

/// An error attached to a sentence by a prover event or a failed add. The
/// range is document-absolute and shifts together with the sentence.
#[derive(Debug, Clone, PartialEq)]
pub struct SentenceError {
    pub range: Range,
    pub message: String,
}

/// One delimited unit of the script, mirrored against a prover state.
#[derive(Debug, Clone)]
pub struct Sentence {
    pub id: SentenceId,

    /// Token returned by the prover once the sentence was successfully
    /// added; present iff the add was acknowledged.
    pub state_id: Option<StateId>,

    /// Current span in the document. Shifts when preceding text changes
    /// passively.
    pub range: Range,

    /// The exact command text as sent, for round-trip diagnostics.
    pub text: String,

    pub status: SentenceStatus,

    /// The sentence whose state was the `edit_at` base when this one was
    /// added. Forms a forest mirroring the prover's DAG; linear progress
    /// degenerates to a list.
    pub parent: Option<SentenceId>,

    pub errors: Vec<SentenceError>,
}
