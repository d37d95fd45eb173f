//
// prover.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

use std::fmt;
use std::sync::Arc;

use crossbeam::channel::Receiver;
use serde::Deserialize;
use serde::Serialize;
use tower_lsp::lsp_types::Position;
use tower_lsp::lsp_types::Range;

use crate::cancel::CancelToken;
use crate::goals::LtacProfEntry;
use crate::goals::ProofView;

/// Opaque token for a prover-side state. Assigned by the prover on a
/// successful add; never synthesized locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StateId(pub u32);

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug)]
pub struct AddRequest<'a> {
    /// The exact sentence text, terminator included.
    pub text: &'a str,

    /// State the sentence extends.
    pub parent: StateId,

    /// Where the sentence ends in the document, so the prover can report
    /// error locations absolutely.
    pub end_position: Position,

    /// Buffer version the text was read from.
    pub version: i32,
}

#[derive(Debug, Clone, Copy)]
pub struct Added {
    pub state_id: StateId,

    /// When the add closed a subproof, the prover may point the tip at an
    /// earlier state.
    pub focus_hint: Option<StateId>,
}

/// Where the prover's focus landed after an `edit_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FocusChange {
    NewTip {
        state_id: StateId,
    },

    /// The rewind left a proof unfocused; the prover names both the closing
    /// state and the state now holding focus. The returned focus is
    /// authoritative.
    NewFocus {
        qed_state_id: StateId,
        focus_state_id: StateId,
    },
}

/// A rejection reported by the prover for a specific request. Ranges are
/// document-absolute.
#[derive(Debug, Clone, PartialEq)]
pub struct FailureAt {
    pub state_id: Option<StateId>,
    pub range: Option<Range>,
    pub message: String,
}

pub enum ProverError {
    Failure(FailureAt),
    Interrupted,
    Died(Option<String>),
}

impl std::error::Error for ProverError {}

impl fmt::Display for ProverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProverError::Failure(failure) => {
                write!(f, "Prover failure: {}", failure.message)
            },
            ProverError::Interrupted => {
                write!(f, "Prover call interrupted")
            },
            ProverError::Died(reason) => match reason {
                Some(reason) => write!(f, "Prover died: {reason}"),
                None => write!(f, "Prover died"),
            },
        }
    }
}

impl fmt::Debug for ProverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Cloneable out-of-band interrupt capability of a client.
///
/// The owner of the connection may be blocked in a synchronous call when the
/// interrupt arrives, so this handle must be deliverable from any thread and
/// must not touch the request path.
#[derive(Clone)]
pub struct Interruptor {
    signal: Arc<dyn Fn() + Send + Sync>,
}

impl Interruptor {
    pub fn new(signal: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            signal: Arc::new(signal),
        }
    }

    pub fn signal(&self) {
        (self.signal)();
    }
}

impl fmt::Debug for Interruptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Interruptor")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryKind {
    Locate,
    Check,
    Search,
    SearchAbout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageLevel {
    Debug,
    Info,
    Notice,
    Warning,
    Error,
}

/// Execution progress reported by the prover for an added sentence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    InProgress,
    Incomplete,
    Processed,
    Complete,
}

/// Asynchronous events from the prover. Status and error events are keyed on
/// `state_id`; events for states no longer on the spine are dropped by the
/// STM.
#[derive(Debug, Clone)]
pub enum ProverEvent {
    Status {
        state_id: StateId,
        status: ExecStatus,
    },

    Error {
        state_id: StateId,
        /// Document-absolute; defaults to the sentence's own range when
        /// absent.
        range: Option<Range>,
        message: String,
    },

    Message {
        level: MessageLevel,
        text: String,
        rich: Option<serde_json::Value>,
    },

    LtacProfResults {
        state_id: Option<StateId>,
        results: Vec<LtacProfEntry>,
    },

    Died {
        reason: Option<String>,
    },
}

/// Request/response and event channel to the out-of-process prover.
///
/// The STM owns the client exclusively and issues at most one request at a
/// time. Blocking calls take a `CancelToken`; a transport is expected to poll
/// it while waiting on the wire, deliver the interrupt to the process, and
/// resolve with `ProverError::Interrupted`. `interrupt` is the out-of-band
/// signal path and must be callable from any thread.
pub trait ProverClient: Send {
    /// Start (or restart) the session. Returns the initial state id and the
    /// event stream for this session; a previous session's stream, if any,
    /// is closed.
    fn init(&mut self) -> Result<(StateId, Receiver<ProverEvent>), ProverError>;

    fn add(&mut self, request: AddRequest<'_>, cancel: &CancelToken) -> Result<Added, ProverError>;

    fn edit_at(
        &mut self,
        state_id: StateId,
        cancel: &CancelToken,
    ) -> Result<FocusChange, ProverError>;

    /// Current goal state at the tip; `None` when no proof is in progress.
    fn goal(&mut self, cancel: &CancelToken) -> Result<Option<ProofView>, ProverError>;

    /// Non-mutating query evaluated at the tip.
    fn query(
        &mut self,
        kind: QueryKind,
        argument: &str,
        cancel: &CancelToken,
    ) -> Result<String, ProverError>;

    /// Asynchronously signal the prover; the pending call observes the
    /// cancellation and resolves with `Interrupted`.
    fn interrupt(&self);

    /// A handle delivering the same out-of-band signal as `interrupt`, for
    /// callers that do not own the client (the client itself may be blocked
    /// inside a request on its owner's thread).
    fn interruptor(&self) -> Interruptor;

    /// Pretty-printing width for goals and messages.
    fn resize(&mut self, columns: u32);

    /// Request Ltac profiling results; they arrive as an
    /// `LtacProfResults` event.
    fn ltac_profile(&mut self, state_id: Option<StateId>);

    fn shutdown(&mut self);
}

impl From<ExecStatus> for crate::sentence::SentenceStatus {
    fn from(status: ExecStatus) -> Self {
        match status {
            ExecStatus::InProgress => crate::sentence::SentenceStatus::InProgress,
            ExecStatus::Incomplete => crate::sentence::SentenceStatus::Incomplete,
            ExecStatus::Processed => crate::sentence::SentenceStatus::Processed,
            ExecStatus::Complete => crate::sentence::SentenceStatus::Complete,
        }
    }
}
