//
// goals.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

use serde::Deserialize;
use serde::Serialize;
use tower_lsp::lsp_types::Position;
use tower_lsp::lsp_types::Range;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Goal {
    pub id: String,
    pub hypotheses: Vec<String>,
    pub conclusion: String,
}

/// The proof state as the prover renders it: the focused goals plus the
/// surrounding stacks.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProofView {
    pub goals: Vec<Goal>,
    pub background: Vec<Goal>,
    pub shelved: Vec<Goal>,
    pub abandoned: Vec<Goal>,
}

/// One entry of an Ltac profiling report; children are sub-tactics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LtacProfEntry {
    pub name: String,
    pub total: f64,
    pub self_time: f64,
    pub num_calls: u64,
    pub max_time: f64,
    pub children: Vec<LtacProfEntry>,
}

/// Outcome of a goal request, annotated with the focused position on egress.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GoalResult {
    NotRunning,

    NoProof {
        focus: Position,
    },

    ProofView {
        goals: ProofView,
        focus: Position,
    },

    Failure {
        message: String,
        range: Option<Range>,
        focus: Position,
    },

    Interrupted {
        focus: Position,
    },
}

/// Outcome of a stepping or query command, annotated with the focused
/// position on egress.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommandResult {
    NotRunning,

    Success {
        focus: Position,
    },

    Failure {
        message: String,
        range: Range,
        focus: Position,
    },

    Interrupted {
        focus: Position,
    },
}

impl CommandResult {
    pub fn focus(&self) -> Option<Position> {
        match self {
            CommandResult::NotRunning => None,
            CommandResult::Success { focus } => Some(*focus),
            CommandResult::Failure { focus, .. } => Some(*focus),
            CommandResult::Interrupted { focus } => Some(*focus),
        }
    }
}
