//
// error.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

use std::fmt;

use tower_lsp::lsp_types::Range;

pub type Result<T> = std::result::Result<T, Error>;

pub enum Error {
    /// The prover session is not running. Mutating operations return this
    /// after a shutdown or a prover death, until `reset` revives the session.
    NotRunning,

    /// An edit batch arrived with a non-monotone version and was rejected.
    StaleEdit { current: i32, proposed: i32 },

    /// The prover process died (event stream closed or a `Died` event
    /// arrived) while an operation was in flight.
    ProverDied { reason: Option<String> },

    /// The prover rejected a request addressed at the current tip.
    ProverFailure {
        message: String,
        range: Option<Range>,
    },

    /// The operation was cancelled by an interrupt or a deadline.
    Interrupted,

    Internal(anyhow::Error),
}

// empty implementation required for 'anyhow'
impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotRunning => {
                write!(f, "The prover session is not running")
            },

            Error::StaleEdit { current, proposed } => {
                write!(
                    f,
                    "Stale edit: document is at version {current}, got version {proposed}"
                )
            },

            Error::ProverDied { reason } => match reason {
                Some(reason) => write!(f, "The prover died: {reason}"),
                None => write!(f, "The prover died"),
            },

            Error::ProverFailure { message, .. } => {
                write!(f, "Prover failure: {message}")
            },

            Error::Interrupted => {
                write!(f, "Operation interrupted")
            },

            Error::Internal(err) => {
                write!(f, "Internal error: {err:?}")
            },
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Internal(err)
    }
}
