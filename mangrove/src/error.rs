// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for tideGraft ingestion, planning and placement.
//!
//! All parser, planner and kernel errors use [`Error`], with one variant
//! per failure mode. No external error crates — zero-dependency error type.

use std::fmt;
use std::path::PathBuf;

use tidegraft_flotilla::transport::TransportError;

/// Errors produced by tideGraft components.
#[derive(Debug)]
pub enum Error {
    /// File I/O error with path context.
    Io {
        /// Path that caused the error.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// FASTA parsing or alignment-shape error.
    Fasta(String),
    /// Newick tree parsing error.
    Newick(String),
    /// Query sequence length differs from the reference alignment length.
    InputShape {
        /// Offending query header.
        header: String,
        /// Query length in sites.
        got: usize,
        /// Reference alignment length in sites.
        expected: usize,
    },
    /// Premasking found no non-gap sites in a query.
    EmptyRange {
        /// Offending query header.
        header: String,
    },
    /// The character map rejected a sequence character.
    BadState {
        /// The rejected character.
        character: char,
        /// Site index of the rejection.
        site: usize,
    },
    /// A branch produced `-inf` log-likelihood or broke a length invariant.
    DegenerateBranch {
        /// Branch the kernel was bound to.
        branch_id: u32,
        /// What went wrong.
        detail: String,
    },
    /// Message-passing substrate returned a non-success code.
    Transport(TransportError),
    /// User memory constraint below the feasible minimum, or an unusable
    /// memory-saving configuration.
    BudgetInfeasible(String),
    /// A reloaded checkpoint disagrees with the expected reference structure.
    CheckpointMismatch(String),
    /// Invalid input parameters (dimensions, ranges, constraints).
    InvalidInput(String),
}

/// Result type alias for tideGraft operations.
pub type Result<T> = std::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => write!(f, "{}: {source}", path.display()),
            Self::Fasta(msg) => write!(f, "FASTA parse error: {msg}"),
            Self::Newick(msg) => write!(f, "Newick parse error: {msg}"),
            Self::InputShape {
                header,
                got,
                expected,
            } => write!(
                f,
                "query '{header}' has {got} sites, reference alignment has {expected}"
            ),
            Self::EmptyRange { header } => write!(
                f,
                "query '{header}' does not appear to have any non-gap sites"
            ),
            Self::BadState { character, site } => write!(
                f,
                "unmappable sequence character '{character}' at site {site}"
            ),
            Self::DegenerateBranch { branch_id, detail } => {
                write!(f, "degenerate placement at branch {branch_id}: {detail}")
            }
            Self::Transport(err) => write!(f, "transport failure: {err}"),
            Self::BudgetInfeasible(msg) => write!(f, "memory budget infeasible: {msg}"),
            Self::CheckpointMismatch(msg) => write!(f, "checkpoint mismatch: {msg}"),
            Self::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Transport(err) => Some(err),
            _ => None,
        }
    }
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        Self::Transport(err)
    }
}
