//! Error types for stratus-migrate.
//!
//! Errors fall into three classes: configuration errors raised while an
//! adapter is constructed, analysis errors, and migration errors. The
//! orchestrator wraps the last two in [`Error::Phase`] so the failed phase is
//! always visible in the message.

use std::fmt;
use thiserror::Error;

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Phase of a migration run an error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Read-only source analysis.
    Analysis,
    /// Write phase against the target.
    Migration,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Analysis => f.write_str("analysis"),
            Self::Migration => f.write_str("migration"),
        }
    }
}

/// Errors that can occur during a migration.
#[derive(Error, Debug)]
pub enum Error {
    /// Missing or invalid option, detected before any I/O.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The source could not be reached or opened.
    #[error("Source connection error: {0}")]
    SourceConnection(String),

    /// The target could not be reached.
    #[error("Target connection error: {0}")]
    TargetConnection(String),

    /// Source data could not be read or parsed.
    #[error("Extraction error: {0}")]
    Extraction(String),

    /// A write against the target failed.
    #[error("Loading error: {0}")]
    Loading(String),

    /// The target already holds users and `--force` was not given.
    #[error("Target is not empty: auth.users already holds {users} row(s); re-run with --force to import anyway")]
    TargetNotEmpty {
        /// Number of users already present in the target.
        users: i64,
    },

    /// The source was recognized but has no adapter yet.
    #[error("Not implemented: {0}")]
    NotImplemented(String),

    /// The run was cancelled by the caller.
    #[error("Operation cancelled")]
    Cancelled,

    /// The confirmation prompt could not be read from the terminal.
    #[error("Confirmation prompt failed: {0}")]
    Prompt(#[source] std::io::Error),

    /// `close` was called on an adapter that was already closed.
    #[error("Adapter already closed")]
    AlreadyClosed,

    /// A failure wrapped with the phase it happened in.
    #[error("{phase} failed: {source}")]
    Phase {
        /// Failed phase.
        phase: Phase,
        /// Underlying error.
        #[source]
        source: Box<Error>,
    },

    /// A failure in one independent import step.
    #[error("{step} step failed: {source}")]
    Step {
        /// Name of the failed step.
        step: &'static str,
        /// Underlying error.
        #[source]
        source: Box<Error>,
    },

    /// Database driver error.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML configuration error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    /// Wraps this error with the phase it occurred in.
    #[must_use]
    pub fn in_phase(self, phase: Phase) -> Self {
        Self::Phase {
            phase,
            source: Box::new(self),
        }
    }

    /// Wraps this error with the import step it occurred in.
    #[must_use]
    pub fn in_step(self, step: &'static str) -> Self {
        match self {
            // Cancellation is reported as-is so callers can match on it.
            Self::Cancelled => Self::Cancelled,
            other => Self::Step {
                step,
                source: Box::new(other),
            },
        }
    }

    /// Returns true when the error (or the error it wraps) is a cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::Phase { source, .. } | Self::Step { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_wrapping_message() {
        let err = Error::SourceConnection("connection refused".to_string()).in_phase(Phase::Analysis);
        assert_eq!(
            err.to_string(),
            "analysis failed: Source connection error: connection refused"
        );

        let err = Error::Loading("boom".to_string()).in_phase(Phase::Migration);
        assert!(err.to_string().starts_with("migration failed: "));
    }

    #[test]
    fn test_step_wrapping_message() {
        let err = Error::Extraction("bad json".to_string()).in_step("firestore");
        assert_eq!(err.to_string(), "firestore step failed: Extraction error: bad json");
    }

    #[test]
    fn test_cancellation_survives_wrapping() {
        assert!(matches!(Error::Cancelled.in_step("auth"), Error::Cancelled));
        assert!(Error::Cancelled.in_phase(Phase::Migration).is_cancelled());
        assert!(!Error::AlreadyClosed.is_cancelled());
    }

    #[test]
    fn test_target_not_empty_mentions_force() {
        let err = Error::TargetNotEmpty { users: 3 };
        assert!(err.to_string().contains("--force"));
        assert!(err.to_string().contains('3'));
    }
}
