//! Error types for checking and applying directives
//!
//! Configuration and I/O failures are returned as errors. Parse-level and
//! side-effect problems never surface here; they are collected on results.

use std::path::PathBuf;

/// Failures that abort a diagnostic check.
#[derive(Debug, thiserror::Error)]
pub enum DiagnosticError {
    #[error("project root {root} is not usable: {reason}")]
    InvalidRoot { root: PathBuf, reason: String },

    /// The project does not ship its own type checker.
    #[error("no type checker found in the dependencies of {root}: {reason}")]
    CheckerNotFound { root: PathBuf, reason: String },

    /// None of the known project config files exist.
    #[error("no project config found in {root} (looked for {looked_for})")]
    ConfigNotFound { root: PathBuf, looked_for: String },

    /// The checker ran but config parsing or program construction failed.
    #[error("type checker failed: {0}")]
    Checker(String),

    /// The checker process could not be started or talked to.
    #[error("failed to run type checker: {0}")]
    Process(String),

    /// The worker running the check panicked or was cancelled.
    #[error("diagnostic worker failed: {0}")]
    Worker(String),
}

/// Failures that abort an apply call.
#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("version control failed to {action}: {source}")]
    Vcs {
        action: String,
        #[source]
        source: git2::Error,
    },

    /// Another apply holds the project lock.
    #[error("another apply is in progress for {0}")]
    Locked(PathBuf),
}

impl ApplyError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn vcs(action: impl Into<String>, source: git2::Error) -> Self {
        Self::Vcs {
            action: action.into(),
            source,
        }
    }
}

/// Failures of an individual side effect (install, SQL, deploy).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SideEffectError {
    #[error("invalid package name '{0}'")]
    InvalidPackage(String),

    #[error("{command} failed: {detail}")]
    Command { command: String, detail: String },

    #[error("project is not linked to a managed database")]
    NotLinked,

    #[error("{0}")]
    Remote(String),
}
