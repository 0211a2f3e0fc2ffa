//! Cosmos apply library crate
//!
//! Parses edit directives out of model responses, type-checks a project as
//! it would look with those edits, and applies them as one git commit.

pub mod apply;
pub mod config;
pub mod diagnostics;
pub mod directive;
pub mod error;
pub mod git_ops;
pub mod lock;
pub mod overlay;
pub mod side_effects;
pub mod util;

pub use apply::{apply_directives, ApplyOutcome, ChangeApplier, CommitRecord};
pub use config::Settings;
pub use diagnostics::{check_problems, check_problems_in_worker, DiagnosticEngine, Problem, ProblemReport};
pub use directive::{parse_response, Directive, ParsedResponse};
pub use error::{ApplyError, DiagnosticError, SideEffectError};
pub use overlay::{FileSystem, Overlay};
