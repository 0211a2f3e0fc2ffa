//! Diagnostic engine
//!
//! Type-checks a project as it would look after a pending change set,
//! without writing anything to disk. Each call builds its own overlay and
//! checker program from scratch.

pub mod checker;


use crate::config::Settings;
use crate::directive::Directive;
use crate::error::DiagnosticError;
use crate::overlay::{FileSystem, Overlay};
use crate::util::{normalize_lexically, to_slash_relative};
use checker::{CheckerFactory, NodeTypeScriptFactory, ProgramSpec, RawDiagnostic, Severity};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Project config files, most specific first. The first one that exists wins.
pub const CONFIG_PREFERENCE: &[&str] = &["tsconfig.app.json", "tsconfig.json", "jsconfig.json"];

const CHECKABLE_EXTENSIONS: &[&str] = &["ts", "tsx", "mts", "cts"];

/// One type-checker error, positioned 1-based in a project-relative file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Problem {
    pub file: String,
    pub line: u32,
    pub column: u32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{} - {}", self.file, self.line, self.column, self.message)?;
        if let Some(code) = self.code {
            write!(f, " (TS{})", code)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProblemReport {
    pub problems: Vec<Problem>,
}

impl ProblemReport {
    pub fn is_empty(&self) -> bool {
        self.problems.is_empty()
    }

    pub fn len(&self) -> usize {
        self.problems.len()
    }

    /// Problems that were not already present in `baseline`.
    pub fn new_since(&self, baseline: &ProblemReport) -> Vec<Problem> {
        let known: HashSet<&Problem> = baseline.problems.iter().collect();
        self.problems
            .iter()
            .filter(|p| !known.contains(p))
            .cloned()
            .collect()
    }

    /// Render the report as a request to fix every error.
    pub fn to_fix_prompt(&self) -> String {
        let count = self.problems.len();
        let mut prompt = format!(
            "Fix these {} TypeScript compile-time error{}:\n\n",
            count,
            if count == 1 { "" } else { "s" }
        );
        for (i, problem) in self.problems.iter().enumerate() {
            prompt.push_str(&format!("{}. {}\n", i + 1, problem));
        }
        prompt.push_str("\nPlease fix all errors in a concise way.");
        prompt
    }
}

/// Checks projects with whatever checker the factory resolves for them.
#[derive(Clone)]
pub struct DiagnosticEngine {
    factory: Arc<dyn CheckerFactory>,
}

impl DiagnosticEngine {
    pub fn new(factory: Arc<dyn CheckerFactory>) -> Self {
        Self { factory }
    }

    /// The project's own TypeScript, driven through `node`.
    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(Arc::new(NodeTypeScriptFactory::new(
            settings.node_binary.clone(),
            settings.checker_timeout(),
        )))
    }

    pub fn check(
        &self,
        project_root: &Path,
        pending: &[Directive],
    ) -> Result<ProblemReport, DiagnosticError> {
        let root = project_root
            .canonicalize()
            .map_err(|e| DiagnosticError::InvalidRoot {
                root: project_root.to_path_buf(),
                reason: e.to_string(),
            })?;

        let checker = self.factory.resolve(&root)?;
        let overlay = Overlay::from_directives(&root, pending);
        let config_path = locate_project_config(&root, &overlay)?;
        tracing::debug!(
            config = %config_path.display(),
            checker_version = checker.version(),
            virtual_writes = overlay.virtual_writes().len(),
            deleted = overlay.deleted_paths().len(),
            "checking project"
        );

        let config_files = checker.config_file_names(&config_path, &overlay)?;
        let root_names = root_names(config_files, &overlay);
        let raw = checker.run(&ProgramSpec {
            config_path: &config_path,
            root_names: &root_names,
            overlay: &overlay,
        })?;

        let report = normalize_diagnostics(&root, &config_path, raw);
        tracing::info!(
            problems = report.len(),
            roots = root_names.len(),
            "type check finished"
        );
        Ok(report)
    }

    /// Run [`DiagnosticEngine::check`] on the blocking pool so the caller's
    /// thread stays free while the checker works.
    pub async fn check_in_worker(
        &self,
        project_root: PathBuf,
        pending: Vec<Directive>,
    ) -> Result<ProblemReport, DiagnosticError> {
        let engine = self.clone();
        tokio::task::spawn_blocking(move || engine.check(&project_root, &pending))
            .await
            .map_err(|e| DiagnosticError::Worker(e.to_string()))?
    }
}

/// Problems the project would have after `pending` is applied.
pub fn check_problems(
    project_root: &Path,
    pending: &[Directive],
) -> Result<ProblemReport, DiagnosticError> {
    let settings = Settings::load(project_root);
    DiagnosticEngine::from_settings(&settings).check(project_root, pending)
}

/// [`check_problems`] on a worker thread.
pub async fn check_problems_in_worker(
    project_root: PathBuf,
    pending: Vec<Directive>,
) -> Result<ProblemReport, DiagnosticError> {
    let settings = Settings::load(&project_root);
    DiagnosticEngine::from_settings(&settings)
        .check_in_worker(project_root, pending)
        .await
}

/// First config from [`CONFIG_PREFERENCE`] that exists once pending
/// changes are taken into account.
pub fn locate_project_config(
    root: &Path,
    fs: &dyn FileSystem,
) -> Result<PathBuf, DiagnosticError> {
    CONFIG_PREFERENCE
        .iter()
        .map(|name| root.join(name))
        .find(|candidate| fs.file_exists(candidate))
        .ok_or_else(|| DiagnosticError::ConfigNotFound {
            root: root.to_path_buf(),
            looked_for: CONFIG_PREFERENCE.join(", "),
        })
}

fn is_checkable_source(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| CHECKABLE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Config files plus virtually written sources the config does not already
/// include, minus anything the overlay reports as gone.
pub fn root_names(config_files: Vec<PathBuf>, overlay: &Overlay) -> Vec<PathBuf> {
    let mut seen = HashSet::new();
    let mut names = Vec::with_capacity(config_files.len());
    for file in config_files {
        let file = normalize_lexically(&file);
        if seen.insert(file.clone()) {
            names.push(file);
        }
    }
    for written in overlay.virtual_writes().keys() {
        if is_checkable_source(written) && seen.insert(written.clone()) {
            names.push(written.clone());
        }
    }
    names.retain(|name| overlay.file_exists(name));
    names
}

/// Keep errors only, make positions 1-based and paths project-relative.
///
/// Diagnostics without a file are attributed to the project config.
pub fn normalize_diagnostics(
    root: &Path,
    config_path: &Path,
    raw: Vec<RawDiagnostic>,
) -> ProblemReport {
    let problems = raw
        .into_iter()
        .filter(|d| d.category == Severity::Error)
        .map(|d| match d.file {
            Some(file) => Problem {
                file: to_slash_relative(root, &normalize_lexically(&file)),
                line: d.line.saturating_add(1),
                column: d.character.saturating_add(1),
                message: d.message,
                code: d.code,
            },
            None => Problem {
                file: to_slash_relative(root, config_path),
                line: 1,
                column: 1,
                message: d.message,
                code: d.code,
            },
        })
        .collect();
    ProblemReport { problems }
}
