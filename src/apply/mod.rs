//! Change applier
//!
//! Turns a parsed response into real file changes and one commit. The work
//! runs in three explicit phases so each can be driven on its own:
//!
//! 1. [`ChangeApplier::materialize`]: dependencies, then SQL, then every
//!    write, rename and delete in source order, plus the side effects each
//!    one triggers. The files end up exactly as the overlay predicted.
//! 2. [`ChangeApplier::commit_changes`]: stage the final state of every
//!    path phase 1 touched and create a tentative commit.
//! 3. [`ChangeApplier::reconcile`]: if the working tree still has changes
//!    the tool did not make, stage everything and amend the tentative
//!    commit. A failed amend is reported, never rolled back.


use crate::config::Settings;
use crate::directive::{
    parse_response, CommandKind, Directive, FileDelete, FileRename, FileWrite, ParsedResponse,
};
use crate::error::ApplyError;
use crate::git_ops::{LazyGitRepo, VersionControl};
use crate::lock::ProjectLock;
use crate::side_effects::{install_dependencies, manifest_paths, SideEffects};
use crate::util::resolve_project_path;
use serde::Serialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

const COMMIT_PREFIX: &str = "[cosmos]";
const DEFAULT_SUMMARY: &str = "Apply AI changes";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenameRecord {
    pub from: String,
    pub to: String,
}

/// The commit one application produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitRecord {
    /// Final commit id; the amended one when reconciliation amended.
    pub hash: String,
    pub files_written: Vec<String>,
    pub files_renamed: Vec<RenameRecord>,
    pub files_deleted: Vec<String>,
    pub extra_files_amended: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra_files_error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplyOutcome {
    pub updated_files: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<CommitRecord>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub extra_files: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra_files_error: Option<String>,
    /// Parse warnings and skipped operations.
    pub warnings: Vec<String>,
    /// Side effects that failed. The rest of the apply still went through.
    pub errors: Vec<String>,
    /// UI commands for the caller, in source order.
    pub commands: Vec<CommandKind>,
}

/// What phase 1 did to the project.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaterializedChanges {
    pub written: Vec<String>,
    pub renamed: Vec<RenameRecord>,
    pub deleted: Vec<String>,
    pub dependencies: Vec<String>,
    /// Manifest and lockfile paths present after installing dependencies.
    pub manifests: Vec<String>,
    pub sql_statements: usize,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl MaterializedChanges {
    /// Anything worth a commit. Requested dependencies and SQL count even
    /// when they left no file behind.
    pub fn has_changes(&self) -> bool {
        !self.written.is_empty()
            || !self.renamed.is_empty()
            || !self.deleted.is_empty()
            || !self.dependencies.is_empty()
            || self.sql_statements > 0
    }

    pub fn commit_message(&self, summary: Option<&str>) -> String {
        let summary = summary
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_SUMMARY);
        let mut message = format!("{} {}\n", COMMIT_PREFIX, summary);

        let counts = [
            (self.written.len(), "wrote", "file"),
            (self.renamed.len(), "renamed", "file"),
            (self.deleted.len(), "deleted", "file"),
            (self.dependencies.len(), "added", "package"),
            (self.sql_statements, "executed", "SQL query"),
        ];
        let mut first = true;
        for (count, verb, noun) in counts {
            if count == 0 {
                continue;
            }
            if first {
                message.push('\n');
                first = false;
            }
            let plural = if count == 1 {
                noun.to_string()
            } else if noun.ends_with('y') {
                format!("{}ies", &noun[..noun.len() - 1])
            } else {
                format!("{}s", noun)
            };
            message.push_str(&format!("- {} {} {}\n", verb, count, plural));
        }
        message
    }
}

/// A commit created by phase 2, not yet reconciled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TentativeCommit {
    pub hash: String,
    pub message: String,
}

/// Result of phase 3.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    pub extra_files: Vec<String>,
    pub amended_hash: Option<String>,
    pub error: Option<String>,
}

pub struct ChangeApplier<'a> {
    root: PathBuf,
    vcs: &'a dyn VersionControl,
    effects: &'a SideEffects,
}

impl<'a> ChangeApplier<'a> {
    /// `root` must already be canonical.
    pub fn new(root: PathBuf, vcs: &'a dyn VersionControl, effects: &'a SideEffects) -> Self {
        Self { root, vcs, effects }
    }

    /// Run all three phases.
    pub fn apply(
        &self,
        parsed: &ParsedResponse,
        summary: Option<&str>,
    ) -> Result<ApplyOutcome, ApplyError> {
        let mut outcome = ApplyOutcome {
            warnings: parse_warnings(parsed),
            commands: parsed.commands(),
            ..Default::default()
        };

        let mut changes = self.materialize(parsed)?;
        let summary = summary.or(parsed.chat_summary.as_deref());
        let tentative = self.commit_changes(&mut changes, summary)?;

        outcome.warnings.append(&mut changes.warnings);
        outcome.errors.append(&mut changes.errors);

        let Some(tentative) = tentative else {
            tracing::info!("no file changes to commit");
            return Ok(outcome);
        };

        let reconciliation = self.reconcile(&tentative);
        outcome.updated_files = true;
        outcome.extra_files = reconciliation.extra_files.clone();
        outcome.extra_files_error = reconciliation.error.clone();
        outcome.commit = Some(CommitRecord {
            hash: reconciliation
                .amended_hash
                .clone()
                .unwrap_or_else(|| tentative.hash.clone()),
            files_written: changes.written,
            files_renamed: changes.renamed,
            files_deleted: changes.deleted,
            extra_files_amended: if reconciliation.amended_hash.is_some() {
                reconciliation.extra_files
            } else {
                Vec::new()
            },
            extra_files_error: reconciliation.error,
        });
        Ok(outcome)
    }

    /// Phase 1. Filesystem failures abort; side-effect failures and skipped
    /// directives are collected on the result.
    pub fn materialize(&self, parsed: &ParsedResponse) -> Result<MaterializedChanges, ApplyError> {
        let mut changes = MaterializedChanges::default();
        let mut deployed = HashSet::new();

        let dependencies = parsed.dependencies();
        if !dependencies.is_empty() {
            tracing::debug!(packages = dependencies.len(), "installing dependencies");
            for err in install_dependencies(self.effects.packages.as_ref(), &self.root, &dependencies)
            {
                changes.errors.push(format!("failed to add dependencies: {}", err));
            }
            changes.manifests = manifest_paths(&self.root);
            changes.dependencies = dependencies;
        }

        for sql in parsed.sql() {
            changes.sql_statements += 1;
            if let Err(err) = self.effects.execute_sql(&sql.content) {
                let label = sql.description.as_deref().unwrap_or("SQL query");
                tracing::warn!(error = %err, "SQL execution failed");
                changes.errors.push(format!("{} failed: {}", label, err));
            }
        }

        for directive in &parsed.directives {
            match directive {
                Directive::Write(write) => self.write_file(write, &mut deployed, &mut changes)?,
                Directive::Rename(rename) => self.rename_path(rename, &mut deployed, &mut changes)?,
                Directive::Delete(delete) => self.delete_path(delete, &mut deployed, &mut changes)?,
                Directive::AddDependency(_) | Directive::ExecuteSql(_) | Directive::Command(_) => {}
            }
        }

        Ok(changes)
    }

    /// Phase 2. Stage what is on disk now for every path phase 1 touched
    /// and commit it. Returns `None` without touching the repository when
    /// there is nothing to commit.
    pub fn commit_changes(
        &self,
        changes: &mut MaterializedChanges,
        summary: Option<&str>,
    ) -> Result<Option<TentativeCommit>, ApplyError> {
        if !changes.has_changes() {
            return Ok(None);
        }

        let touched = changes
            .written
            .iter()
            .chain(&changes.manifests)
            .chain(changes.renamed.iter().flat_map(|r| [&r.from, &r.to]))
            .chain(&changes.deleted);
        let mut seen = HashSet::new();
        let mut removals = Vec::new();
        for path in touched {
            if !seen.insert(path.as_str()) {
                continue;
            }
            match self.root.join(path).symlink_metadata() {
                Ok(meta) if meta.is_dir() => self.vcs.add_dir(path)?,
                Ok(_) => self.vcs.add(path)?,
                Err(_) => removals.push(path.clone()),
            }
        }

        for path in removals {
            if let Err(err) = self.vcs.remove(&path) {
                tracing::warn!(path = %path, error = %err, "failed to unstage removed path");
                changes
                    .warnings
                    .push(format!("failed to remove {} from version control: {}", path, err));
            }
        }

        let message = changes.commit_message(summary);
        let hash = self.vcs.commit(&message)?;
        Ok(Some(TentativeCommit { hash, message }))
    }

    /// Phase 3. Never fails; problems end up in [`Reconciliation::error`].
    pub fn reconcile(&self, tentative: &TentativeCommit) -> Reconciliation {
        let mut result = Reconciliation::default();
        let rows = match self.vcs.status_matrix() {
            Ok(rows) => rows,
            Err(err) => {
                tracing::warn!(error = %err, "could not read status after commit");
                result.error = Some(err.to_string());
                return result;
            }
        };

        result.extra_files = rows
            .into_iter()
            .filter(|row| !row.is_clean())
            .map(|row| row.path)
            .collect();
        if result.extra_files.is_empty() {
            return result;
        }

        tracing::info!(
            files = result.extra_files.len(),
            "found changes made outside cosmos; amending commit"
        );
        let message = amend_message(&tentative.message, &result.extra_files);
        match self.vcs.add_all().and_then(|()| self.vcs.amend(&message)) {
            Ok(hash) => result.amended_hash = Some(hash),
            Err(err) => {
                tracing::warn!(error = %err, "failed to amend commit with extra files");
                result.error = Some(err.to_string());
            }
        }
        result
    }

    fn write_file(
        &self,
        write: &FileWrite,
        deployed: &mut HashSet<String>,
        changes: &mut MaterializedChanges,
    ) -> Result<(), ApplyError> {
        let rel = write.path.as_str();
        let Some(path) = self.resolve(rel, changes) else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| ApplyError::io(parent, e))?;
        }
        fs::write(&path, &write.content).map_err(|e| ApplyError::io(&path, e))?;
        tracing::debug!(path = %rel, bytes = write.content.len(), "wrote file");
        if !changes.written.iter().any(|w| w == rel) {
            changes.written.push(rel.to_string());
        }
        self.deploy_once(rel, deployed, changes);
        Ok(())
    }

    fn rename_path(
        &self,
        rename: &FileRename,
        deployed: &mut HashSet<String>,
        changes: &mut MaterializedChanges,
    ) -> Result<(), ApplyError> {
        let (from, to) = (rename.from.as_str(), rename.to.as_str());
        let Some(from_path) = self.resolve(from, changes) else {
            return Ok(());
        };
        let Some(to_path) = self.resolve(to, changes) else {
            return Ok(());
        };
        if from_path.symlink_metadata().is_err() {
            tracing::warn!(from = %from, to = %to, "rename source does not exist; skipping");
            changes
                .warnings
                .push(format!("skipped rename of {}: source does not exist", from));
            return Ok(());
        }
        if let Some(parent) = to_path.parent() {
            fs::create_dir_all(parent).map_err(|e| ApplyError::io(parent, e))?;
        }
        fs::rename(&from_path, &to_path).map_err(|e| ApplyError::io(&from_path, e))?;
        tracing::debug!(from = %from, to = %to, "renamed path");
        changes.renamed.push(RenameRecord {
            from: from.to_string(),
            to: to.to_string(),
        });

        // A move inside one function keeps the function; it only redeploys.
        let from_function = self.effects.function_name(from);
        if from_function.is_some() && from_function != self.effects.function_name(to) {
            self.delete_function(from, deployed, changes);
        }
        self.deploy_once(to, deployed, changes);
        Ok(())
    }

    fn delete_path(
        &self,
        delete: &FileDelete,
        deployed: &mut HashSet<String>,
        changes: &mut MaterializedChanges,
    ) -> Result<(), ApplyError> {
        let rel = delete.path.as_str();
        let Some(path) = self.resolve(rel, changes) else {
            return Ok(());
        };
        let Ok(meta) = path.symlink_metadata() else {
            tracing::debug!(path = %rel, "delete target does not exist");
            return Ok(());
        };
        let removed = if meta.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        removed.map_err(|e| ApplyError::io(&path, e))?;
        tracing::debug!(path = %rel, "deleted path");
        if !changes.deleted.iter().any(|d| d == rel) {
            changes.deleted.push(rel.to_string());
        }
        self.delete_function(rel, deployed, changes);
        Ok(())
    }

    fn resolve(&self, rel: &str, changes: &mut MaterializedChanges) -> Option<PathBuf> {
        match resolve_project_path(&self.root, rel) {
            Ok(path) => Some(path),
            Err(reason) => {
                tracing::warn!(path = %rel, reason = %reason, "skipping unsafe path");
                changes.warnings.push(format!("skipped {}: {}", rel, reason));
                None
            }
        }
    }

    /// Deploy the function `rel` belongs to unless this apply already did.
    fn deploy_once(
        &self,
        rel: &str,
        deployed: &mut HashSet<String>,
        changes: &mut MaterializedChanges,
    ) {
        let Some(name) = self.effects.function_name(rel) else {
            return;
        };
        if !deployed.insert(name) {
            return;
        }
        if let Err(err) = self.effects.deploy_for(rel, &self.root) {
            changes
                .errors
                .push(format!("failed to deploy function for {}: {}", rel, err));
        }
    }

    fn delete_function(
        &self,
        rel: &str,
        deployed: &mut HashSet<String>,
        changes: &mut MaterializedChanges,
    ) {
        // A later write to the same function deploys it again.
        if let Some(name) = self.effects.function_name(rel) {
            deployed.remove(&name);
        }
        if let Err(err) = self.effects.delete_for(rel) {
            changes
                .errors
                .push(format!("failed to delete function for {}: {}", rel, err));
        }
    }
}

fn amend_message(original: &str, extra_files: &[String]) -> String {
    let mut message = original.trim_end().to_string();
    message.push_str("\n\n+ extra files edited outside of cosmos:\n");
    for file in extra_files {
        message.push_str(&format!("- {}\n", file));
    }
    message
}

fn parse_warnings(parsed: &ParsedResponse) -> Vec<String> {
    parsed
        .warnings
        .iter()
        .map(|w| format!("skipped <{}> at offset {}: {}", w.tag, w.offset, w.message))
        .collect()
}

fn touches_project(parsed: &ParsedResponse) -> bool {
    parsed.writes().next().is_some()
        || parsed.renames().next().is_some()
        || parsed.deletes().next().is_some()
        || !parsed.dependencies().is_empty()
        || parsed.sql().next().is_some()
}

/// Parse `raw_response` and apply it to the project at `project_root` with
/// the project's settings, holding the project lock throughout.
pub fn apply_directives(
    project_root: &Path,
    raw_response: &str,
    commit_summary: Option<&str>,
) -> Result<ApplyOutcome, ApplyError> {
    let root = project_root
        .canonicalize()
        .map_err(|e| ApplyError::io(project_root, e))?;
    let settings = Settings::load(&root);
    let parsed = parse_response(raw_response);

    if !touches_project(&parsed) {
        return Ok(ApplyOutcome {
            warnings: parse_warnings(&parsed),
            commands: parsed.commands(),
            ..Default::default()
        });
    }

    let _lock = ProjectLock::for_project(&root, settings.lock_timeout())?;
    let repo = LazyGitRepo::new(&root)
        .with_fallback_author(settings.author_name.clone(), settings.author_email.clone());
    let effects = SideEffects::from_settings(&settings);

    ChangeApplier::new(root, &repo, &effects).apply(&parsed, commit_summary)
}
