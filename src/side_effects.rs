//! Side effects triggered by applied directives
//!
//! Package installs, SQL against the linked database, and server function
//! deploys. Every call is independent: failures come back as
//! [`SideEffectError`] values for the caller to collect, never as panics or
//! early returns that would skip the remaining effects.

use crate::config::Settings;
use crate::error::SideEffectError;
use crate::util::{run_command, truncate};
use regex::Regex;
use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;
use std::process::Command;
use std::sync::OnceLock;
use std::time::Duration;

/// Files a package install may create or rewrite.
pub const MANIFEST_FILES: &[&str] = &[
    "package.json",
    "package-lock.json",
    "npm-shrinkwrap.json",
    "pnpm-lock.yaml",
    "yarn.lock",
    "bun.lock",
    "bun.lockb",
];

const ACCESS_TOKEN_ENV: &str = "SUPABASE_ACCESS_TOKEN";
const API_TIMEOUT_SECS: u64 = 60;
const MAX_DETAIL_CHARS: usize = 1_000;

static PACKAGE_NAME_RE: OnceLock<Option<Regex>> = OnceLock::new();

fn package_name_regex() -> Option<&'static Regex> {
    PACKAGE_NAME_RE
        .get_or_init(|| {
            Regex::new(r"^(@[a-z0-9~][a-z0-9._~-]*/)?[a-z0-9~][a-z0-9._~-]*(@[A-Za-z0-9._~^<>=*|+-]+)?$")
                .ok()
        })
        .as_ref()
}

/// A registry package name, optionally scoped and optionally pinned
/// (`@scope/name@^1.2`). Anything that could be read as a CLI flag or a
/// path is rejected.
pub fn validate_package_name(name: &str) -> Result<(), SideEffectError> {
    let valid = name.len() <= 214
        && package_name_regex()
            .map(|re| re.is_match(name))
            .unwrap_or(false);
    if valid {
        Ok(())
    } else {
        Err(SideEffectError::InvalidPackage(name.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageManagerKind {
    Npm,
    Pnpm,
    Yarn,
    Bun,
}

impl PackageManagerKind {
    /// Pick the manager whose lockfile is present; npm when there is none.
    pub fn detect(project_root: &Path) -> Self {
        if project_root.join("pnpm-lock.yaml").is_file() {
            Self::Pnpm
        } else if project_root.join("yarn.lock").is_file() {
            Self::Yarn
        } else if project_root.join("bun.lockb").is_file() || project_root.join("bun.lock").is_file()
        {
            Self::Bun
        } else {
            Self::Npm
        }
    }

    pub fn program(&self) -> &'static str {
        match self {
            Self::Npm => "npm",
            Self::Pnpm => "pnpm",
            Self::Yarn => "yarn",
            Self::Bun => "bun",
        }
    }

    pub fn install_args(&self, packages: &[String]) -> Vec<String> {
        let verb = match self {
            Self::Npm => "install",
            Self::Pnpm | Self::Yarn | Self::Bun => "add",
        };
        std::iter::once(verb.to_string())
            .chain(packages.iter().cloned())
            .collect()
    }
}

pub trait PackageManager: Send + Sync {
    /// Add already-validated packages to the project manifest and lockfile.
    fn install(&self, project_root: &Path, packages: &[String]) -> Result<(), SideEffectError>;
}

/// Runs the project's own package manager as a subprocess.
#[derive(Debug, Clone)]
pub struct CommandPackageManager {
    pub timeout: Duration,
}

impl PackageManager for CommandPackageManager {
    fn install(&self, project_root: &Path, packages: &[String]) -> Result<(), SideEffectError> {
        let kind = PackageManagerKind::detect(project_root);
        let args = kind.install_args(packages);
        let shown = format!("{} {}", kind.program(), args.join(" "));
        tracing::info!(command = %shown, "installing packages");

        let mut command = Command::new(kind.program());
        command.current_dir(project_root).args(&args);
        let result = run_command(&mut command, None, Some(self.timeout)).map_err(|detail| {
            SideEffectError::Command {
                command: shown.clone(),
                detail,
            }
        })?;

        if result.timed_out {
            return Err(SideEffectError::Command {
                command: shown,
                detail: format!("timed out after {}s", self.timeout.as_secs()),
            });
        }
        if !result.success() {
            return Err(SideEffectError::Command {
                command: shown,
                detail: result.failure_detail(MAX_DETAIL_CHARS),
            });
        }
        Ok(())
    }
}

/// Validate, de-duplicate, and install `packages`. Invalid names are
/// reported and skipped; the rest are installed in one call.
pub fn install_dependencies(
    manager: &dyn PackageManager,
    project_root: &Path,
    packages: &[String],
) -> Vec<SideEffectError> {
    let mut errors = Vec::new();
    let mut seen = HashSet::new();
    let mut valid = Vec::new();
    for package in packages {
        if !seen.insert(package.as_str()) {
            continue;
        }
        match validate_package_name(package) {
            Ok(()) => valid.push(package.clone()),
            Err(err) => {
                tracing::warn!(package = %package, "skipping invalid package name");
                errors.push(err);
            }
        }
    }
    if !valid.is_empty() {
        if let Err(err) = manager.install(project_root, &valid) {
            tracing::warn!(error = %err, "package install failed");
            errors.push(err);
        }
    }
    errors
}

/// Manifest and lockfile paths present in the project root.
pub fn manifest_paths(project_root: &Path) -> Vec<String> {
    MANIFEST_FILES
        .iter()
        .filter(|name| project_root.join(name).is_file())
        .map(|name| name.to_string())
        .collect()
}

/// The hosted backend the project is linked to.
pub trait ManagedBackend: Send + Sync {
    fn execute_sql(&self, project_id: &str, sql: &str) -> Result<(), SideEffectError>;
    fn deploy_function(
        &self,
        project_id: &str,
        name: &str,
        project_root: &Path,
    ) -> Result<(), SideEffectError>;
    fn delete_function(&self, project_id: &str, name: &str) -> Result<(), SideEffectError>;
}

/// Name of the server function a project-relative path belongs to.
///
/// `supabase/functions/hello/index.ts` belongs to `hello`. Directories
/// starting with `_` hold shared code and are not functions.
pub fn server_function_name(rel_path: &str, functions_dir: &str) -> Option<String> {
    let functions_dir = functions_dir.trim_matches('/');
    let rest = rel_path.strip_prefix(functions_dir)?.strip_prefix('/')?;
    let name = rest.split('/').next()?;
    if name.is_empty() || name.starts_with('_') || name.starts_with('.') {
        return None;
    }
    Some(name.to_string())
}

/// Supabase: functions through the `supabase` CLI, SQL through the
/// Management API.
#[derive(Debug, Clone)]
pub struct SupabaseBackend {
    pub cli_binary: String,
    pub api_url: String,
    pub access_token: Option<String>,
    pub timeout: Duration,
}

impl SupabaseBackend {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            cli_binary: settings.supabase_binary.clone(),
            api_url: settings.management_api_url.trim_end_matches('/').to_string(),
            access_token: std::env::var(ACCESS_TOKEN_ENV)
                .ok()
                .filter(|t| !t.trim().is_empty()),
            timeout: settings.install_timeout(),
        }
    }

    fn run_cli(&self, project_root: Option<&Path>, args: &[&str]) -> Result<(), SideEffectError> {
        let shown = format!("{} {}", self.cli_binary, args.join(" "));
        let mut command = Command::new(&self.cli_binary);
        command.args(args);
        if let Some(root) = project_root {
            command.current_dir(root);
        }
        let result = run_command(&mut command, None, Some(self.timeout)).map_err(|detail| {
            SideEffectError::Command {
                command: shown.clone(),
                detail,
            }
        })?;
        if result.success() && !result.timed_out {
            Ok(())
        } else {
            Err(SideEffectError::Command {
                command: shown,
                detail: result.failure_detail(MAX_DETAIL_CHARS),
            })
        }
    }
}

impl ManagedBackend for SupabaseBackend {
    fn execute_sql(&self, project_id: &str, sql: &str) -> Result<(), SideEffectError> {
        let token = self.access_token.as_deref().ok_or_else(|| {
            SideEffectError::Remote(format!("{} is not set", ACCESS_TOKEN_ENV))
        })?;
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(API_TIMEOUT_SECS))
            .build()
            .map_err(|e| SideEffectError::Remote(e.to_string()))?;

        let url = format!("{}/v1/projects/{}/database/query", self.api_url, project_id);
        let response = client
            .post(&url)
            .bearer_auth(token)
            .json(&serde_json::json!({ "query": sql }))
            .send()
            .map_err(|e| SideEffectError::Remote(format!("SQL request failed: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().unwrap_or_default();
        Err(SideEffectError::Remote(format!(
            "SQL execution failed ({}): {}",
            status,
            truncate(&body, MAX_DETAIL_CHARS)
        )))
    }

    fn deploy_function(
        &self,
        project_id: &str,
        name: &str,
        project_root: &Path,
    ) -> Result<(), SideEffectError> {
        self.run_cli(
            Some(project_root),
            &["functions", "deploy", name, "--project-ref", project_id],
        )
    }

    fn delete_function(&self, project_id: &str, name: &str) -> Result<(), SideEffectError> {
        self.run_cli(
            None,
            &["functions", "delete", name, "--project-ref", project_id],
        )
    }
}

/// The side-effect collaborators one apply uses.
pub struct SideEffects {
    pub packages: Box<dyn PackageManager>,
    pub backend: Box<dyn ManagedBackend>,
    /// Linked managed database, if any. Without one, SQL fails and function
    /// deploys are skipped.
    pub database_project_id: Option<String>,
    pub functions_dir: String,
}

impl SideEffects {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            packages: Box::new(CommandPackageManager {
                timeout: settings.install_timeout(),
            }),
            backend: Box::new(SupabaseBackend::from_settings(settings)),
            database_project_id: settings.database_project_id.clone(),
            functions_dir: settings.functions_dir.clone(),
        }
    }

    pub fn function_name(&self, rel_path: &str) -> Option<String> {
        server_function_name(rel_path, &self.functions_dir)
    }

    pub fn execute_sql(&self, sql: &str) -> Result<(), SideEffectError> {
        let project = self
            .database_project_id
            .as_deref()
            .ok_or(SideEffectError::NotLinked)?;
        self.backend.execute_sql(project, sql)
    }

    /// Deploy the function `rel_path` belongs to. `Ok(false)` when the path
    /// is not a function or no backend is linked.
    pub fn deploy_for(&self, rel_path: &str, project_root: &Path) -> Result<bool, SideEffectError> {
        let (Some(name), Some(project)) = (
            self.function_name(rel_path),
            self.database_project_id.as_deref(),
        ) else {
            return Ok(false);
        };
        tracing::info!(function = %name, "deploying server function");
        self.backend.deploy_function(project, &name, project_root)?;
        Ok(true)
    }

    /// Delete the function `rel_path` belongs to, under the same rules as
    /// [`SideEffects::deploy_for`].
    pub fn delete_for(&self, rel_path: &str) -> Result<bool, SideEffectError> {
        let (Some(name), Some(project)) = (
            self.function_name(rel_path),
            self.database_project_id.as_deref(),
        ) else {
            return Ok(false);
        };
        tracing::info!(function = %name, "deleting server function");
        self.backend.delete_function(project, &name)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingManager {
        calls: Mutex<Vec<Vec<String>>>,
        fail: bool,
    }

    impl PackageManager for RecordingManager {
        fn install(&self, _root: &Path, packages: &[String]) -> Result<(), SideEffectError> {
            self.calls.lock().unwrap().push(packages.to_vec());
            if self.fail {
                Err(SideEffectError::Command {
                    command: "npm install".to_string(),
                    detail: "E404".to_string(),
                })
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn test_package_names() {
        for ok in ["react", "@tanstack/react-query", "lodash.debounce", "zod@3.22.4", "react@^18"] {
            assert!(validate_package_name(ok).is_ok(), "{ok}");
        }
        for bad in ["", "--save-dev", "../evil", "Has Space", "@scope/", "a;rm -rf"] {
            assert!(validate_package_name(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn test_install_skips_invalid_and_duplicate_names() {
        let manager = RecordingManager::default();
        let packages: Vec<String> = ["react", "--global", "react", "zod"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let errors = install_dependencies(&manager, Path::new("."), &packages);

        assert_eq!(errors, vec![SideEffectError::InvalidPackage("--global".to_string())]);
        assert_eq!(
            *manager.calls.lock().unwrap(),
            vec![vec!["react".to_string(), "zod".to_string()]]
        );
    }

    #[test]
    fn test_install_failure_is_collected() {
        let manager = RecordingManager {
            fail: true,
            ..Default::default()
        };
        let errors = install_dependencies(&manager, Path::new("."), &["react".to_string()]);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].to_string().contains("E404"));
    }

    #[test]
    fn test_detect_package_manager_from_lockfile() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(PackageManagerKind::detect(dir.path()), PackageManagerKind::Npm);
        fs::write(dir.path().join("yarn.lock"), "").unwrap();
        assert_eq!(PackageManagerKind::detect(dir.path()), PackageManagerKind::Yarn);
        fs::write(dir.path().join("pnpm-lock.yaml"), "").unwrap();
        assert_eq!(PackageManagerKind::detect(dir.path()), PackageManagerKind::Pnpm);

        let args = PackageManagerKind::Npm.install_args(&["a".to_string()]);
        assert_eq!(args, vec!["install", "a"]);
        let args = PackageManagerKind::Bun.install_args(&["a".to_string()]);
        assert_eq!(args, vec!["add", "a"]);
    }

    #[test]
    fn test_manifest_paths_lists_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("package.json"), "{}").unwrap();
        fs::write(dir.path().join("pnpm-lock.yaml"), "").unwrap();
        assert_eq!(manifest_paths(dir.path()), vec!["package.json", "pnpm-lock.yaml"]);
    }

    #[test]
    fn test_server_function_name() {
        let dir = "supabase/functions";
        assert_eq!(
            server_function_name("supabase/functions/hello/index.ts", dir).as_deref(),
            Some("hello")
        );
        assert_eq!(
            server_function_name("supabase/functions/hello", dir).as_deref(),
            Some("hello")
        );
        assert_eq!(server_function_name("supabase/functions/_shared/cors.ts", dir), None);
        assert_eq!(server_function_name("supabase/functionsx/a/index.ts", dir), None);
        assert_eq!(server_function_name("src/functions/a.ts", dir), None);
        assert_eq!(server_function_name("supabase/functions", dir), None);
    }

    #[test]
    fn test_unlinked_project_skips_deploys_and_rejects_sql() {
        let effects = SideEffects {
            packages: Box::new(RecordingManager::default()),
            backend: Box::new(SupabaseBackend::from_settings(&Settings::default())),
            database_project_id: None,
            functions_dir: "supabase/functions".to_string(),
        };
        assert_eq!(effects.execute_sql("select 1"), Err(SideEffectError::NotLinked));
        assert_eq!(
            effects.deploy_for("supabase/functions/a/index.ts", Path::new(".")),
            Ok(false)
        );
        assert_eq!(effects.delete_for("supabase/functions/a/index.ts"), Ok(false));
    }

    #[test]
    fn test_sql_without_token_is_remote_error() {
        let backend = SupabaseBackend {
            cli_binary: "supabase".to_string(),
            api_url: "http://127.0.0.1:9".to_string(),
            access_token: None,
            timeout: Duration::from_secs(1),
        };
        assert!(matches!(
            backend.execute_sql("proj", "select 1"),
            Err(SideEffectError::Remote(msg)) if msg.contains(ACCESS_TOKEN_ENV)
        ));
    }

    #[test]
    fn test_missing_cli_reports_the_command_line() {
        let backend = SupabaseBackend {
            cli_binary: "/nonexistent/cosmos-supabase".to_string(),
            api_url: "http://127.0.0.1:9".to_string(),
            access_token: None,
            timeout: Duration::from_secs(1),
        };
        let dir = tempfile::tempdir().unwrap();
        let err = backend.deploy_function("proj", "hello", dir.path()).unwrap_err();
        assert!(matches!(
            err,
            SideEffectError::Command { ref command, .. }
                if command == "/nonexistent/cosmos-supabase functions deploy hello --project-ref proj"
        ));
        assert!(err.to_string().contains("functions deploy hello"));
    }
}
