//! Type checker capability
//!
//! The engine never links a compiler of its own. A [`CheckerFactory`]
//! resolves the checker the target project actually depends on, so reports
//! match the compiler version and config the project builds with.

use crate::error::DiagnosticError;
use crate::overlay::Overlay;
use crate::util::{run_command, truncate};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

const TS_HOST_SOURCE: &str = include_str!("ts_host.js");
const MAX_ERROR_DETAIL_CHARS: usize = 2_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Suggestion,
    Message,
}

/// A diagnostic as the checker reports it: absolute path, 0-based position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawDiagnostic {
    pub file: Option<PathBuf>,
    pub line: u32,
    pub character: u32,
    pub message: String,
    pub code: Option<i64>,
    pub category: Severity,
}

/// What to type-check: the config to honour, the root files, and the
/// pending changes every file lookup must see.
#[derive(Debug, Clone, Copy)]
pub struct ProgramSpec<'a> {
    pub config_path: &'a Path,
    pub root_names: &'a [PathBuf],
    pub overlay: &'a Overlay,
}

pub trait TypeChecker: Send + Sync {
    fn version(&self) -> &str;

    /// Files the project config includes on its own, as absolute paths.
    fn config_file_names(
        &self,
        config_path: &Path,
        overlay: &Overlay,
    ) -> Result<Vec<PathBuf>, DiagnosticError>;

    /// Syntactic, semantic and global diagnostics for the program.
    fn run(&self, program: &ProgramSpec<'_>) -> Result<Vec<RawDiagnostic>, DiagnosticError>;
}

pub trait CheckerFactory: Send + Sync {
    fn resolve(&self, project_root: &Path) -> Result<Box<dyn TypeChecker>, DiagnosticError>;
}

/// Resolves `typescript` from the project's `node_modules` and drives it
/// through a `node` subprocess.
#[derive(Debug, Clone)]
pub struct NodeTypeScriptFactory {
    pub node_binary: String,
    pub timeout: Option<Duration>,
}

impl NodeTypeScriptFactory {
    pub fn new(node_binary: impl Into<String>, timeout: Option<Duration>) -> Self {
        Self {
            node_binary: node_binary.into(),
            timeout,
        }
    }
}

#[derive(Deserialize)]
struct PackageManifest {
    version: Option<String>,
    main: Option<String>,
}

/// Locate the installed `typescript` package the way node resolves modules:
/// `node_modules` in the project root, then in each ancestor.
pub fn find_typescript(project_root: &Path) -> Result<(PathBuf, String), DiagnosticError> {
    let not_found = |reason: String| DiagnosticError::CheckerNotFound {
        root: project_root.to_path_buf(),
        reason,
    };

    for dir in project_root.ancestors() {
        let package_dir = dir.join("node_modules").join("typescript");
        let manifest_path = package_dir.join("package.json");
        if !manifest_path.is_file() {
            continue;
        }
        let content = std::fs::read_to_string(&manifest_path)
            .map_err(|e| not_found(format!("cannot read {}: {}", manifest_path.display(), e)))?;
        let manifest: PackageManifest = serde_json::from_str(&content)
            .map_err(|e| not_found(format!("invalid {}: {}", manifest_path.display(), e)))?;
        let main = manifest
            .main
            .unwrap_or_else(|| "./lib/typescript.js".to_string());
        let entry = package_dir.join(main.trim_start_matches("./"));
        if !entry.is_file() {
            return Err(not_found(format!(
                "typescript entry point {} is missing",
                entry.display()
            )));
        }
        let version = manifest.version.unwrap_or_else(|| "unknown".to_string());
        return Ok((entry, version));
    }

    Err(not_found(
        "typescript is not installed in any node_modules".to_string(),
    ))
}

impl CheckerFactory for NodeTypeScriptFactory {
    fn resolve(&self, project_root: &Path) -> Result<Box<dyn TypeChecker>, DiagnosticError> {
        let (entry, version) = find_typescript(project_root)?;
        tracing::info!(
            version = %version,
            entry = %entry.display(),
            "resolved project type checker"
        );
        Ok(Box::new(NodeTypeScript {
            node_binary: self.node_binary.clone(),
            timeout: self.timeout,
            project_root: project_root.to_path_buf(),
            typescript_entry: entry,
            version,
        }))
    }
}

#[derive(Debug, Clone)]
pub struct NodeTypeScript {
    node_binary: String,
    timeout: Option<Duration>,
    project_root: PathBuf,
    typescript_entry: PathBuf,
    version: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HostRequest<'a> {
    mode: &'static str,
    typescript: &'a Path,
    config_path: &'a Path,
    root_names: &'a [PathBuf],
    virtual_writes: &'a BTreeMap<PathBuf, String>,
    deleted_paths: &'a BTreeSet<PathBuf>,
}

#[derive(Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
enum HostResponse {
    Ok {
        #[serde(default, rename = "fileNames")]
        file_names: Vec<PathBuf>,
        #[serde(default)]
        diagnostics: Vec<RawDiagnostic>,
    },
    Error {
        message: String,
    },
}

impl NodeTypeScript {
    fn invoke(&self, request: &HostRequest<'_>) -> Result<(Vec<PathBuf>, Vec<RawDiagnostic>), DiagnosticError> {
        let input = serde_json::to_vec(request)
            .map_err(|e| DiagnosticError::Process(format!("cannot encode request: {}", e)))?;

        let mut command = Command::new(&self.node_binary);
        command
            .current_dir(&self.project_root)
            .arg("-e")
            .arg(TS_HOST_SOURCE);

        let result =
            run_command(&mut command, Some(&input), self.timeout).map_err(DiagnosticError::Process)?;
        if result.timed_out {
            return Err(DiagnosticError::Process(format!(
                "{} timed out",
                self.node_binary
            )));
        }

        match serde_json::from_str::<HostResponse>(result.stdout.trim()) {
            Ok(HostResponse::Ok {
                file_names,
                diagnostics,
            }) => Ok((file_names, diagnostics)),
            Ok(HostResponse::Error { message }) => Err(DiagnosticError::Checker(truncate(
                &message,
                MAX_ERROR_DETAIL_CHARS,
            ))),
            Err(err) => Err(DiagnosticError::Process(format!(
                "unexpected checker output ({}): {}",
                err,
                result.failure_detail(MAX_ERROR_DETAIL_CHARS)
            ))),
        }
    }
}

impl TypeChecker for NodeTypeScript {
    fn version(&self) -> &str {
        &self.version
    }

    fn config_file_names(
        &self,
        config_path: &Path,
        overlay: &Overlay,
    ) -> Result<Vec<PathBuf>, DiagnosticError> {
        let request = HostRequest {
            mode: "config",
            typescript: &self.typescript_entry,
            config_path,
            root_names: &[],
            virtual_writes: overlay.virtual_writes(),
            deleted_paths: overlay.deleted_paths(),
        };
        self.invoke(&request).map(|(file_names, _)| file_names)
    }

    fn run(&self, program: &ProgramSpec<'_>) -> Result<Vec<RawDiagnostic>, DiagnosticError> {
        let request = HostRequest {
            mode: "check",
            typescript: &self.typescript_entry,
            config_path: program.config_path,
            root_names: program.root_names,
            virtual_writes: program.overlay.virtual_writes(),
            deleted_paths: program.overlay.deleted_paths(),
        };
        self.invoke(&request).map(|(_, diagnostics)| diagnostics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_find_typescript_reads_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let pkg = dir.path().join("node_modules/typescript");
        fs::create_dir_all(pkg.join("lib")).unwrap();
        fs::write(
            pkg.join("package.json"),
            r#"{"name":"typescript","version":"5.4.5","main":"./lib/typescript.js"}"#,
        )
        .unwrap();
        fs::write(pkg.join("lib/typescript.js"), "module.exports = {};").unwrap();

        let (entry, version) = find_typescript(dir.path()).unwrap();
        assert_eq!(version, "5.4.5");
        assert!(entry.ends_with("lib/typescript.js"));
    }

    #[test]
    fn test_find_typescript_walks_up_to_ancestors() {
        let dir = tempfile::tempdir().unwrap();
        let pkg = dir.path().join("node_modules/typescript");
        fs::create_dir_all(pkg.join("lib")).unwrap();
        fs::write(pkg.join("package.json"), r#"{"version":"5.0.0"}"#).unwrap();
        fs::write(pkg.join("lib/typescript.js"), "").unwrap();
        let nested = dir.path().join("apps/web");
        fs::create_dir_all(&nested).unwrap();

        let (_, version) = find_typescript(&nested).unwrap();
        assert_eq!(version, "5.0.0");
    }

    #[test]
    fn test_missing_typescript_is_a_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = NodeTypeScriptFactory::new("node", None)
            .resolve(dir.path())
            .err()
            .unwrap();
        assert!(matches!(err, DiagnosticError::CheckerNotFound { .. }));
    }

    #[test]
    fn test_host_response_parses_both_shapes() {
        let ok: HostResponse = serde_json::from_str(
            r#"{"status":"ok","diagnostics":[{"file":"/p/a.ts","line":0,"character":4,"message":"m","code":2304,"category":"error"}]}"#,
        )
        .unwrap();
        assert!(matches!(ok, HostResponse::Ok { ref diagnostics, .. } if diagnostics.len() == 1));

        let err: HostResponse =
            serde_json::from_str(r#"{"status":"error","message":"bad tsconfig"}"#).unwrap();
        assert!(matches!(err, HostResponse::Error { message } if message == "bad tsconfig"));
    }
}
