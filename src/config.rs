//! Settings for checking and applying directives
//!
//! Looked up per project in `<project>/.cosmos/apply.json`, then in
//! `~/.config/cosmos/apply.json`, then defaults. A few fields can be
//! overridden from the environment.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const PROJECT_SETTINGS_FILE: &str = ".cosmos/apply.json";
const ENV_NODE_BINARY: &str = "COSMOS_NODE_BINARY";
const ENV_DATABASE_PROJECT: &str = "COSMOS_DATABASE_PROJECT";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Commit author when the repository has no `user.name`
    pub author_name: Option<String>,
    /// Commit email when the repository has no `user.email`
    pub author_email: Option<String>,
    /// Managed database the project is linked to, if any
    pub database_project_id: Option<String>,
    /// Directory holding one sub-directory per server function
    pub functions_dir: String,
    pub node_binary: String,
    /// CLI used to deploy and delete server functions
    pub supabase_binary: String,
    /// Management API used to run SQL against the linked database
    pub management_api_url: String,
    pub checker_timeout_secs: Option<u64>,
    pub install_timeout_secs: u64,
    pub lock_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            author_name: None,
            author_email: None,
            database_project_id: None,
            functions_dir: "supabase/functions".to_string(),
            node_binary: "node".to_string(),
            supabase_binary: "supabase".to_string(),
            management_api_url: "https://api.supabase.com".to_string(),
            checker_timeout_secs: None,
            install_timeout_secs: 300,
            lock_timeout_secs: 10,
        }
    }
}

/// Where the effective settings came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "path")]
pub enum SettingsSource {
    Project(PathBuf),
    Global(PathBuf),
    Defaults,
}

impl Settings {
    fn global_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("cosmos").join("apply.json"))
    }

    pub fn project_path(project_root: &Path) -> PathBuf {
        project_root.join(PROJECT_SETTINGS_FILE)
    }

    /// Load settings for a project, with environment overrides applied.
    pub fn load(project_root: &Path) -> Self {
        Self::load_with_source(project_root).0
    }

    pub fn load_with_source(project_root: &Path) -> (Self, SettingsSource) {
        let project_path = Self::project_path(project_root);
        let (mut settings, source) = if let Some(settings) = Self::load_file(&project_path) {
            (settings, SettingsSource::Project(project_path))
        } else if let Some((settings, path)) = Self::global_path()
            .and_then(|path| Self::load_file(&path).map(|s| (s, path)))
        {
            (settings, SettingsSource::Global(path))
        } else {
            (Self::default(), SettingsSource::Defaults)
        };
        settings.apply_env();
        (settings, source)
    }

    /// Read one settings file. Missing files yield `None`; corrupt files are
    /// moved aside and also yield `None`.
    pub fn load_file(path: &Path) -> Option<Self> {
        let content = fs::read_to_string(path).ok()?;
        match serde_json::from_str(&content) {
            Ok(settings) => Some(settings),
            Err(err) => {
                preserve_corrupt_settings(path, &content);
                tracing::warn!(
                    path = %path.display(),
                    "settings file was corrupted ({}); a backup was saved and it was ignored",
                    err
                );
                None
            }
        }
    }

    fn apply_env(&mut self) {
        if let Ok(node) = std::env::var(ENV_NODE_BINARY) {
            if !node.trim().is_empty() {
                self.node_binary = node.trim().to_string();
            }
        }
        if let Ok(project) = std::env::var(ENV_DATABASE_PROJECT) {
            let project = project.trim();
            self.database_project_id = (!project.is_empty()).then(|| project.to_string());
        }
    }

    pub fn checker_timeout(&self) -> Option<Duration> {
        self.checker_timeout_secs.map(Duration::from_secs)
    }

    pub fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.install_timeout_secs)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }
}

fn preserve_corrupt_settings(path: &Path, content: &str) {
    let corrupt_path = path.with_extension("json.corrupt");
    if fs::rename(path, &corrupt_path).is_err() {
        let _ = fs::write(&corrupt_path, content);
    }
}
