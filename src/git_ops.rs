//! Git operations for committing applied directives
//!
//! Provides init, stage, remove, commit, amend, and a per-path status
//! matrix comparing HEAD, the working tree, and the index.

use crate::error::ApplyError;
use git2::{
    Commit, ErrorCode, IndexAddOption, Repository, RepositoryInitOptions, Signature, Status,
    StatusOptions,
};
use serde::Serialize;
use std::cell::OnceCell;
use std::path::{Path, PathBuf};

const DEFAULT_AUTHOR_NAME: &str = "cosmos";
const DEFAULT_AUTHOR_EMAIL: &str = "cosmos@local";

/// Whether the path exists in the HEAD commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HeadState {
    Absent,
    Present,
}

/// The working-tree copy of a path, relative to HEAD.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkdirState {
    Absent,
    SameAsHead,
    Changed,
}

/// The index entry of a path, relative to HEAD and the working tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    Absent,
    SameAsHead,
    SameAsWorkdir,
    Other,
}

/// One row of the status matrix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusRow {
    pub path: String,
    pub head: HeadState,
    pub workdir: WorkdirState,
    pub stage: StageState,
}

impl StatusRow {
    /// HEAD, index and working tree all agree.
    pub fn is_clean(&self) -> bool {
        self.head == HeadState::Present
            && self.workdir == WorkdirState::SameAsHead
            && self.stage == StageState::SameAsHead
    }

    fn from_status(path: String, s: Status) -> Self {
        let index_changed = s.is_index_new() || s.is_index_modified() || s.is_index_typechange();
        let wt_changed = s.is_wt_modified() || s.is_wt_deleted() || s.is_wt_typechange();

        let head = if s.is_index_new() || (s.is_wt_new() && !s.is_index_deleted()) {
            HeadState::Absent
        } else {
            HeadState::Present
        };

        let workdir = if s.is_wt_deleted() || (s.is_index_deleted() && !s.is_wt_new()) {
            WorkdirState::Absent
        } else if head == HeadState::Absent
            || s.is_wt_new()
            || s.is_wt_modified()
            || s.is_wt_typechange()
            || s.is_index_modified()
            || s.is_index_typechange()
        {
            WorkdirState::Changed
        } else {
            WorkdirState::SameAsHead
        };

        let stage = if s.is_index_deleted() || (s.is_wt_new() && !s.is_index_new()) {
            StageState::Absent
        } else if !index_changed {
            StageState::SameAsHead
        } else if !wt_changed {
            StageState::SameAsWorkdir
        } else {
            StageState::Other
        };

        Self {
            path,
            head,
            workdir,
            stage,
        }
    }
}

/// The version-control operations the applier needs. Paths are
/// project-relative with forward slashes.
pub trait VersionControl {
    fn add(&self, path: &str) -> Result<(), ApplyError>;
    /// Stage every file under a directory.
    fn add_dir(&self, path: &str) -> Result<(), ApplyError>;
    /// Drop a file, or everything under a directory, from the index.
    fn remove(&self, path: &str) -> Result<(), ApplyError>;
    /// Stage every change in the working tree, deletions included.
    fn add_all(&self) -> Result<(), ApplyError>;
    /// Commit the index on top of HEAD and return the new commit id.
    fn commit(&self, message: &str) -> Result<String, ApplyError>;
    /// Replace HEAD with a commit of the current index.
    fn amend(&self, message: &str) -> Result<String, ApplyError>;
    /// Every path that is not clean, plus untracked files.
    fn status_matrix(&self) -> Result<Vec<StatusRow>, ApplyError>;
}

fn vcs(action: &'static str) -> impl FnOnce(git2::Error) -> ApplyError {
    move |e| ApplyError::vcs(action, e)
}

pub struct GitRepo {
    repo: Repository,
    fallback_name: String,
    fallback_email: String,
}

impl GitRepo {
    /// Open the repository rooted at `root`, creating it when there is none.
    pub fn open_or_init(root: &Path) -> Result<Self, ApplyError> {
        let repo = match Repository::open(root) {
            Ok(repo) => repo,
            Err(e) if e.code() == ErrorCode::NotFound => {
                tracing::info!(root = %root.display(), "initializing git repository");
                let mut opts = RepositoryInitOptions::new();
                opts.initial_head("main");
                Repository::init_opts(root, &opts).map_err(vcs("initialize repository"))?
            }
            Err(e) => return Err(ApplyError::vcs("open repository", e)),
        };
        Ok(Self {
            repo,
            fallback_name: DEFAULT_AUTHOR_NAME.to_string(),
            fallback_email: DEFAULT_AUTHOR_EMAIL.to_string(),
        })
    }

    /// Author used when the repository config has no `user.name`/`user.email`.
    pub fn with_fallback_author(mut self, name: Option<String>, email: Option<String>) -> Self {
        if let Some(name) = name {
            self.fallback_name = name;
        }
        if let Some(email) = email {
            self.fallback_email = email;
        }
        self
    }

    /// Id of the commit HEAD points at, if any.
    pub fn head_id(&self) -> Option<String> {
        self.head_commit()
            .ok()
            .flatten()
            .map(|commit| commit.id().to_string())
    }

    fn head_commit(&self) -> Result<Option<Commit<'_>>, git2::Error> {
        match self.repo.head() {
            Ok(head) => head.peel_to_commit().map(Some),
            Err(e) if e.code() == ErrorCode::UnbornBranch || e.code() == ErrorCode::NotFound => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn signature(&self) -> Result<Signature<'static>, git2::Error> {
        let config = self.repo.config()?;
        let name = config
            .get_string("user.name")
            .unwrap_or_else(|_| self.fallback_name.clone());
        let email = config
            .get_string("user.email")
            .unwrap_or_else(|_| self.fallback_email.clone());
        Signature::now(&name, &email)
    }
}

impl VersionControl for GitRepo {
    fn add(&self, path: &str) -> Result<(), ApplyError> {
        let mut index = self.repo.index().map_err(vcs("read index"))?;
        index.add_path(Path::new(path)).map_err(vcs("stage file"))?;
        index.write().map_err(vcs("write index"))
    }

    fn add_dir(&self, path: &str) -> Result<(), ApplyError> {
        let mut index = self.repo.index().map_err(vcs("read index"))?;
        let specs = [path.to_string(), format!("{}/*", path.trim_end_matches('/'))];
        index
            .add_all(specs.iter(), IndexAddOption::DEFAULT, None)
            .map_err(vcs("stage directory"))?;
        index.write().map_err(vcs("write index"))
    }

    fn remove(&self, path: &str) -> Result<(), ApplyError> {
        let mut index = self.repo.index().map_err(vcs("read index"))?;
        let path = Path::new(path);
        index.remove_path(path).map_err(vcs("unstage file"))?;
        index.remove_dir(path, 0).map_err(vcs("unstage directory"))?;
        index.write().map_err(vcs("write index"))
    }

    fn add_all(&self) -> Result<(), ApplyError> {
        let mut index = self.repo.index().map_err(vcs("read index"))?;
        index
            .add_all(["*"].iter(), IndexAddOption::DEFAULT, None)
            .map_err(vcs("stage all"))?;
        index
            .update_all(["*"].iter(), None)
            .map_err(vcs("stage deletions"))?;
        index.write().map_err(vcs("write index"))
    }

    fn commit(&self, message: &str) -> Result<String, ApplyError> {
        let mut index = self.repo.index().map_err(vcs("read index"))?;
        let tree_id = index.write_tree().map_err(vcs("write tree"))?;
        let tree = self.repo.find_tree(tree_id).map_err(vcs("find tree"))?;
        let sig = self.signature().map_err(vcs("build signature"))?;

        let parent = self.head_commit().map_err(vcs("resolve HEAD"))?;
        let parents: Vec<&Commit<'_>> = parent.iter().collect();

        let oid = self
            .repo
            .commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)
            .map_err(vcs("commit"))?;
        tracing::info!(commit = %oid, "created commit");
        Ok(oid.to_string())
    }

    fn amend(&self, message: &str) -> Result<String, ApplyError> {
        let head = self
            .head_commit()
            .map_err(vcs("resolve HEAD"))?
            .ok_or_else(|| {
                ApplyError::vcs("amend", git2::Error::from_str("there is no commit to amend"))
            })?;
        let mut index = self.repo.index().map_err(vcs("read index"))?;
        let tree_id = index.write_tree().map_err(vcs("write tree"))?;
        let tree = self.repo.find_tree(tree_id).map_err(vcs("find tree"))?;

        let oid = head
            .amend(Some("HEAD"), None, None, None, Some(message), Some(&tree))
            .map_err(vcs("amend"))?;
        tracing::info!(commit = %oid, "amended commit");
        Ok(oid.to_string())
    }

    fn status_matrix(&self) -> Result<Vec<StatusRow>, ApplyError> {
        let mut opts = StatusOptions::new();
        opts.include_untracked(true);
        opts.recurse_untracked_dirs(true);
        opts.include_ignored(false);
        opts.include_unmodified(false);
        opts.exclude_submodules(true);

        let statuses = self
            .repo
            .statuses(Some(&mut opts))
            .map_err(vcs("read status"))?;
        Ok(statuses
            .iter()
            .filter_map(|entry| {
                let path = entry.path()?.to_string();
                Some(StatusRow::from_status(path, entry.status()))
            })
            .collect())
    }
}

/// A [`GitRepo`] opened, or created, on first use. Applies that end up
/// touching nothing never turn a plain directory into a repository.
pub struct LazyGitRepo {
    root: PathBuf,
    author_name: Option<String>,
    author_email: Option<String>,
    repo: OnceCell<GitRepo>,
}

impl LazyGitRepo {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            author_name: None,
            author_email: None,
            repo: OnceCell::new(),
        }
    }

    pub fn with_fallback_author(mut self, name: Option<String>, email: Option<String>) -> Self {
        self.author_name = name;
        self.author_email = email;
        self
    }

    /// Whether any operation has opened the repository yet.
    pub fn is_open(&self) -> bool {
        self.repo.get().is_some()
    }

    fn repo(&self) -> Result<&GitRepo, ApplyError> {
        if let Some(repo) = self.repo.get() {
            return Ok(repo);
        }
        let repo = GitRepo::open_or_init(&self.root)?
            .with_fallback_author(self.author_name.clone(), self.author_email.clone());
        Ok(self.repo.get_or_init(|| repo))
    }
}

impl VersionControl for LazyGitRepo {
    fn add(&self, path: &str) -> Result<(), ApplyError> {
        self.repo()?.add(path)
    }

    fn add_dir(&self, path: &str) -> Result<(), ApplyError> {
        self.repo()?.add_dir(path)
    }

    fn remove(&self, path: &str) -> Result<(), ApplyError> {
        self.repo()?.remove(path)
    }

    fn add_all(&self) -> Result<(), ApplyError> {
        self.repo()?.add_all()
    }

    fn commit(&self, message: &str) -> Result<String, ApplyError> {
        self.repo()?.commit(message)
    }

    fn amend(&self, message: &str) -> Result<String, ApplyError> {
        self.repo()?.amend(message)
    }

    fn status_matrix(&self) -> Result<Vec<StatusRow>, ApplyError> {
        self.repo()?.status_matrix()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn create_temp_repo() -> (tempfile::TempDir, GitRepo) {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let repo = GitRepo::open_or_init(temp_dir.path()).expect("Failed to init repo");
        let mut config = repo.repo.config().unwrap();
        config.set_str("user.name", "Test User").unwrap();
        config.set_str("user.email", "test@example.com").unwrap();
        (temp_dir, repo)
    }

    fn commit_count(repo: &GitRepo) -> usize {
        let mut walk = repo.repo.revwalk().unwrap();
        walk.push_head().unwrap();
        walk.count()
    }

    #[test]
    fn test_open_or_init_creates_then_reopens() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!dir.path().join(".git").exists());
        GitRepo::open_or_init(dir.path()).unwrap();
        assert!(dir.path().join(".git").is_dir());

        let reopened = GitRepo::open_or_init(dir.path()).unwrap();
        assert!(reopened.head_id().is_none());
    }

    #[test]
    fn test_first_commit_on_unborn_head() {
        let (dir, repo) = create_temp_repo();
        fs::write(dir.path().join("a.txt"), "one").unwrap();
        repo.add("a.txt").unwrap();
        let id = repo.commit("first").unwrap();

        assert_eq!(repo.head_id().as_deref(), Some(id.as_str()));
        assert!(repo.status_matrix().unwrap().is_empty());
        let author = repo.repo.head().unwrap().peel_to_commit().unwrap();
        assert_eq!(author.author().name(), Some("Test User"));
    }

    #[test]
    fn test_status_matrix_describes_each_state() {
        let (dir, repo) = create_temp_repo();
        fs::write(dir.path().join("tracked.txt"), "v1").unwrap();
        repo.add("tracked.txt").unwrap();
        repo.commit("base").unwrap();

        fs::write(dir.path().join("tracked.txt"), "v2").unwrap();
        fs::create_dir_all(dir.path().join("new")).unwrap();
        fs::write(dir.path().join("new/untracked.txt"), "x").unwrap();
        fs::write(dir.path().join("staged.txt"), "s").unwrap();
        repo.add("staged.txt").unwrap();

        let mut rows = repo.status_matrix().unwrap();
        rows.sort_by(|a, b| a.path.cmp(&b.path));
        assert_eq!(
            rows,
            vec![
                StatusRow {
                    path: "new/untracked.txt".to_string(),
                    head: HeadState::Absent,
                    workdir: WorkdirState::Changed,
                    stage: StageState::Absent,
                },
                StatusRow {
                    path: "staged.txt".to_string(),
                    head: HeadState::Absent,
                    workdir: WorkdirState::Changed,
                    stage: StageState::SameAsWorkdir,
                },
                StatusRow {
                    path: "tracked.txt".to_string(),
                    head: HeadState::Present,
                    workdir: WorkdirState::Changed,
                    stage: StageState::SameAsHead,
                },
            ]
        );
        assert!(rows.iter().all(|row| !row.is_clean()));
    }

    #[test]
    fn test_remove_stages_deletion_of_directory() {
        let (dir, repo) = create_temp_repo();
        fs::create_dir_all(dir.path().join("gone")).unwrap();
        fs::write(dir.path().join("gone/a.txt"), "a").unwrap();
        fs::write(dir.path().join("gone/b.txt"), "b").unwrap();
        repo.add_all().unwrap();
        repo.commit("base").unwrap();

        fs::remove_dir_all(dir.path().join("gone")).unwrap();
        repo.remove("gone").unwrap();
        repo.commit("remove").unwrap();
        assert!(repo.status_matrix().unwrap().is_empty());
    }

    #[test]
    fn test_amend_folds_extra_changes_into_head() {
        let (dir, repo) = create_temp_repo();
        fs::write(dir.path().join("a.txt"), "a").unwrap();
        repo.add("a.txt").unwrap();
        let first = repo.commit("first").unwrap();

        fs::write(dir.path().join("stray.txt"), "edited by hand").unwrap();
        repo.add_all().unwrap();
        let amended = repo.amend("first\n\nplus stray").unwrap();

        assert_ne!(first, amended);
        assert_eq!(commit_count(&repo), 1);
        assert!(repo.status_matrix().unwrap().is_empty());
        let head = repo.repo.head().unwrap().peel_to_commit().unwrap();
        assert!(head.tree().unwrap().get_name("stray.txt").is_some());
        assert_eq!(head.message(), Some("first\n\nplus stray"));
    }

    #[test]
    fn test_amend_without_commit_is_an_error() {
        let (_dir, repo) = create_temp_repo();
        assert!(matches!(
            repo.amend("nothing"),
            Err(ApplyError::Vcs { .. })
        ));
    }

    #[test]
    fn test_add_all_stages_deletions() {
        let (dir, repo) = create_temp_repo();
        fs::write(dir.path().join("a.txt"), "a").unwrap();
        repo.add_all().unwrap();
        repo.commit("base").unwrap();

        fs::remove_file(dir.path().join("a.txt")).unwrap();
        let rows = repo.status_matrix().unwrap();
        assert_eq!(rows[0].workdir, WorkdirState::Absent);

        repo.add_all().unwrap();
        repo.commit("delete").unwrap();
        assert!(repo.status_matrix().unwrap().is_empty());
    }

    #[test]
    fn test_add_dir_stages_nested_files() {
        let (dir, repo) = create_temp_repo();
        fs::create_dir_all(dir.path().join("pkg/deep")).unwrap();
        fs::write(dir.path().join("pkg/a.ts"), "a").unwrap();
        fs::write(dir.path().join("pkg/deep/b.ts"), "b").unwrap();
        fs::write(dir.path().join("outside.ts"), "o").unwrap();

        repo.add_dir("pkg").unwrap();
        repo.commit("pkg").unwrap();

        let rows = repo.status_matrix().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].path, "outside.ts");
        let head = repo.repo.head().unwrap().peel_to_commit().unwrap();
        let tree = head.tree().unwrap();
        assert!(tree.get_path(Path::new("pkg/a.ts")).is_ok());
        assert!(tree.get_path(Path::new("pkg/deep/b.ts")).is_ok());
    }

    #[test]
    fn test_lazy_repo_initializes_on_first_use() {
        let dir = tempfile::tempdir().unwrap();
        let lazy = LazyGitRepo::new(dir.path())
            .with_fallback_author(Some("Lazy".to_string()), Some("lazy@example.com".to_string()));
        assert!(!lazy.is_open());
        assert!(!dir.path().join(".git").exists());

        fs::write(dir.path().join("a.txt"), "a").unwrap();
        lazy.add("a.txt").unwrap();
        assert!(lazy.is_open());
        assert!(dir.path().join(".git").is_dir());
        lazy.commit("first").unwrap();
        assert!(lazy.status_matrix().unwrap().is_empty());
    }
}
