//! Virtual filesystem overlay
//!
//! A pending change set layered on top of a real directory. Lookups consult
//! the deleted set first, then the virtual writes, then the disk, so a file
//! that is rewritten and then deleted in the same response reads as absent.

use crate::directive::Directive;
use crate::util::normalize_lexically;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// The read side of a filesystem, as the diagnostic engine needs it.
pub trait FileSystem {
    fn file_exists(&self, path: &Path) -> bool;
    fn read_file(&self, path: &Path) -> io::Result<String>;
    fn directory_exists(&self, path: &Path) -> bool;
}

/// Plain pass-through to the disk.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealFs;

impl FileSystem for RealFs {
    fn file_exists(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn read_file(&self, path: &Path) -> io::Result<String> {
        fs::read_to_string(path)
    }

    fn directory_exists(&self, path: &Path) -> bool {
        path.is_dir()
    }
}

#[derive(Debug, Clone)]
pub struct Overlay {
    root: PathBuf,
    virtual_writes: BTreeMap<PathBuf, String>,
    deleted_paths: BTreeSet<PathBuf>,
}

impl Overlay {
    pub fn new(root: &Path) -> Self {
        Self {
            root: normalize_lexically(root),
            virtual_writes: BTreeMap::new(),
            deleted_paths: BTreeSet::new(),
        }
    }

    /// Build the overlay for a pending change set, in directive order.
    ///
    /// Dependency, SQL and UI command directives do not touch files and are
    /// ignored here.
    pub fn from_directives(root: &Path, directives: &[Directive]) -> Self {
        let mut overlay = Self::new(root);
        for directive in directives {
            match directive {
                Directive::Write(write) => {
                    let path = overlay.absolute(&write.path.to_path_buf());
                    overlay.write(path, write.content.clone());
                }
                Directive::Rename(rename) => {
                    let from = overlay.absolute(&rename.from.to_path_buf());
                    let to = overlay.absolute(&rename.to.to_path_buf());
                    overlay.rename(&from, to);
                }
                Directive::Delete(delete) => {
                    let path = overlay.absolute(&delete.path.to_path_buf());
                    overlay.delete(path);
                }
                Directive::AddDependency(_) | Directive::ExecuteSql(_) | Directive::Command(_) => {}
            }
        }
        overlay
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_empty(&self) -> bool {
        self.virtual_writes.is_empty() && self.deleted_paths.is_empty()
    }

    pub fn virtual_writes(&self) -> &BTreeMap<PathBuf, String> {
        &self.virtual_writes
    }

    pub fn deleted_paths(&self) -> &BTreeSet<PathBuf> {
        &self.deleted_paths
    }

    pub fn write(&mut self, path: PathBuf, content: String) {
        let path = self.absolute(&path);
        self.deleted_paths.remove(&path);
        self.virtual_writes.insert(path, content);
    }

    pub fn delete(&mut self, path: PathBuf) {
        let path = self.absolute(&path);
        // Deleting a directory also drops pending writes beneath it.
        self.virtual_writes.retain(|written, _| !written.starts_with(&path));
        self.deleted_paths.insert(path);
    }

    /// Delete `from` and write its current content (as this overlay sees it)
    /// to `to`. An unreadable source leaves `to` unset.
    pub fn rename(&mut self, from: &Path, to: PathBuf) {
        let content = self.read_file(from);
        self.delete(from.to_path_buf());
        match content {
            Ok(content) => self.write(to, content),
            Err(err) => {
                tracing::warn!(
                    from = %from.display(),
                    to = %to.display(),
                    "rename source unreadable, destination left unset: {}",
                    err
                );
            }
        }
    }

    fn absolute(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            normalize_lexically(path)
        } else {
            normalize_lexically(&self.root.join(path))
        }
    }

    fn under_deleted_dir(&self, path: &Path) -> bool {
        path.ancestors()
            .skip(1)
            .any(|ancestor| self.deleted_paths.contains(ancestor))
    }
}

impl FileSystem for Overlay {
    fn file_exists(&self, path: &Path) -> bool {
        let path = self.absolute(path);
        if self.deleted_paths.contains(&path) {
            return false;
        }
        if self.virtual_writes.contains_key(&path) {
            return true;
        }
        if self.under_deleted_dir(&path) {
            return false;
        }
        RealFs.file_exists(&path)
    }

    fn read_file(&self, path: &Path) -> io::Result<String> {
        let path = self.absolute(path);
        if self.deleted_paths.contains(&path) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} is deleted in the pending changes", path.display()),
            ));
        }
        if let Some(content) = self.virtual_writes.get(&path) {
            return Ok(content.clone());
        }
        if self.under_deleted_dir(&path) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} is inside a deleted directory", path.display()),
            ));
        }
        RealFs.read_file(&path)
    }

    fn directory_exists(&self, path: &Path) -> bool {
        let path = self.absolute(path);
        if self
            .virtual_writes
            .keys()
            .any(|written| written != &path && written.starts_with(&path))
        {
            return true;
        }
        if self.deleted_paths.contains(&path) || self.under_deleted_dir(&path) {
            return false;
        }
        RealFs.directory_exists(&path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn project() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/a.ts"), "disk a").unwrap();
        fs::write(dir.path().join("src/b.ts"), "disk b").unwrap();
        dir
    }

    #[test]
    fn test_passes_through_to_disk() {
        let dir = project();
        let overlay = Overlay::from_directives(dir.path(), &[]);
        assert!(overlay.is_empty());
        assert!(overlay.file_exists(Path::new("src/a.ts")));
        assert_eq!(overlay.read_file(Path::new("src/a.ts")).unwrap(), "disk a");
        assert!(!overlay.file_exists(Path::new("src/missing.ts")));
    }

    #[test]
    fn test_virtual_write_shadows_disk() {
        let dir = project();
        let directives = vec![Directive::write("src/a.ts", "virtual a").unwrap()];
        let overlay = Overlay::from_directives(dir.path(), &directives);
        assert_eq!(
            overlay.read_file(&dir.path().join("src/a.ts")).unwrap(),
            "virtual a"
        );
        assert_eq!(fs::read_to_string(dir.path().join("src/a.ts")).unwrap(), "disk a");
    }

    #[test]
    fn test_write_then_delete_is_absent() {
        let dir = project();
        let directives = vec![
            Directive::write("a.ts", "X").unwrap(),
            Directive::delete("a.ts").unwrap(),
        ];
        let overlay = Overlay::from_directives(dir.path(), &directives);
        assert!(!overlay.file_exists(Path::new("a.ts")));
        assert!(overlay.virtual_writes().is_empty());
        assert_eq!(overlay.deleted_paths().len(), 1);
    }

    #[test]
    fn test_delete_then_write_exists_again() {
        let dir = project();
        let directives = vec![
            Directive::delete("src/a.ts").unwrap(),
            Directive::write("src/a.ts", "back").unwrap(),
        ];
        let overlay = Overlay::from_directives(dir.path(), &directives);
        assert_eq!(overlay.read_file(Path::new("src/a.ts")).unwrap(), "back");
        assert!(overlay.deleted_paths().is_empty());
    }

    #[test]
    fn test_rename_moves_content() {
        let dir = project();
        let directives = vec![Directive::rename("src/b.ts", "src/lib/c.ts").unwrap()];
        let overlay = Overlay::from_directives(dir.path(), &directives);
        assert!(!overlay.file_exists(Path::new("src/b.ts")));
        assert_eq!(overlay.read_file(Path::new("src/lib/c.ts")).unwrap(), "disk b");
        assert!(overlay.directory_exists(Path::new("src/lib")));
    }

    #[test]
    fn test_rename_sees_earlier_virtual_write() {
        let dir = project();
        let directives = vec![
            Directive::write("src/new.ts", "fresh").unwrap(),
            Directive::rename("src/new.ts", "src/moved.ts").unwrap(),
        ];
        let overlay = Overlay::from_directives(dir.path(), &directives);
        assert_eq!(overlay.read_file(Path::new("src/moved.ts")).unwrap(), "fresh");
    }

    #[test]
    fn test_rename_of_missing_source_leaves_destination_unset() {
        let dir = project();
        let directives = vec![Directive::rename("src/nope.ts", "src/dest.ts").unwrap()];
        let overlay = Overlay::from_directives(dir.path(), &directives);
        assert!(!overlay.file_exists(Path::new("src/dest.ts")));
        assert!(!overlay.file_exists(Path::new("src/nope.ts")));
    }

    #[test]
    fn test_deleted_directory_hides_children() {
        let dir = project();
        let directives = vec![Directive::delete("src").unwrap()];
        let overlay = Overlay::from_directives(dir.path(), &directives);
        assert!(!overlay.file_exists(Path::new("src/a.ts")));
        assert!(!overlay.directory_exists(Path::new("src")));
        assert!(overlay.read_file(Path::new("src/b.ts")).is_err());
    }

    proptest! {
        #[test]
        fn prop_last_operation_decides_presence(ops in proptest::collection::vec(any::<bool>(), 1..12)) {
            let dir = tempfile::tempdir().unwrap();
            let directives: Vec<Directive> = ops
                .iter()
                .enumerate()
                .map(|(i, is_write)| {
                    if *is_write {
                        Directive::write("x.ts", &format!("v{}", i)).unwrap()
                    } else {
                        Directive::delete("x.ts").unwrap()
                    }
                })
                .collect();
            let overlay = Overlay::from_directives(dir.path(), &directives);
            let last_is_write = *ops.last().unwrap();
            prop_assert_eq!(overlay.file_exists(Path::new("x.ts")), last_is_write);
            prop_assert!(!(overlay.virtual_writes().len() == 1 && overlay.deleted_paths().len() == 1));
        }
    }
}
