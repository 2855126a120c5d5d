//! Per attempt scratch space on the local disk.

use std::{
    fs, io,
    path::{Path, PathBuf},
};
use tracing::{debug, warn};

const TREE_PREFIX: &str = "deploy-";

/// A working tree owned by exactly one deployment attempt.
///
/// The directory is removed when the value is dropped, so every exit path of a run (including a
/// panic unwinding through it) cleans up. `release` does the same thing but reports failures.
#[derive(Debug)]
pub struct WorkingTree {
    dir: tempfile::TempDir,
}

impl WorkingTree {
    pub fn create(root: &Path, site_id: &str) -> io::Result<Self> {
        fs::create_dir_all(root)?;

        let label: String = site_id
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
            .take(48)
            .collect();

        let dir = tempfile::Builder::new()
            .prefix(&format!("{TREE_PREFIX}{label}-"))
            .tempdir_in(root)?;

        fs::create_dir_all(dir.path().join("inputs"))?;
        fs::create_dir_all(dir.path().join("site"))?;

        debug!(path = %dir.path().display(), site_id = site_id, "Created working tree");

        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Where fetched artifacts are staged untouched.
    pub fn inputs_dir(&self) -> PathBuf {
        self.dir.path().join("inputs")
    }

    /// Where the template is materialized; this is what gets published.
    pub fn site_dir(&self) -> PathBuf {
        self.dir.path().join("site")
    }

    pub fn release(self) -> io::Result<()> {
        let path = self.dir.path().to_path_buf();
        self.dir.close()?;
        debug!(path = %path.display(), "Released working tree");
        Ok(())
    }
}

/// Removes working trees left behind by a previous process. Only safe to call before any run has
/// started.
pub fn sweep_stale(root: &Path) -> io::Result<usize> {
    if !root.exists() {
        return Ok(0);
    }

    let mut removed = 0;

    for entry in fs::read_dir(root)? {
        let entry = entry?;

        if !entry.file_name().to_string_lossy().starts_with(TREE_PREFIX) {
            continue;
        }

        if !entry.file_type()?.is_dir() {
            continue;
        }

        match fs::remove_dir_all(entry.path()) {
            Ok(_) => removed += 1,
            Err(e) => {
                warn!(path = %entry.path().display(), error = %e, "Could not remove stale working tree")
            }
        }
    }

    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tree_is_removed_on_drop_and_release() {
        let root = tempfile::tempdir().expect("Failed to create temporary directory");

        let dropped_path = {
            let tree = WorkingTree::create(root.path(), "site/one").expect("Failed to create tree");
            assert!(tree.inputs_dir().is_dir());
            assert!(tree.site_dir().is_dir());
            assert!(tree
                .path()
                .file_name()
                .map(|name| name.to_string_lossy().starts_with("deploy-siteone-"))
                .unwrap_or(false));
            tree.path().to_path_buf()
        };
        assert!(!dropped_path.exists());

        let tree = WorkingTree::create(root.path(), "site_two").expect("Failed to create tree");
        let released_path = tree.path().to_path_buf();
        tree.release().expect("Failed to release tree");
        assert!(!released_path.exists());

        assert_eq!(fs::read_dir(root.path()).expect("Failed to read root").count(), 0);
    }

    #[test]
    fn sweep_only_touches_working_trees() {
        let root = tempfile::tempdir().expect("Failed to create temporary directory");

        fs::create_dir_all(root.path().join("deploy-abc-123/site")).expect("Failed to create dir");
        fs::create_dir_all(root.path().join("keep-me")).expect("Failed to create dir");

        let removed = sweep_stale(root.path()).expect("Failed to sweep");

        assert_eq!(removed, 1);
        assert!(!root.path().join("deploy-abc-123").exists());
        assert!(root.path().join("keep-me").exists());

        assert_eq!(sweep_stale(&root.path().join("missing")).expect("Failed to sweep"), 0);
    }
}
