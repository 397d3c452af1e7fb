//! Scoped working areas for engine invocations.
//!
//! Every invocation gets a fresh directory under the run's workspace root.
//! The directory (inputs, caches, partial outputs) is removed when the
//! `ScopedWorkspace` is dropped, whichever way the invocation ended, so a
//! failed attempt never leaks state into a retry.

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::debug;

use crate::error::Result;
use crate::planning::ClusterId;

/// RAII guard over one invocation's working directory.
#[derive(Debug)]
pub struct ScopedWorkspace {
    cluster: ClusterId,
    dir: TempDir,
}

impl ScopedWorkspace {
    /// Create a fresh working area for `cluster` below `root`.
    pub fn acquire(root: &Path, cluster: ClusterId, label: &str) -> Result<Self> {
        fs::create_dir_all(root)?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("{}_{}_", cluster.dir_name(), label))
            .tempdir_in(root)?;
        debug!("Acquired working area {} for {}", dir.path().display(), cluster);
        Ok(Self { cluster, dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Move the working area to `dest` instead of deleting it.
    ///
    /// A stale directory at `dest` (from an earlier run of the same cluster)
    /// is removed first.
    pub fn persist(self, dest: &Path) -> Result<PathBuf> {
        if dest.exists() {
            fs::remove_dir_all(dest)?;
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(self.dir.path(), dest)?;
        debug!("Kept artifacts of {} at {}", self.cluster, dest.display());
        // The TempDir guard now points at a missing path; its cleanup is a no-op.
        Ok(dest.to_path_buf())
    }
}

impl Drop for ScopedWorkspace {
    fn drop(&mut self) {
        if self.dir.path().exists() {
            debug!(
                "Releasing working area {} of {}",
                self.dir.path().display(),
                self.cluster
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workspace_removed_on_drop() {
        let root = tempfile::tempdir().unwrap();
        let path = {
            let ws = ScopedWorkspace::acquire(root.path(), ClusterId::new(4), "a0").unwrap();
            fs::write(ws.path().join("partial.bin"), b"half written").unwrap();
            assert!(ws.path().exists());
            ws.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn test_workspaces_are_isolated() {
        let root = tempfile::tempdir().unwrap();
        let a = ScopedWorkspace::acquire(root.path(), ClusterId::new(1), "a0").unwrap();
        let b = ScopedWorkspace::acquire(root.path(), ClusterId::new(1), "a0").unwrap();
        assert_ne!(a.path(), b.path());
        assert!(a
            .path()
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("cluster_000001_a0_"));
    }

    #[test]
    fn test_persist_replaces_stale_artifacts() {
        let root = tempfile::tempdir().unwrap();
        let dest = root.path().join("artifacts").join("cluster_000002");
        fs::create_dir_all(&dest).unwrap();
        fs::write(dest.join("stale.txt"), b"old").unwrap();

        let ws = ScopedWorkspace::acquire(&root.path().join("work"), ClusterId::new(2), "a1")
            .unwrap();
        fs::write(ws.path().join("reconstruction.json"), b"{}").unwrap();
        let kept = ws.persist(&dest).unwrap();

        assert!(kept.join("reconstruction.json").exists());
        assert!(!kept.join("stale.txt").exists());
    }
}
