use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::{debug, warn};

use crate::error::PipelineResult;

/// A job's private scratch directory under the shared temp root. Its name
/// starts with the job namespace so concurrent jobs never collide. Dropping
/// it deletes everything inside, whichever way the job ended.
#[derive(Debug)]
pub struct JobWorkspace {
    dir: TempDir,
}

impl JobWorkspace {
    pub fn create(root: &Path, namespace: &str) -> PipelineResult<Self> {
        fs::create_dir_all(root)?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("{namespace}-"))
            .tempdir_in(root)?;
        debug!("Created workspace {}", dir.path().display());
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn file(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Removes the workspace. Failure is logged, never returned.
    pub fn close(self) {
        let path = self.dir.path().to_path_buf();
        match self.dir.close() {
            Ok(()) => debug!("Removed workspace {}", path.display()),
            Err(e) => warn!("Failed to remove workspace {}: {}", path.display(), e),
        }
    }
}

/// Entries in `root` belonging to `namespace`.
pub fn leftovers(root: &Path, namespace: &str) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(root) else {
        return Vec::new();
    };
    entries
        .filter_map(Result::ok)
        .filter(|e| e.file_name().to_string_lossy().starts_with(namespace))
        .map(|e| e.path())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workspace_is_namespaced_and_removed() {
        let root = tempfile::tempdir().unwrap();
        let ws = JobWorkspace::create(root.path(), "storyreel-abc").unwrap();
        std::fs::write(ws.file("norm_000.wav"), b"x").unwrap();
        assert_eq!(leftovers(root.path(), "storyreel-abc").len(), 1);
        ws.close();
        assert!(leftovers(root.path(), "storyreel-abc").is_empty());
    }

    #[test]
    fn concurrent_workspaces_do_not_collide() {
        let root = tempfile::tempdir().unwrap();
        let a = JobWorkspace::create(root.path(), "storyreel-a").unwrap();
        let b = JobWorkspace::create(root.path(), "storyreel-b").unwrap();
        assert_ne!(a.path(), b.path());
        drop(a);
        assert!(leftovers(root.path(), "storyreel-a").is_empty());
        assert_eq!(leftovers(root.path(), "storyreel-b").len(), 1);
    }
}
