use std::path::{Component, Path, PathBuf};

use tempfile::TempDir;

use crate::error::{DockhandError, Result};

/// Fresh scratch directory owned by one task execution.
///
/// The directory is removed when the value is dropped, on every exit path.
/// A failed removal is logged and never reaches the task.
#[derive(Debug)]
pub struct Workspace {
    dir: Option<TempDir>,
    path: PathBuf,
}

impl Workspace {
    pub fn create() -> Result<Self> {
        let dir = tempfile::Builder::new().prefix("dockhand_").tempdir()?;
        let path = dir.path().to_path_buf();
        tracing::debug!(path = %path.display(), "Created workspace");
        Ok(Self {
            dir: Some(dir),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Resolve `relative` inside the workspace.
    ///
    /// Absolute paths and paths that climb out with `..` are rejected.
    pub fn resolve(&self, relative: &str) -> Result<PathBuf> {
        let candidate = Path::new(relative);
        let mut depth: usize = 0;
        for component in candidate.components() {
            match component {
                Component::Normal(_) => depth += 1,
                Component::CurDir => {}
                Component::ParentDir => {
                    depth = depth.checked_sub(1).ok_or_else(|| {
                        DockhandError::Precondition(format!(
                            "path {relative} escapes the workspace"
                        ))
                    })?;
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(DockhandError::Precondition(format!(
                        "path {relative} must be relative to the workspace"
                    )));
                }
            }
        }
        Ok(self.path.join(candidate))
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            if let Err(e) = dir.close() {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove workspace");
            } else {
                tracing::debug!(path = %self.path.display(), "Removed workspace");
            }
        }
    }
}
