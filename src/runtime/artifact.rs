//! Artifact resolution
//!
//! Maps the opaque reference stored with a workload to a file on disk.

use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Resolves stored artifact references to runnable paths
pub trait ArtifactResolver: Send + Sync {
    /// Path of an existing artifact file, `None` if it does not resolve
    fn resolve(&self, reference: &str) -> Option<PathBuf>;
}

/// Resolver rooted at the project directory
#[derive(Debug, Clone)]
pub struct DirectoryResolver {
    root: PathBuf,
}

impl DirectoryResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ArtifactResolver for DirectoryResolver {
    fn resolve(&self, reference: &str) -> Option<PathBuf> {
        let relative = Path::new(reference);

        // Only plain relative paths below the root
        let confined = !reference.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !confined {
            debug!("Rejected artifact reference {:?}", reference);
            return None;
        }

        let path = self.root.join(relative);
        if path.is_file() {
            Some(path)
        } else {
            None
        }
    }
}
