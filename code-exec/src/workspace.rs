use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::{config::WorkspaceConfig, error::Error, Result};

/// Name of the runtime-support file placed in every workspace.
pub const SUPPORT_FILE_NAME: &str = "sandbox.runtime.json";

const SUPPORT_TEMPLATE: &str = include_str!("../templates/sandbox.runtime.json");

/// Ephemeral per-session directory holding the support file and the
/// compiled artifact.
///
/// Removal happens exactly once: either through [`Workspace::destroy`] or,
/// if the owner is dropped first (panic, aborted task), synchronously in
/// `Drop`.
#[derive(Debug)]
pub struct Workspace {
    path: PathBuf,
    removed: bool,
}

impl Workspace {
    /// Allocate `<temp_root>/<prefix><id>` and seed it with the support file.
    pub async fn create(config: &WorkspaceConfig, id: &Uuid) -> Result<Self> {
        let root = config.root();
        let path = root.join(format!("{}{}", config.prefix, id));

        fs::create_dir_all(&root).await.map_err(|e| {
            Error::Workspace(format!(
                "Failed to create temp root {}: {}",
                root.display(),
                e
            ))
        })?;

        // `create_dir` fails if the directory exists, so no two sessions can
        // end up sharing one.
        fs::create_dir(&path).await.map_err(|e| {
            Error::Workspace(format!(
                "Failed to create workspace {}: {}",
                path.display(),
                e
            ))
        })?;

        let workspace = Self {
            path,
            removed: false,
        };
        workspace.seed(config).await?;

        debug!("Created workspace {}", workspace.path.display());
        Ok(workspace)
    }

    async fn seed(&self, config: &WorkspaceConfig) -> Result<()> {
        let target = self.path.join(SUPPORT_FILE_NAME);
        match &config.support_template {
            Some(template) => {
                fs::copy(template, &target).await.map_err(|e| {
                    Error::Workspace(format!(
                        "Failed to copy support template {}: {}",
                        template.display(),
                        e
                    ))
                })?;
            }
            None => {
                fs::write(&target, SUPPORT_TEMPLATE).await.map_err(|e| {
                    Error::Workspace(format!("Failed to write support file: {}", e))
                })?;
            }
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn join(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    /// Remove the workspace directory tree.
    pub async fn destroy(mut self) -> Result<()> {
        self.removed = true;
        remove_workspace(&self.path).await
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        self.removed = true;
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => warn!(
                "Workspace {} removed on drop without explicit teardown",
                self.path.display()
            ),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => error!("Failed to clean up workspace directory: {}", e),
        }
    }
}

/// Remove a workspace directory; succeeds if it is already gone.
pub async fn remove_workspace(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path).await {
        Ok(()) => {
            debug!("Removed workspace {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::Workspace(format!(
            "Failed to remove workspace {}: {}",
            path.display(),
            e
        ))),
    }
}
