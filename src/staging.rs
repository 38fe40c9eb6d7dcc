//! Per-document working directories.
//!
//! Every pipeline invocation owns exactly one [`StagingDir`] under the
//! process-wide staging root. The staged PDF copy, the page images and the
//! report all live there and nowhere else, so concurrent documents never
//! share files.
//!
//! A `StagingDir` wraps a [`tempfile::TempDir`] created inside the root:
//! the random suffix keeps names disjoint for repeated ids, and dropping the
//! guard removes the directory on any exit path that skips
//! [`StagingDir::release`] (early `?` return, cancellation, unwinding). In
//! diagnostic mode the directory is detached from the guard at creation and
//! outlives the run.

use crate::config::PipelineConfig;
use crate::error::StatementError;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info};

/// Characters allowed in a staging directory name; anything else collapses
/// to `_` so transport ids can never escape the staging root.
static RE_UNSAFE_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^A-Za-z0-9_-]+").unwrap());

const MAX_ID_LEN: usize = 64;

/// Factory for per-document staging directories.
#[derive(Debug, Clone)]
pub struct StagingArea {
    root: PathBuf,
    retain: bool,
}

impl StagingArea {
    /// `retain = true` keeps every directory after release (diagnostic mode).
    pub fn new(root: impl Into<PathBuf>, retain: bool) -> Self {
        Self {
            root: root.into(),
            retain,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.staging_root.clone(), config.debug)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create a fresh directory `<root>/<sanitized id>-<random>`.
    pub async fn acquire(&self, document_id: &str) -> Result<StagingDir, StatementError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| StatementError::staging(&self.root, e))?;

        let prefix = format!("{}-", sanitize_id(document_id));
        let temp_dir = tempfile::Builder::new()
            .prefix(&prefix)
            .tempdir_in(&self.root)
            .map_err(|e| StatementError::staging(self.root.join(&prefix), e))?;

        if self.retain {
            let path = temp_dir.keep();
            info!(
                "Diagnostic mode: staging directory will be kept at {}",
                path.display()
            );
            return Ok(StagingDir {
                path,
                temp_dir: None,
            });
        }

        debug!("Created staging directory: {}", temp_dir.path().display());
        Ok(StagingDir {
            path: temp_dir.path().to_path_buf(),
            temp_dir: Some(temp_dir),
        })
    }
}

/// Turn an arbitrary transport id into a safe single path component.
pub fn sanitize_id(document_id: &str) -> String {
    let cleaned = RE_UNSAFE_CHARS.replace_all(document_id.trim(), "_");
    let cleaned: String = cleaned.chars().take(MAX_ID_LEN).collect();
    if cleaned.trim_matches('_').is_empty() {
        "document".to_string()
    } else {
        cleaned
    }
}

/// Exclusive handle on one document's working directory.
#[derive(Debug)]
pub struct StagingDir {
    path: PathBuf,
    /// `None` when the directory is retained for inspection.
    temp_dir: Option<TempDir>,
}

impl StagingDir {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of a file inside the staging directory.
    pub fn file(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    pub fn is_retained(&self) -> bool {
        self.temp_dir.is_none()
    }

    /// Remove the directory and everything in it.
    pub async fn release(self) -> Result<(), StatementError> {
        let Some(temp_dir) = self.temp_dir else {
            info!(
                "Diagnostic mode: staging directory kept at {}",
                self.path.display()
            );
            return Ok(());
        };

        let path = self.path;
        tokio::task::spawn_blocking(move || temp_dir.close())
            .await
            .map_err(|e| StatementError::Internal(format!("Release task panicked: {}", e)))?
            .map_err(|e| StatementError::staging(&path, e))?;
        debug!("Released staging directory: {}", path.display());
        Ok(())
    }
}
