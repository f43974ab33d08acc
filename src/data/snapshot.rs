//! JSON snapshot persistence
//!
//! Stores are persisted by rewriting a whole file from an in-memory
//! snapshot. Two saves racing on the same file are not isolated from each
//! other: the last writer wins.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::AppError;

/// File adapter holding one keyed map serialized as pretty JSON
#[derive(Debug, Clone)]
pub struct JsonSnapshot {
    path: PathBuf,
}

impl JsonSnapshot {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the snapshot
    ///
    /// Returns `None` if the file does not exist yet.
    pub async fn read<T: DeserializeOwned>(&self) -> Result<Option<BTreeMap<String, T>>, AppError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(AppError::Storage(format!(
                    "Failed to read {}: {}",
                    self.path.display(),
                    e
                )));
            }
        };

        let entries = serde_json::from_slice(&bytes).map_err(|e| {
            AppError::Storage(format!("Failed to parse {}: {}", self.path.display(), e))
        })?;

        tracing::debug!(path = %self.path.display(), "Snapshot loaded");
        Ok(Some(entries))
    }

    /// Overwrite the snapshot with `entries`
    pub async fn write<T: Serialize>(&self, entries: &BTreeMap<String, T>) -> Result<(), AppError> {
        let json = serde_json::to_vec_pretty(entries)
            .map_err(|e| AppError::Storage(format!("Failed to serialize snapshot: {}", e)))?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                AppError::Storage(format!("Failed to create {}: {}", parent.display(), e))
            })?;
        }

        tokio::fs::write(&self.path, json).await.map_err(|e| {
            AppError::Storage(format!("Failed to write {}: {}", self.path.display(), e))
        })?;

        tracing::debug!(path = %self.path.display(), entries = entries.len(), "Snapshot saved");
        Ok(())
    }
}
