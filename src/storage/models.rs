//! Model discovery
//!
//! Finds loadable model files in a directory.

use crate::inference::ModelFormat;
use crate::storage::{get_data_dir, StorageError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Information about a model file on disk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Full path to the model file
    pub path: PathBuf,
    /// Filename of the model
    pub filename: String,
    /// File size in bytes
    pub size_bytes: u64,
    /// Last modification time
    pub last_modified: SystemTime,
}

impl ModelInfo {
    fn from_path(path: PathBuf) -> Result<Self, std::io::Error> {
        let metadata = fs::metadata(&path)?;
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string();

        Ok(Self {
            path,
            filename,
            size_bytes: metadata.len(),
            last_modified: metadata.modified()?,
        })
    }

    pub fn format(&self) -> ModelFormat {
        ModelFormat::from_path(&self.path)
    }

    /// Get a human-readable size string
    pub fn size_string(&self) -> String {
        const KB: f64 = 1024.0;
        const MB: f64 = KB * 1024.0;
        const GB: f64 = MB * 1024.0;

        let bytes = self.size_bytes as f64;
        match bytes {
            b if b < KB => format!("{} B", self.size_bytes),
            b if b < MB => format!("{:.2} KB", b / KB),
            b if b < GB => format!("{:.2} MB", b / MB),
            b => format!("{:.2} GB", b / GB),
        }
    }
}

/// Lists the model files in `directory` that this engine can load, sorted by
/// file name.
///
/// A missing directory yields an empty list.
pub fn scan_models_directory(directory: &Path) -> Result<Vec<ModelInfo>, StorageError> {
    if !directory.is_dir() {
        tracing::warn!("Models directory not found: {}", directory.display());
        return Ok(vec![]);
    }

    let mut models = vec![];

    for entry in fs::read_dir(directory)? {
        let path = entry?.path();
        if !path.is_file() || !ModelFormat::from_path(&path).is_supported() {
            continue;
        }

        match ModelInfo::from_path(path.clone()) {
            Ok(model_info) => {
                tracing::debug!("Found model: {}", model_info.filename);
                models.push(model_info);
            }
            Err(e) => tracing::warn!("Failed to read model file {:?}: {}", path, e),
        }
    }

    models.sort_by(|a, b| a.filename.cmp(&b.filename));
    tracing::info!("Found {} model(s) in {}", models.len(), directory.display());

    Ok(models)
}

/// Scan the default models directory
pub fn scan_default_models_directory() -> Result<Vec<ModelInfo>, StorageError> {
    scan_models_directory(&get_data_dir()?.join("models"))
}
