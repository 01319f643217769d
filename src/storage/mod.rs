//! Persistent storage
//!
//! Settings, chat history and model discovery under the platform data
//! directory.

use std::path::PathBuf;
use thiserror::Error;

pub mod history;
pub mod models;
pub mod settings;

/// Storage-related errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to access data directory: {0}")]
    DataDirError(String),
    #[error("Failed to read file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to serialize/deserialize JSON: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Get the application data directory
///
/// Returns the platform-specific application data directory:
/// - Windows: `C:\Users\{user}\AppData\Roaming\LocalChat\LocalChat`
/// - macOS: `/Users/{user}/Library/Application Support/com.LocalChat.LocalChat`
/// - Linux: `/home/{user}/.local/share/localchat`
pub fn get_data_dir() -> Result<PathBuf, StorageError> {
    directories::ProjectDirs::from("com", "LocalChat", "LocalChat")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or_else(|| StorageError::DataDirError("Could not determine data directory".to_string()))
}

/// Initialize the storage directory structure
///
/// Creates `{data_dir}/models/`; the history and settings files are written
/// on demand.
pub fn init_storage() -> Result<PathBuf, StorageError> {
    let data_dir = get_data_dir()?;
    std::fs::create_dir_all(data_dir.join("models"))?;

    tracing::info!("Initialized storage at: {}", data_dir.display());
    Ok(data_dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_dir_retrieval() {
        // No home directory in some sandboxes
        if let Ok(path) = get_data_dir() {
            assert!(path.to_string_lossy().to_lowercase().contains("localchat"));
        }
    }

    #[test]
    fn test_storage_error_messages() {
        let err = StorageError::DataDirError("no home".to_string());
        assert_eq!(err.to_string(), "Failed to access data directory: no home");

        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        assert!(StorageError::from(io).to_string().contains("missing"));
    }
}
