//! Chat history storage
//!
//! Keeps every chat message in a single JSON file, oldest first.

use crate::storage::{get_data_dir, StorageError};
use crate::types::message::{Message, Role};
use std::fs;
use std::path::{Path, PathBuf};

const HISTORY_FILE: &str = "history.json";

/// Message log backed by `{dir}/history.json`
#[derive(Debug, Clone)]
pub struct ChatHistory {
    path: PathBuf,
}

impl ChatHistory {
    /// Opens the history stored in `dir`; the file is created on first write
    pub fn open(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(HISTORY_FILE),
        }
    }

    /// Opens the history in the application data directory
    pub fn open_default() -> Result<Self, StorageError> {
        Ok(Self::open(get_data_dir()?))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends a message to the log
    pub fn store_message(&self, message: &Message) -> Result<(), StorageError> {
        let mut messages = self.retrieve_all()?;
        messages.push(message.clone());
        self.write(&messages)?;
        tracing::debug!("Stored {} message {}", message.role.as_str(), message.id);
        Ok(())
    }

    /// Convenience for storing a user message followed by its reply
    pub fn store_exchange(&self, user: &str, assistant: &str) -> Result<(), StorageError> {
        let mut messages = self.retrieve_all()?;
        messages.push(Message::new(Role::User, user));
        messages.push(Message::new(Role::Assistant, assistant));
        self.write(&messages)
    }

    /// All stored messages, oldest first
    pub fn retrieve_all(&self) -> Result<Vec<Message>, StorageError> {
        if !self.path.exists() {
            return Ok(vec![]);
        }

        let json = fs::read_to_string(&self.path)?;
        let mut messages: Vec<Message> = serde_json::from_str(&json)?;
        messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(messages)
    }

    pub fn clear(&self) -> Result<(), StorageError> {
        if self.path.exists() {
            fs::remove_file(&self.path)?;
            tracing::info!("Cleared chat history");
        }
        Ok(())
    }

    pub fn has_messages(&self) -> Result<bool, StorageError> {
        Ok(self.message_count()? > 0)
    }

    pub fn message_count(&self) -> Result<usize, StorageError> {
        Ok(self.retrieve_all()?.len())
    }

    fn write(&self, messages: &[Message]) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(messages)?;
        fs::write(&self.path, json)?;
        Ok(())
    }
}
