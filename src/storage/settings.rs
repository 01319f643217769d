//! Settings storage
//!
//! Inference parameters and model selection, persisted as JSON.

use crate::chat::{DEFAULT_MAX_HISTORY_TURNS, DEFAULT_SYSTEM_PROMPT};
use crate::inference::{GenerationRequest, LoadOptions};
use crate::storage::{get_data_dir, StorageError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

const DEFAULT_CONTEXT_SIZE: u32 = 512;
const DEFAULT_MAX_TOKENS: u32 = 256;
const DEFAULT_TOP_K: u32 = 40;

/// Speed/quality trade-offs for context size, reply length and temperature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Preset {
    Fast,
    Balanced,
    Quality,
}

impl Preset {
    /// `(context_size, max_tokens, temperature)`
    pub fn values(self) -> (u32, u32, f32) {
        match self {
            Preset::Fast => (256, 128, 0.5),
            Preset::Balanced => (512, 256, 0.7),
            Preset::Quality => (1024, 512, 0.8),
        }
    }
}

impl FromStr for Preset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fast" => Ok(Preset::Fast),
            "balanced" => Ok(Preset::Balanced),
            "quality" => Ok(Preset::Quality),
            other => Err(format!("unknown preset '{}' (fast, balanced, quality)", other)),
        }
    }
}

impl fmt::Display for Preset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Preset::Fast => "fast",
            Preset::Balanced => "balanced",
            Preset::Quality => "quality",
        };
        f.write_str(name)
    }
}

/// Inference settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceSettings {
    /// Context window size in tokens (0 = model's trained size)
    pub context_size: u32,
    /// Maximum number of tokens to generate
    pub max_tokens: u32,
    /// Temperature parameter for text generation (0.0 - 2.0)
    pub temperature: f32,
    /// Top-k sampling parameter
    pub top_k: u32,
    /// Top-p (nucleus sampling) parameter (0.0 - 1.0)
    pub top_p: f32,
    /// Repetition penalty (1.0 = disabled)
    pub repeat_penalty: f32,
    /// Sampling seed (0 = random)
    pub seed: u32,
    /// Number of GPU layers to offload (0 = CPU only)
    pub gpu_layers: u32,
    /// Worker threads for decoding (None = llama.cpp default)
    pub threads: Option<u32>,
    /// System prompt for chat turns
    pub system_prompt: String,
    /// Past exchanges kept in the chat prompt
    pub max_history_turns: usize,
    /// Collapse whitespace runs in chat replies
    pub collapse_whitespace: bool,
    /// Model loaded when none is given on the command line
    pub model_path: Option<PathBuf>,
    /// Directory where model files are stored
    pub models_directory: PathBuf,
}

impl Default for InferenceSettings {
    fn default() -> Self {
        Self {
            context_size: DEFAULT_CONTEXT_SIZE,
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: 0.7,
            top_k: DEFAULT_TOP_K,
            top_p: 0.9,
            repeat_penalty: 1.1,
            seed: 0,
            gpu_layers: 0,
            threads: None,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            max_history_turns: DEFAULT_MAX_HISTORY_TURNS,
            collapse_whitespace: false,
            model_path: None,
            models_directory: get_data_dir()
                .ok()
                .map(|d| d.join("models"))
                .unwrap_or_else(|| PathBuf::from("./models")),
        }
    }
}

impl InferenceSettings {
    /// Validate settings values
    ///
    /// Ensures all parameters are within acceptable ranges
    pub fn validate(&mut self) {
        self.temperature = self.temperature.clamp(0.0, 2.0);
        self.top_p = self.top_p.clamp(0.0, 1.0);

        if self.top_k == 0 {
            self.top_k = DEFAULT_TOP_K;
        }

        if self.max_tokens == 0 {
            self.max_tokens = DEFAULT_MAX_TOKENS;
        }

        if !(self.repeat_penalty > 0.0) {
            self.repeat_penalty = 1.0;
        }

        if self.threads == Some(0) {
            self.threads = None;
        }
    }

    pub fn apply_preset(&mut self, preset: Preset) {
        let (context_size, max_tokens, temperature) = preset.values();
        self.context_size = context_size;
        self.max_tokens = max_tokens;
        self.temperature = temperature;
        tracing::debug!("Applied {} preset", preset);
    }

    /// Generation parameters for `prompt`
    pub fn to_request(&self, prompt: impl Into<String>) -> GenerationRequest {
        GenerationRequest {
            prompt: prompt.into(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            top_k: self.top_k,
            top_p: self.top_p,
            repeat_penalty: self.repeat_penalty,
            seed: self.seed,
        }
    }

    pub fn load_options(&self) -> LoadOptions {
        LoadOptions {
            gpu_layers: self.gpu_layers,
            context_size: self.context_size,
            threads: self.threads,
        }
    }
}

/// Get the settings file path
pub fn get_settings_path() -> Result<PathBuf, StorageError> {
    Ok(get_data_dir()?.join("settings.json"))
}

/// Load settings from disk
///
/// Returns default settings if the file doesn't exist or is corrupted
pub fn load_settings() -> InferenceSettings {
    match get_settings_path() {
        Ok(path) => load_settings_from(&path),
        Err(e) => {
            tracing::warn!("Failed to locate settings, using defaults: {}", e);
            InferenceSettings::default()
        }
    }
}

/// Like [`load_settings`], reading from `path`
pub fn load_settings_from(path: &Path) -> InferenceSettings {
    match read_settings(path) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!("Failed to load settings, using defaults: {}", e);
            InferenceSettings::default()
        }
    }
}

fn read_settings(path: &Path) -> Result<InferenceSettings, StorageError> {
    if !path.exists() {
        tracing::info!("Settings file not found, using defaults");
        return Ok(InferenceSettings::default());
    }

    let json = fs::read_to_string(path)?;
    let mut settings: InferenceSettings = serde_json::from_str(&json)?;
    settings.validate();

    tracing::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

/// Save settings to disk
pub fn save_settings(settings: &InferenceSettings) -> Result<(), StorageError> {
    save_settings_to(&get_settings_path()?, settings)
}

pub fn save_settings_to(path: &Path, settings: &InferenceSettings) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(settings)?;
    fs::write(path, json)?;

    tracing::debug!("Saved settings to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_settings() {
        let settings = InferenceSettings::default();
        assert_eq!(settings.context_size, 512);
        assert_eq!(settings.max_tokens, 256);
        assert_eq!(settings.temperature, 0.7);
        assert_eq!(settings.top_k, 40);
        assert_eq!(settings.top_p, 0.9);
        assert_eq!(settings.max_history_turns, 1);
    }

    #[test]
    fn test_settings_validation() {
        let mut settings = InferenceSettings::default();

        settings.temperature = 5.0;
        settings.validate();
        assert_eq!(settings.temperature, 2.0);

        settings.temperature = -1.0;
        settings.validate();
        assert_eq!(settings.temperature, 0.0);

        settings.top_p = 2.0;
        settings.top_k = 0;
        settings.max_tokens = 0;
        settings.repeat_penalty = f32::NAN;
        settings.threads = Some(0);
        settings.validate();
        assert_eq!(settings.top_p, 1.0);
        assert_eq!(settings.top_k, 40);
        assert_eq!(settings.max_tokens, 256);
        assert_eq!(settings.repeat_penalty, 1.0);
        assert_eq!(settings.threads, None);
    }

    #[test]
    fn test_presets() {
        let mut settings = InferenceSettings::default();

        settings.apply_preset(Preset::Fast);
        assert_eq!(
            (settings.context_size, settings.max_tokens, settings.temperature),
            (256, 128, 0.5)
        );

        settings.apply_preset(Preset::Quality);
        assert_eq!(
            (settings.context_size, settings.max_tokens, settings.temperature),
            (1024, 512, 0.8)
        );
    }

    #[test]
    fn test_preset_parsing() {
        assert_eq!("fast".parse::<Preset>(), Ok(Preset::Fast));
        assert_eq!("Balanced".parse::<Preset>(), Ok(Preset::Balanced));
        assert!("turbo".parse::<Preset>().is_err());
    }

    #[test]
    fn test_to_request_and_load_options() {
        let mut settings = InferenceSettings::default();
        settings.seed = 42;
        settings.gpu_layers = 20;
        settings.threads = Some(4);

        let request = settings.to_request("Hello");
        assert_eq!(request.prompt, "Hello");
        assert_eq!(request.max_tokens, 256);
        assert_eq!(request.seed, 42);

        let options = settings.load_options();
        assert_eq!(options.gpu_layers, 20);
        assert_eq!(options.context_size, 512);
        assert_eq!(options.threads, Some(4));
    }

    #[test]
    fn test_settings_persistence() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let mut settings = InferenceSettings::default();
        settings.temperature = 1.2;
        settings.model_path = Some(PathBuf::from("/models/phi.gguf"));
        save_settings_to(&path, &settings).unwrap();

        let loaded = load_settings_from(&path);
        assert_eq!(loaded.temperature, 1.2);
        assert_eq!(loaded.model_path, settings.model_path);
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{"max_tokens": 64}"#).unwrap();

        let loaded = load_settings_from(&path);
        assert_eq!(loaded.max_tokens, 64);
        assert_eq!(loaded.top_k, 40);
    }

    #[test]
    fn test_corrupt_file_falls_back_to_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "not json").unwrap();

        let loaded = load_settings_from(&path);
        assert_eq!(loaded.max_tokens, 256);
    }
}
