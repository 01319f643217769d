//! Model file checks
//!
//! Detects model formats from file names and validates GGUF headers before a
//! file is handed to llama.cpp.

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use thiserror::Error;

/// GGUF magic bytes (little-endian: "GGUF")
pub const GGUF_MAGIC: u32 = 0x46554747;

/// magic(4) + version(4) + tensor_count(8) + metadata_kv_count(8)
const GGUF_HEADER_LEN: usize = 24;

/// Errors that can occur during model operations
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Failed to open file: {0}")]
    FileOpen(#[from] std::io::Error),

    #[error("Invalid GGUF file: magic bytes mismatch (expected 0x{:08X}, got 0x{:08X})", GGUF_MAGIC, .0)]
    InvalidMagic(u32),

    #[error("Unsupported GGUF version: {0}")]
    UnsupportedVersion(u32),

    #[error("File too small to be valid GGUF")]
    FileTooSmall,

    #[error("Unsupported model format: {0}")]
    UnsupportedFormat(String),
}

/// Model file formats recognised by extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFormat {
    /// llama.cpp formats, loadable by this engine
    Gguf,
    /// ExecuTorch program
    Pte,
    /// TensorFlow Lite
    TfLite,
    /// ONNX Runtime
    Onnx,
    Unknown,
}

impl ModelFormat {
    /// Detects the format from a file name's extension (case-insensitive)
    pub fn from_path<P: AsRef<Path>>(path: P) -> Self {
        let extension = path
            .as_ref()
            .extension()
            .map(|ext| ext.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        match extension.as_str() {
            "gguf" | "ggml" | "bin" => ModelFormat::Gguf,
            "pte" => ModelFormat::Pte,
            "tflite" => ModelFormat::TfLite,
            "onnx" => ModelFormat::Onnx,
            _ => ModelFormat::Unknown,
        }
    }

    /// Whether llama.cpp can load this format
    pub fn is_supported(self) -> bool {
        self == ModelFormat::Gguf
    }

    pub fn display_name(self) -> &'static str {
        match self {
            ModelFormat::Gguf => "GGUF (llama.cpp)",
            ModelFormat::Pte => "PTE (ExecuTorch)",
            ModelFormat::TfLite => "TFLite",
            ModelFormat::Onnx => "ONNX Runtime",
            ModelFormat::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for ModelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Metadata extracted from a GGUF file header
#[derive(Debug, Clone)]
pub struct GgufMetadata {
    /// GGUF format version
    pub version: u32,
    /// Number of tensors in the model
    pub tensor_count: u64,
    /// Number of metadata key-value pairs
    pub metadata_kv_count: u64,
}

/// Validates that a file is a valid GGUF format and extracts basic metadata.
///
/// # Arguments
/// * `path` - Path to the GGUF file
///
/// # Returns
/// * `Ok(GgufMetadata)` - Metadata extracted from valid GGUF file
/// * `Err(ModelError)` - If the file is not a valid GGUF file
pub fn validate_gguf<P: AsRef<Path>>(path: P) -> Result<GgufMetadata, ModelError> {
    let mut file = File::open(path)?;

    let mut header = [0u8; GGUF_HEADER_LEN];
    if let Err(e) = file.read_exact(&mut header) {
        return Err(match e.kind() {
            io::ErrorKind::UnexpectedEof => ModelError::FileTooSmall,
            _ => ModelError::FileOpen(e),
        });
    }

    let magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    if magic != GGUF_MAGIC {
        return Err(ModelError::InvalidMagic(magic));
    }

    // GGUF v2 and v3 are supported
    let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if !(2..=3).contains(&version) {
        return Err(ModelError::UnsupportedVersion(version));
    }

    let mut tensor_count = [0u8; 8];
    tensor_count.copy_from_slice(&header[8..16]);
    let mut metadata_kv_count = [0u8; 8];
    metadata_kv_count.copy_from_slice(&header[16..24]);

    Ok(GgufMetadata {
        version,
        tensor_count: u64::from_le_bytes(tensor_count),
        metadata_kv_count: u64::from_le_bytes(metadata_kv_count),
    })
}

/// Checks that a file has a loadable extension and a valid GGUF header
pub fn validate_model_file<P: AsRef<Path>>(path: P) -> Result<GgufMetadata, ModelError> {
    let path = path.as_ref();
    let format = ModelFormat::from_path(path);
    if !format.is_supported() {
        return Err(ModelError::UnsupportedFormat(format.to_string()));
    }
    validate_gguf(path)
}

/// Checks if a file appears to be a GGUF model file based on extension and magic bytes.
pub fn is_gguf_file<P: AsRef<Path>>(path: P) -> bool {
    validate_model_file(path).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_header(file: &mut NamedTempFile, magic: u32, version: u32) {
        file.write_all(&magic.to_le_bytes()).unwrap();
        file.write_all(&version.to_le_bytes()).unwrap();
        file.write_all(&10u64.to_le_bytes()).unwrap(); // tensor_count
        file.write_all(&5u64.to_le_bytes()).unwrap(); // metadata_kv_count
        file.flush().unwrap();
    }

    fn create_test_gguf(suffix: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        write_header(&mut file, GGUF_MAGIC, 3);
        file
    }

    #[test]
    fn test_validate_gguf_valid() {
        let file = create_test_gguf(".gguf");
        let metadata = validate_gguf(file.path()).unwrap();

        assert_eq!(metadata.version, 3);
        assert_eq!(metadata.tensor_count, 10);
        assert_eq!(metadata.metadata_kv_count, 5);
    }

    #[test]
    fn test_validate_gguf_invalid_magic() {
        let mut file = tempfile::Builder::new().suffix(".gguf").tempfile().unwrap();
        write_header(&mut file, 0xDEADBEEF, 3);

        let result = validate_gguf(file.path());
        assert!(matches!(result, Err(ModelError::InvalidMagic(0xDEADBEEF))));
    }

    #[test]
    fn test_validate_gguf_unsupported_version() {
        let mut file = tempfile::Builder::new().suffix(".gguf").tempfile().unwrap();
        write_header(&mut file, GGUF_MAGIC, 1);

        let result = validate_gguf(file.path());
        assert!(matches!(result, Err(ModelError::UnsupportedVersion(1))));
    }

    #[test]
    fn test_validate_gguf_file_too_small() {
        let mut file = tempfile::Builder::new().suffix(".gguf").tempfile().unwrap();
        file.write_all(&GGUF_MAGIC.to_le_bytes()).unwrap();
        file.flush().unwrap();

        let result = validate_gguf(file.path());
        assert!(matches!(result, Err(ModelError::FileTooSmall)));
    }

    #[test]
    fn test_format_from_extension() {
        assert_eq!(ModelFormat::from_path("phi-2.Q4_K_M.gguf"), ModelFormat::Gguf);
        assert_eq!(ModelFormat::from_path("MODEL.GGUF"), ModelFormat::Gguf);
        assert_eq!(ModelFormat::from_path("old.ggml"), ModelFormat::Gguf);
        assert_eq!(ModelFormat::from_path("llama.pte"), ModelFormat::Pte);
        assert_eq!(ModelFormat::from_path("model.onnx"), ModelFormat::Onnx);
        assert_eq!(ModelFormat::from_path("notes.txt"), ModelFormat::Unknown);
        assert_eq!(ModelFormat::from_path("no_extension"), ModelFormat::Unknown);
    }

    #[test]
    fn test_only_gguf_is_supported() {
        assert!(ModelFormat::Gguf.is_supported());
        assert!(!ModelFormat::Pte.is_supported());
        assert!(!ModelFormat::Unknown.is_supported());
    }

    #[test]
    fn test_is_gguf_file() {
        let file = create_test_gguf(".gguf");
        assert!(is_gguf_file(file.path()));
    }

    #[test]
    fn test_is_gguf_file_wrong_extension() {
        let file = create_test_gguf(".txt");
        assert!(!is_gguf_file(file.path()));
        assert!(matches!(
            validate_model_file(file.path()),
            Err(ModelError::UnsupportedFormat(_))
        ));
    }
}
