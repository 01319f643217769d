//! Inference engine implementation
//!
//! Owns the llama.cpp backend and model and runs generations on them.
//!
//! # Architecture
//!
//! Since llama-cpp-2 types (`LlamaBackend`, `LlamaModel`, `LlamaContext`) contain
//! raw pointers that are not `Send`, all inference operations run on a dedicated
//! worker thread. The main thread communicates via channels.
//!
//! The worker handles one command at a time, so an engine runs at most one
//! generation. Callers that want concurrent sessions need one engine per
//! session.

use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::LlamaModel;
use thiserror::Error;

use crate::inference::cancel::CancelToken;
use crate::inference::generator::{self, Generation, GenerationRequest};
use crate::inference::llama::LlamaCppBackend;
use crate::inference::model::{validate_model_file, ModelError};
use crate::inference::stop::StopSequences;
use crate::inference::streaming::{consume_in_step, GenerationStream, StreamToken};

/// Errors that can occur during inference operations
#[derive(Debug, Error, Clone)]
pub enum EngineError {
    #[error("Backend not initialized")]
    BackendNotInitialized,

    #[error("No model loaded")]
    NoModelLoaded,

    #[error("Failed to initialize backend: {0}")]
    BackendInit(String),

    #[error("Failed to load model: {0}")]
    ModelLoad(String),

    #[error("Failed to create context: {0}")]
    ContextCreate(String),

    #[error("Model validation failed: {0}")]
    ModelValidation(String),

    #[error("Tokenization failed: {0}")]
    Tokenization(String),

    #[error("Invalid generation request: {0}")]
    InvalidRequest(String),

    #[error("Prompt produced no tokens")]
    EmptyPrompt,

    #[error("Prompt of {prompt_tokens} tokens does not fit a context of {capacity} tokens")]
    PromptTooLong { prompt_tokens: usize, capacity: u32 },

    #[error("Decode failed: {0}")]
    Decode(String),

    #[error("Failed to convert token to text: {0}")]
    Detokenize(String),

    #[error("Worker thread error: {0}")]
    WorkerError(String),
}

impl From<ModelError> for EngineError {
    fn from(e: ModelError) -> Self {
        EngineError::ModelValidation(e.to_string())
    }
}

/// Resource settings used when loading a model
#[derive(Debug, Clone, PartialEq)]
pub struct LoadOptions {
    /// Number of layers to offload to GPU (0 = CPU only, high value = all to GPU)
    pub gpu_layers: u32,
    /// Context window size in tokens (capped at the model's training context)
    pub context_size: u32,
    /// Threads used for decoding (None = llama.cpp default)
    pub threads: Option<u32>,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            gpu_layers: 0,
            context_size: 2048,
            threads: None,
        }
    }
}

/// Model information after loading
#[derive(Debug, Clone)]
pub struct LoadedModelInfo {
    /// Path to the loaded model
    pub path: String,
    /// Vocabulary size
    pub vocab_size: i32,
    /// Embedding dimension
    pub embedding_dim: i32,
    /// Training context length
    pub context_length: u32,
    /// Total parameter count
    pub param_count: u64,
    /// Model size in bytes
    pub size_bytes: u64,
}

/// A model owned by the worker thread together with its load options
struct LoadedModel {
    model: LlamaModel,
    options: LoadOptions,
}

/// Commands sent to the worker thread
enum WorkerCommand {
    Init {
        response_tx: Sender<Result<(), EngineError>>,
    },
    LoadModel {
        path: PathBuf,
        options: LoadOptions,
        response_tx: Sender<Result<LoadedModelInfo, EngineError>>,
    },
    UnloadModel,
    Generate {
        request: GenerationRequest,
        stops: StopSequences,
        cancel: CancelToken,
        response_tx: Sender<Result<Generation, EngineError>>,
    },
    GenerateStream {
        request: GenerationRequest,
        stops: StopSequences,
        cancel: CancelToken,
        token_tx: Sender<StreamToken>,
    },
    /// Streaming where each fragment waits for the caller's verdict
    GenerateInStep {
        request: GenerationRequest,
        stops: StopSequences,
        cancel: CancelToken,
        token_tx: Sender<StreamToken>,
        verdict_rx: Receiver<bool>,
    },
    Shutdown,
}

/// The main LLM inference engine using llama-cpp-2
///
/// Uses a dedicated worker thread for all llama-cpp operations since
/// the underlying types are not Send.
pub struct LlamaEngine {
    /// Channel to send commands to the worker thread
    command_tx: Option<Sender<WorkerCommand>>,
    /// Handle to the worker thread
    worker_handle: Option<JoinHandle<()>>,
    /// Cached model info (updated after load)
    model_info: Option<LoadedModelInfo>,
    /// Whether backend is initialized
    initialized: bool,
    /// Whether a model is loaded
    model_loaded: bool,
    /// Delimiters that end every generation of this engine
    stop_sequences: StopSequences,
    /// Cancel token of the most recent generation
    active_cancel: Mutex<CancelToken>,
}

impl LlamaEngine {
    /// Creates a new uninitialized engine
    pub fn new() -> Self {
        Self {
            command_tx: None,
            worker_handle: None,
            model_info: None,
            initialized: false,
            model_loaded: false,
            stop_sequences: StopSequences::default(),
            active_cancel: Mutex::new(CancelToken::new()),
        }
    }

    /// Replaces the stop sequences applied to generations
    pub fn with_stop_sequences(mut self, stops: StopSequences) -> Self {
        self.stop_sequences = stops;
        self
    }

    pub fn stop_sequences(&self) -> &StopSequences {
        &self.stop_sequences
    }

    /// Initializes the llama.cpp backend
    ///
    /// Must be called before loading models or running inference.
    /// Spawns a dedicated worker thread for all llama-cpp operations.
    /// llama.cpp allows a single backend per process.
    pub fn init(&mut self) -> Result<(), EngineError> {
        if self.initialized {
            return Ok(());
        }

        let (command_tx, command_rx) = mpsc::channel::<WorkerCommand>();

        // Spawn worker thread that owns the backend and model
        let handle = thread::spawn(move || {
            worker_thread_main(command_rx);
        });

        self.command_tx = Some(command_tx.clone());
        self.worker_handle = Some(handle);

        let (response_tx, response_rx) = mpsc::channel();
        command_tx
            .send(WorkerCommand::Init { response_tx })
            .map_err(|e| EngineError::WorkerError(e.to_string()))?;
        response_rx
            .recv()
            .map_err(|e| EngineError::WorkerError(e.to_string()))??;

        self.initialized = true;
        tracing::info!("LlamaEngine worker thread started");
        Ok(())
    }

    /// Loads a GGUF model from the specified path
    ///
    /// # Arguments
    /// * `path` - Path to the GGUF model file
    /// * `options` - GPU offload, context size and thread settings
    ///
    /// # Returns
    /// * `Ok(LoadedModelInfo)` - Information about the loaded model
    /// * `Err(EngineError)` - If model loading fails
    pub fn load_model<P: AsRef<Path>>(
        &mut self,
        path: P,
        options: LoadOptions,
    ) -> Result<LoadedModelInfo, EngineError> {
        let command_tx = self
            .command_tx
            .as_ref()
            .ok_or(EngineError::BackendNotInitialized)?;

        let path = path.as_ref();

        // Validate GGUF file first (on main thread, just file I/O)
        let _metadata = validate_model_file(path)?;
        tracing::debug!("GGUF validation passed for {:?}", path);

        let (response_tx, response_rx) = mpsc::channel();
        command_tx
            .send(WorkerCommand::LoadModel {
                path: path.to_path_buf(),
                options,
                response_tx,
            })
            .map_err(|e| EngineError::WorkerError(e.to_string()))?;

        let result = response_rx
            .recv()
            .map_err(|e| EngineError::WorkerError(e.to_string()))??;

        self.model_info = Some(result.clone());
        self.model_loaded = true;

        Ok(result)
    }

    /// Unloads the current model and frees VRAM
    pub fn unload_model(&mut self) {
        if let Some(tx) = &self.command_tx {
            let _ = tx.send(WorkerCommand::UnloadModel);
        }
        self.model_info = None;
        self.model_loaded = false;
        tracing::info!("Model unload requested");
    }

    /// Returns information about the currently loaded model
    pub fn model_info(&self) -> Option<&LoadedModelInfo> {
        self.model_info.as_ref()
    }

    /// Returns true if a model is currently loaded
    pub fn is_model_loaded(&self) -> bool {
        self.model_loaded
    }

    /// Returns true if the backend is initialized
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Generates a complete response, blocking until it is finished
    pub fn generate(&self, request: GenerationRequest) -> Result<Generation, EngineError> {
        let command_tx = self.ready()?;
        let cancel = self.begin_generation();

        let (response_tx, response_rx) = mpsc::channel();
        command_tx
            .send(WorkerCommand::Generate {
                request,
                stops: self.stop_sequences.clone(),
                cancel,
                response_tx,
            })
            .map_err(|e| EngineError::WorkerError(e.to_string()))?;

        response_rx
            .recv()
            .map_err(|e| EngineError::WorkerError(e.to_string()))?
    }

    /// Generates text with streaming output
    ///
    /// # Returns
    /// * `Ok(GenerationStream)` - Iterator over fragments, ending with `Done` or `Error`
    /// * `Err(EngineError)` - If generation setup fails
    pub fn generate_stream(&self, request: GenerationRequest) -> Result<GenerationStream, EngineError> {
        let command_tx = self.ready()?;
        let cancel = self.begin_generation();

        let (token_tx, token_rx) = mpsc::channel();
        command_tx
            .send(WorkerCommand::GenerateStream {
                request,
                stops: self.stop_sequences.clone(),
                cancel: cancel.clone(),
                token_tx,
            })
            .map_err(|e| EngineError::WorkerError(e.to_string()))?;

        Ok(GenerationStream::new(token_rx, cancel))
    }

    /// Generates text, calling `consumer` with each fragment
    ///
    /// `consumer` runs on the calling thread, and the worker waits for its
    /// answer before sampling the next token. Returning `false` ends the
    /// generation without another decode; the result then holds exactly the
    /// text delivered so far.
    pub fn generate_streaming<F>(
        &self,
        request: GenerationRequest,
        consumer: F,
    ) -> Result<Generation, EngineError>
    where
        F: FnMut(&str) -> bool,
    {
        let command_tx = self.ready()?;
        let cancel = self.begin_generation();

        let (token_tx, token_rx) = mpsc::channel();
        let (verdict_tx, verdict_rx) = mpsc::channel();
        command_tx
            .send(WorkerCommand::GenerateInStep {
                request,
                stops: self.stop_sequences.clone(),
                cancel,
                token_tx,
                verdict_rx,
            })
            .map_err(|e| EngineError::WorkerError(e.to_string()))?;

        consume_in_step(token_rx, verdict_tx, consumer)
    }

    /// Stops the generation currently in flight, if any
    ///
    /// Takes effect before the next sampled token. Later generations are
    /// unaffected.
    pub fn request_stop(&self) {
        self.active_cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();
        tracing::info!("Generation stop requested");
    }

    fn ready(&self) -> Result<&Sender<WorkerCommand>, EngineError> {
        let command_tx = self
            .command_tx
            .as_ref()
            .ok_or(EngineError::BackendNotInitialized)?;

        if !self.model_loaded {
            return Err(EngineError::NoModelLoaded);
        }

        Ok(command_tx)
    }

    /// Issues a fresh cancel token so an earlier stop request cannot leak
    fn begin_generation(&self) -> CancelToken {
        let cancel = CancelToken::new();
        *self
            .active_cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = cancel.clone();
        cancel
    }
}

impl Default for LlamaEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LlamaEngine {
    fn drop(&mut self) {
        // Stop a running generation so the worker reaches the shutdown command
        self.active_cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();
        if let Some(tx) = self.command_tx.take() {
            let _ = tx.send(WorkerCommand::Shutdown);
        }
        // Wait for worker thread to finish
        if let Some(handle) = self.worker_handle.take() {
            let _ = handle.join();
        }
    }
}

/// Worker thread main loop
///
/// Owns the LlamaBackend and LlamaModel, processes commands from main thread.
fn worker_thread_main(command_rx: Receiver<WorkerCommand>) {
    let mut backend: Option<LlamaBackend> = None;
    let mut loaded: Option<LoadedModel> = None;

    loop {
        match command_rx.recv() {
            Ok(WorkerCommand::Init { response_tx }) => {
                let result = match LlamaBackend::init() {
                    Ok(b) => {
                        backend = Some(b);
                        tracing::info!("LlamaBackend initialized in worker thread");
                        Ok(())
                    }
                    Err(e) => {
                        tracing::error!("Failed to init backend: {}", e);
                        Err(EngineError::BackendInit(e.to_string()))
                    }
                };
                let _ = response_tx.send(result);
            }
            Ok(WorkerCommand::LoadModel {
                path,
                options,
                response_tx,
            }) => {
                // Release the previous model before loading the next one
                loaded = None;
                let result = load_model_internal(&backend, &path, &options).map(|(model, info)| {
                    loaded = Some(LoadedModel { model, options });
                    info
                });
                let _ = response_tx.send(result);
            }
            Ok(WorkerCommand::UnloadModel) => {
                loaded = None;
                tracing::info!("Model unloaded in worker thread");
            }
            Ok(WorkerCommand::Generate {
                request,
                stops,
                cancel,
                response_tx,
            }) => {
                let result = with_llama_backend(&backend, &loaded, |llama| {
                    generator::generate(llama, &request, &stops, &cancel)
                });
                let _ = response_tx.send(result);
            }
            Ok(WorkerCommand::GenerateStream {
                request,
                stops,
                cancel,
                token_tx,
            }) => {
                let result = with_llama_backend(&backend, &loaded, |llama| {
                    generator::stream_to_channel(llama, &request, &stops, &cancel, &token_tx);
                    Ok(())
                });
                if let Err(e) = result {
                    let _ = token_tx.send(StreamToken::Error(e));
                }
            }
            Ok(WorkerCommand::GenerateInStep {
                request,
                stops,
                cancel,
                token_tx,
                verdict_rx,
            }) => {
                let result = with_llama_backend(&backend, &loaded, |llama| {
                    generator::stream_in_step(
                        llama,
                        &request,
                        &stops,
                        &cancel,
                        &token_tx,
                        &verdict_rx,
                    );
                    Ok(())
                });
                if let Err(e) = result {
                    let _ = token_tx.send(StreamToken::Error(e));
                }
            }
            Ok(WorkerCommand::Shutdown) => {
                tracing::info!("Worker thread shutting down");
                break;
            }
            Err(_) => {
                // Channel closed, exit
                tracing::debug!("Command channel closed, worker exiting");
                break;
            }
        }
    }
}

/// Creates a context for the loaded model and runs `f` on it
fn with_llama_backend<T>(
    backend: &Option<LlamaBackend>,
    loaded: &Option<LoadedModel>,
    f: impl FnOnce(&mut LlamaCppBackend<'_>) -> Result<T, EngineError>,
) -> Result<T, EngineError> {
    let backend = backend.as_ref().ok_or(EngineError::BackendNotInitialized)?;
    let loaded = loaded.as_ref().ok_or(EngineError::NoModelLoaded)?;

    let mut llama = LlamaCppBackend::new(backend, &loaded.model, &loaded.options)?;
    f(&mut llama)
}

/// Load model and extract info (helper for worker thread)
fn load_model_internal(
    backend: &Option<LlamaBackend>,
    path: &Path,
    options: &LoadOptions,
) -> Result<(LlamaModel, LoadedModelInfo), EngineError> {
    let backend = backend.as_ref().ok_or(EngineError::BackendNotInitialized)?;

    let model_params = LlamaModelParams::default().with_n_gpu_layers(options.gpu_layers);

    let model = LlamaModel::load_from_file(backend, path, &model_params)
        .map_err(|e| EngineError::ModelLoad(e.to_string()))?;

    let info = LoadedModelInfo {
        path: path.to_string_lossy().to_string(),
        vocab_size: model.n_vocab(),
        embedding_dim: model.n_embd(),
        context_length: model.n_ctx_train(),
        param_count: model.n_params() as u64,
        size_bytes: model.size() as u64,
    };

    tracing::info!(
        "Model loaded: {} ({} params, {} vocab, {} ctx)",
        info.path,
        info.param_count,
        info.vocab_size,
        info.context_length
    );

    Ok((model, info))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_new() {
        let engine = LlamaEngine::new();
        assert!(!engine.is_initialized());
        assert!(!engine.is_model_loaded());
        assert!(engine.model_info().is_none());
    }

    #[test]
    fn test_load_options_default() {
        let options = LoadOptions::default();
        assert_eq!(options.gpu_layers, 0);
        assert_eq!(options.context_size, 2048);
        assert!(options.threads.is_none());
    }

    #[test]
    fn test_unload_without_model() {
        let mut engine = LlamaEngine::new();
        // Should not panic
        engine.unload_model();
        assert!(!engine.is_model_loaded());
    }

    #[test]
    fn test_generate_requires_backend() {
        let engine = LlamaEngine::new();
        let result = engine.generate(GenerationRequest::new("hello"));
        assert!(matches!(result, Err(EngineError::BackendNotInitialized)));

        let stream = engine.generate_stream(GenerationRequest::new("hello"));
        assert!(matches!(stream, Err(EngineError::BackendNotInitialized)));

        let streamed = engine.generate_streaming(GenerationRequest::new("hello"), |_| true);
        assert!(matches!(streamed, Err(EngineError::BackendNotInitialized)));
    }

    #[test]
    fn test_load_requires_backend() {
        let mut engine = LlamaEngine::new();
        let result = engine.load_model("/nonexistent/model.gguf", LoadOptions::default());
        assert!(matches!(result, Err(EngineError::BackendNotInitialized)));
    }

    #[test]
    fn test_request_stop_does_not_leak_into_next_generation() {
        let engine = LlamaEngine::new();
        engine.request_stop();

        let cancel = engine.begin_generation();
        assert!(!cancel.is_cancelled());

        engine.request_stop();
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn test_custom_stop_sequences() {
        let engine = LlamaEngine::new().with_stop_sequences(StopSequences::new(["END"]));
        assert_eq!(engine.stop_sequences().trim("doneEND more"), "done");
    }

    #[test]
    fn test_model_error_conversion() {
        let error: EngineError = ModelError::FileTooSmall.into();
        assert!(matches!(error, EngineError::ModelValidation(_)));
    }
}
