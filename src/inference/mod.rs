//! LLM inference engine
//!
//! The generation loop and its helpers are backend-agnostic; `llama` and
//! `engine` bind them to llama-cpp.

pub mod backend;
pub mod batch;
pub mod cancel;
pub mod context;
pub mod engine;
pub mod generator;
pub mod llama;
pub mod model;
pub mod stop;
pub mod streaming;
pub mod utf8;

// Re-export main types for convenience
pub use backend::{InferenceBackend, SamplerPlan, TokenId};
pub use cancel::CancelToken;
pub use engine::{EngineError, LlamaEngine, LoadOptions, LoadedModelInfo};
pub use generator::{FinishReason, Generation, GenerationRequest};
pub use model::{validate_gguf, GgufMetadata, ModelError, ModelFormat, GGUF_MAGIC};
pub use stop::{StopSequences, DEFAULT_STOP_SEQUENCES};
pub use streaming::{GenerationStream, StreamToken};
