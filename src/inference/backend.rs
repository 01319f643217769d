//! Inference backend contract
//!
//! The generation loop only needs a handful of engine operations. They are
//! collected in [`InferenceBackend`] so the loop can run against llama.cpp or
//! against a scripted backend in tests.

use crate::inference::batch::TokenBatch;
use crate::inference::engine::EngineError;
use crate::inference::generator::GenerationRequest;

/// Token id as used by llama.cpp
pub type TokenId = i32;

/// Temperatures below this are treated as greedy decoding
pub const GREEDY_TEMPERATURE: f32 = 0.01;

/// How the backend should build its sampler for one generation
#[derive(Debug, Clone, PartialEq)]
pub enum SamplerPlan {
    /// Always pick the most likely token
    Greedy,
    /// Penalties, then top-k, top-p and temperature, then a seeded draw
    Chain {
        top_k: i32,
        top_p: f32,
        temperature: f32,
        repeat_penalty: f32,
        seed: u32,
    },
}

impl SamplerPlan {
    pub fn from_request(request: &GenerationRequest) -> Self {
        if request.temperature < GREEDY_TEMPERATURE {
            return SamplerPlan::Greedy;
        }

        let seed = if request.seed == 0 {
            rand_seed()
        } else {
            request.seed
        };

        SamplerPlan::Chain {
            top_k: request.top_k as i32,
            top_p: request.top_p,
            temperature: request.temperature,
            repeat_penalty: request.repeat_penalty,
            seed,
        }
    }
}

/// Engine operations consumed by the generation loop.
///
/// One backend value serves one generation at a time; the loop takes it by
/// `&mut` for the whole call.
pub trait InferenceBackend {
    /// Sampler state built fresh for every generation
    type Sampler;

    /// Maximum number of tokens (prompt plus generated) the context can hold
    fn context_capacity(&self) -> u32;

    /// Drops any cached decode state from a previous generation
    fn clear_decode_memory(&mut self);

    /// Tokenizes `text`, adding the model's boundary tokens
    fn tokenize(&self, text: &str) -> Result<Vec<TokenId>, EngineError>;

    fn build_sampler(&self, plan: &SamplerPlan) -> Self::Sampler;

    /// Runs one forward pass over `batch`
    fn decode(&mut self, batch: &TokenBatch) -> Result<(), EngineError>;

    /// Samples the next token from the logits at `logits_index` of the last batch
    fn sample(&mut self, sampler: &mut Self::Sampler, logits_index: i32) -> TokenId;

    /// Raw bytes of a token's text piece, possibly a partial UTF-8 sequence
    fn token_to_bytes(&self, token: TokenId) -> Result<Vec<u8>, EngineError>;

    fn is_end_of_generation(&self, token: TokenId) -> bool;
}

/// Generates a random seed using system entropy
fn rand_seed() -> u32 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    RandomState::new().build_hasher().finish() as u32
}
