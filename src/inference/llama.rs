//! llama.cpp backend
//!
//! [`InferenceBackend`] implementation over llama-cpp-2. A backend value owns
//! one `LlamaContext` (and with it the KV cache) and one reusable
//! `LlamaBatch` for the duration of a generation; dropping it releases both
//! on every exit path.

use std::num::NonZeroU32;

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::{AddBos, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;

use crate::inference::backend::{InferenceBackend, SamplerPlan, TokenId};
use crate::inference::batch::TokenBatch;
use crate::inference::engine::{EngineError, LoadOptions};

/// Smallest context window created when the model allows it
const MIN_CONTEXT_SIZE: u32 = 512;

/// Recent tokens considered by the repetition penalty
const PENALTY_LAST_N: i32 = 64;

/// Resolves the context window to create for a model.
///
/// The configured size is capped at the model's training context and raised
/// to [`MIN_CONTEXT_SIZE`] where the model supports it.
pub fn effective_context_size(configured: u32, trained: u32) -> u32 {
    let n_ctx = if configured == 0 {
        trained
    } else {
        configured.min(trained)
    };
    n_ctx.max(MIN_CONTEXT_SIZE.min(trained)).max(1)
}

/// llama.cpp context bound to a loaded model
pub struct LlamaCppBackend<'m> {
    model: &'m LlamaModel,
    ctx: LlamaContext<'m>,
    /// Sized to the context window, cleared before every decode
    batch: LlamaBatch,
}

impl<'m> LlamaCppBackend<'m> {
    /// Creates a fresh context for `model`.
    ///
    /// The batch size equals the context size so a prompt that fits the
    /// window is always decoded in one step.
    pub fn new(
        backend: &LlamaBackend,
        model: &'m LlamaModel,
        options: &LoadOptions,
    ) -> Result<Self, EngineError> {
        let n_ctx = effective_context_size(options.context_size, model.n_ctx_train());

        let mut ctx_params = LlamaContextParams::default()
            .with_n_ctx(NonZeroU32::new(n_ctx))
            .with_n_batch(n_ctx);
        if let Some(threads) = options.threads {
            ctx_params = ctx_params
                .with_n_threads(threads as i32)
                .with_n_threads_batch(threads as i32);
        }

        let ctx = model
            .new_context(backend, ctx_params)
            .map_err(|e| EngineError::ContextCreate(e.to_string()))?;

        tracing::debug!("Created llama context with {} tokens", n_ctx);

        Ok(Self {
            model,
            ctx,
            batch: LlamaBatch::new(n_ctx as usize, 1),
        })
    }
}

/// Replaces the contents of `target` with `batch`
fn fill_batch(target: &mut LlamaBatch, batch: &TokenBatch) -> Result<(), EngineError> {
    target.clear();

    for entry in batch.entries() {
        target
            .add(
                LlamaToken::new(entry.token),
                entry.position as i32,
                &[0],
                entry.logits,
            )
            .map_err(|e| EngineError::Decode(format!("Failed to add token to batch: {}", e)))?;
    }

    Ok(())
}

impl InferenceBackend for LlamaCppBackend<'_> {
    type Sampler = LlamaSampler;

    fn context_capacity(&self) -> u32 {
        self.ctx.n_ctx()
    }

    fn clear_decode_memory(&mut self) {
        self.ctx.clear_kv_cache();
    }

    fn tokenize(&self, text: &str) -> Result<Vec<TokenId>, EngineError> {
        let tokens = self
            .model
            .str_to_token(text, AddBos::Always)
            .map_err(|e| EngineError::Tokenization(e.to_string()))?;

        Ok(tokens.into_iter().map(|t| t.0).collect())
    }

    fn build_sampler(&self, plan: &SamplerPlan) -> LlamaSampler {
        match *plan {
            SamplerPlan::Greedy => LlamaSampler::greedy(),
            SamplerPlan::Chain {
                top_k,
                top_p,
                temperature,
                repeat_penalty,
                seed,
            } => {
                let mut stages = Vec::with_capacity(5);
                if (repeat_penalty - 1.0).abs() > f32::EPSILON {
                    stages.push(LlamaSampler::penalties(
                        PENALTY_LAST_N,
                        repeat_penalty,
                        0.0,
                        0.0,
                    ));
                }
                stages.push(LlamaSampler::top_k(top_k));
                stages.push(LlamaSampler::top_p(top_p, 1));
                stages.push(LlamaSampler::temp(temperature));
                stages.push(LlamaSampler::dist(seed));

                LlamaSampler::chain_simple(stages)
            }
        }
    }

    fn decode(&mut self, batch: &TokenBatch) -> Result<(), EngineError> {
        fill_batch(&mut self.batch, batch)?;

        self.ctx
            .decode(&mut self.batch)
            .map_err(|e| EngineError::Decode(e.to_string()))
    }

    fn sample(&mut self, sampler: &mut LlamaSampler, logits_index: i32) -> TokenId {
        let token = sampler.sample(&self.ctx, logits_index);
        sampler.accept(token);
        token.0
    }

    fn token_to_bytes(&self, token: TokenId) -> Result<Vec<u8>, EngineError> {
        self.model
            .token_to_bytes(LlamaToken::new(token), Special::Tokenize)
            .map_err(|e| EngineError::Detokenize(e.to_string()))
    }

    fn is_end_of_generation(&self, token: TokenId) -> bool {
        self.model.is_eog_token(LlamaToken::new(token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_capped_by_training_context() {
        assert_eq!(effective_context_size(8192, 4096), 4096);
        assert_eq!(effective_context_size(2048, 4096), 2048);
    }

    #[test]
    fn test_context_raised_to_minimum() {
        assert_eq!(effective_context_size(64, 4096), MIN_CONTEXT_SIZE);
        assert_eq!(effective_context_size(64, 128), 128);
    }

    #[test]
    fn test_zero_uses_training_context() {
        assert_eq!(effective_context_size(0, 4096), 4096);
    }

    #[test]
    fn test_batch_reused_across_decodes() {
        let mut target = LlamaBatch::new(8, 1);

        fill_batch(&mut target, &TokenBatch::prompt(&[1, 2, 3])).unwrap();
        assert_eq!(target.n_tokens(), 3);

        fill_batch(&mut target, &TokenBatch::continuation(4, 3)).unwrap();
        assert_eq!(target.n_tokens(), 1);
    }

    #[test]
    fn test_batch_overflow_is_a_decode_error() {
        let mut target = LlamaBatch::new(2, 1);
        let result = fill_batch(&mut target, &TokenBatch::prompt(&[1, 2, 3]));

        assert!(matches!(result, Err(EngineError::Decode(_))));
    }
}
