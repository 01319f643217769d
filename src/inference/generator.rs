//! Generation loop
//!
//! Drives one generation from prompt to final text:
//!
//! 1. **Init** - clear decode memory, tokenize, plan the token budget
//! 2. **Prompt ingest** - decode the whole prompt in one batch
//! 3. **Sampling** - draw one token per iteration, checking cancellation first
//! 4. **Emit or buffer** - assemble UTF-8, scan for stop sequences, deliver
//! 5. **Continue** - decode the sampled token at the next position
//! 6. **Stop** - flush, trim once more and report
//!
//! Batch and streaming mode share the loop; streaming additionally hands each
//! completed fragment to a consumer that can end the generation early.

use std::fmt;
use std::sync::mpsc::{Receiver, Sender};

use crate::inference::backend::{InferenceBackend, SamplerPlan};
use crate::inference::batch::TokenBatch;
use crate::inference::cancel::CancelToken;
use crate::inference::context::plan_budget;
use crate::inference::engine::EngineError;
use crate::inference::stop::StopSequences;
use crate::inference::streaming::StreamToken;
use crate::inference::utf8::Utf8Assembler;

/// Parameters of one generation call
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// The input prompt text
    pub prompt: String,
    /// Maximum number of tokens to generate; must be positive
    pub max_tokens: u32,
    /// Temperature for sampling (0.0 = greedy, higher = more random)
    pub temperature: f32,
    /// Top-k sampling parameter (0 = disabled)
    pub top_k: u32,
    /// Top-p (nucleus) sampling parameter
    pub top_p: f32,
    /// Repetition penalty (1.0 = disabled)
    pub repeat_penalty: f32,
    /// Random seed for sampling (0 = random)
    pub seed: u32,
}

impl GenerationRequest {
    /// Creates a request for `prompt` with default sampling parameters
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            max_tokens: 512,
            temperature: 0.7,
            top_k: 40,
            top_p: 0.95,
            repeat_penalty: 1.1,
            seed: 0,
        }
    }
}

/// Why a generation ended
#[derive(Debug, Clone)]
pub enum FinishReason {
    /// The model produced an end-of-generation token
    EndOfGeneration,
    /// A stop sequence appeared in the output
    StopSequence,
    /// The token budget ran out
    MaxTokens,
    /// The cancel token was triggered
    Cancelled,
    /// The streaming consumer asked to stop
    ConsumerStopped,
    /// An engine call failed mid-generation; the text so far is kept
    Failed(EngineError),
}

impl fmt::Display for FinishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FinishReason::EndOfGeneration => write!(f, "eos"),
            FinishReason::StopSequence => write!(f, "stop_sequence"),
            FinishReason::MaxTokens => write!(f, "max_tokens"),
            FinishReason::Cancelled => write!(f, "cancelled"),
            FinishReason::ConsumerStopped => write!(f, "consumer_stopped"),
            FinishReason::Failed(e) => write!(f, "failed: {}", e),
        }
    }
}

/// Result of a finished generation
#[derive(Debug, Clone)]
pub struct Generation {
    /// Generated text with stop sequences trimmed
    pub text: String,
    /// Why the loop ended
    pub finish_reason: FinishReason,
    /// Number of prompt tokens
    pub prompt_tokens: usize,
    /// Number of sampled tokens, excluding an end-of-generation token
    pub generated_tokens: usize,
}

impl Generation {
    /// Returns false if an engine call cut the generation short
    pub fn is_complete(&self) -> bool {
        !matches!(self.finish_reason, FinishReason::Failed(_))
    }

    /// True for a complete generation that produced some text
    pub fn has_reply(&self) -> bool {
        self.is_complete() && !self.text.is_empty()
    }

    /// The engine error that ended the generation, if any
    pub fn error(&self) -> Option<&EngineError> {
        match &self.finish_reason {
            FinishReason::Failed(e) => Some(e),
            _ => None,
        }
    }
}

/// Generates a complete response in batch mode.
///
/// Only one generation may use `backend` at a time.
pub fn generate<B: InferenceBackend>(
    backend: &mut B,
    request: &GenerationRequest,
    stops: &StopSequences,
    cancel: &CancelToken,
) -> Result<Generation, EngineError> {
    run(backend, request, stops, cancel, None)
}

/// Generates a response, handing each completed fragment to `consumer`.
///
/// `consumer` returns `false` to stop early. The fragments delivered
/// concatenate to the returned text and never contain any part of a stop
/// sequence.
pub fn generate_streaming<B, F>(
    backend: &mut B,
    request: &GenerationRequest,
    stops: &StopSequences,
    cancel: &CancelToken,
    mut consumer: F,
) -> Result<Generation, EngineError>
where
    B: InferenceBackend,
    F: FnMut(&str) -> bool,
{
    run(backend, request, stops, cancel, Some(&mut consumer))
}

/// Streams a generation into `tx`, finishing with `Done` or `Error`.
///
/// A dropped receiver stops the generation at the next fragment.
pub fn stream_to_channel<B: InferenceBackend>(
    backend: &mut B,
    request: &GenerationRequest,
    stops: &StopSequences,
    cancel: &CancelToken,
    tx: &Sender<StreamToken>,
) {
    let result = generate_streaming(backend, request, stops, cancel, |fragment| {
        tx.send(StreamToken::Token(fragment.to_string())).is_ok()
    });
    send_result(tx, result);
}

/// Like [`stream_to_channel`], but blocks after every fragment until the
/// consumer's verdict arrives on `verdicts`.
///
/// Nothing is sampled or decoded while a fragment is unanswered. A `false`
/// verdict, or a closed verdict channel, ends the generation with
/// [`FinishReason::ConsumerStopped`].
pub fn stream_in_step<B: InferenceBackend>(
    backend: &mut B,
    request: &GenerationRequest,
    stops: &StopSequences,
    cancel: &CancelToken,
    tx: &Sender<StreamToken>,
    verdicts: &Receiver<bool>,
) {
    let result = generate_streaming(backend, request, stops, cancel, |fragment| {
        tx.send(StreamToken::Token(fragment.to_string())).is_ok()
            && verdicts.recv().unwrap_or(false)
    });
    send_result(tx, result);
}

fn send_result(tx: &Sender<StreamToken>, result: Result<Generation, EngineError>) {
    let last = match result {
        Ok(generation) => StreamToken::Done(generation),
        Err(e) => StreamToken::Error(e),
    };
    let _ = tx.send(last);
}

type Consumer<'c> = Option<&'c mut dyn FnMut(&str) -> bool>;

fn run<B: InferenceBackend>(
    backend: &mut B,
    request: &GenerationRequest,
    stops: &StopSequences,
    cancel: &CancelToken,
    mut consumer: Consumer<'_>,
) -> Result<Generation, EngineError> {
    if request.max_tokens == 0 {
        return Err(EngineError::InvalidRequest(
            "max_tokens must be positive".to_string(),
        ));
    }

    backend.clear_decode_memory();

    let prompt_tokens = backend.tokenize(&request.prompt)?;
    if prompt_tokens.is_empty() {
        return Err(EngineError::EmptyPrompt);
    }

    let budget = plan_budget(
        prompt_tokens.len(),
        request.max_tokens,
        backend.context_capacity(),
    )?;

    tracing::debug!(
        "Tokenized prompt into {} tokens, budget {} tokens",
        prompt_tokens.len(),
        budget
    );

    let prompt_batch = TokenBatch::prompt(&prompt_tokens);
    backend.decode(&prompt_batch)?;

    let sampler = backend.build_sampler(&SamplerPlan::from_request(request));
    let mut session = GenerationSession::new(&prompt_batch, sampler);

    let mut finish = FinishReason::MaxTokens;
    for step in 0..budget {
        if cancel.is_cancelled() {
            tracing::debug!("Generation stopped by cancel request");
            finish = FinishReason::Cancelled;
            break;
        }

        let token = backend.sample(&mut session.sampler, session.logits_index);
        if backend.is_end_of_generation(token) {
            tracing::debug!("End of generation token encountered");
            finish = FinishReason::EndOfGeneration;
            break;
        }
        session.generated += 1;

        let bytes = match backend.token_to_bytes(token) {
            Ok(bytes) => bytes,
            Err(e) => {
                finish = FinishReason::Failed(e);
                break;
            }
        };

        if let Some(fragment) = session.assembler.push(&bytes) {
            let matched = session.append(&fragment, stops);

            if let Some(consumer) = consumer.as_deref_mut() {
                if !session.deliver(stops, consumer, matched) && !matched {
                    tracing::debug!("Consumer stopped generation");
                    finish = FinishReason::ConsumerStopped;
                    break;
                }
            }

            if matched {
                tracing::debug!("Stop sequence found, trimming output");
                finish = FinishReason::StopSequence;
                break;
            }
        }

        // The last budgeted token is never sampled from, skip its decode
        if step + 1 == budget {
            break;
        }

        let batch = TokenBatch::continuation(token, session.cursor);
        if let Err(e) = backend.decode(&batch) {
            finish = FinishReason::Failed(e);
            break;
        }
        session.advance(&batch);
    }

    Ok(session.finish(finish, stops, consumer))
}

/// Per-call generation state
struct GenerationSession<S> {
    prompt_tokens: usize,
    /// Position of the next token to decode
    cursor: u32,
    /// Batch index holding the logits for the next sample
    logits_index: i32,
    sampler: S,
    assembler: Utf8Assembler,
    text: String,
    /// Bytes of `text` already handed to the consumer
    delivered: usize,
    generated: usize,
}

impl<S> GenerationSession<S> {
    fn new(prompt_batch: &TokenBatch, sampler: S) -> Self {
        Self {
            prompt_tokens: prompt_batch.len(),
            cursor: prompt_batch.len() as u32,
            logits_index: prompt_batch.logits_index(),
            sampler,
            assembler: Utf8Assembler::new(),
            text: String::new(),
            delivered: 0,
            generated: 0,
        }
    }

    fn advance(&mut self, batch: &TokenBatch) {
        self.cursor += batch.len() as u32;
        self.logits_index = batch.logits_index();
    }

    /// Appends a fragment and cuts the text at a new stop sequence.
    /// Returns true if one was found.
    fn append(&mut self, fragment: &str, stops: &StopSequences) -> bool {
        let scan_from = self.text.len();
        self.text.push_str(fragment);

        match stops.find_from(&self.text, scan_from) {
            Some(pos) => {
                self.text.truncate(pos);
                true
            }
            None => false,
        }
    }

    /// Hands undelivered text to the consumer.
    ///
    /// Unless `settled`, a tail that may still grow into a stop sequence is
    /// kept back. Returns the consumer's verdict, or true if nothing was sent.
    fn deliver(
        &mut self,
        stops: &StopSequences,
        consumer: &mut dyn FnMut(&str) -> bool,
        settled: bool,
    ) -> bool {
        let safe = if settled {
            self.text.len()
        } else {
            stops.holdback_start(&self.text)
        };
        if safe <= self.delivered {
            return true;
        }

        let fragment = &self.text[self.delivered..safe];
        self.delivered = safe;
        consumer(fragment)
    }

    fn finish(
        mut self,
        reason: FinishReason,
        stops: &StopSequences,
        consumer: Consumer<'_>,
    ) -> Generation {
        let streaming = consumer.is_some();

        match reason {
            FinishReason::StopSequence | FinishReason::ConsumerStopped => {}
            _ => {
                if let Some(rest) = self.assembler.finish() {
                    self.append(&rest, stops);
                }
            }
        }

        let end = stops.trim(&self.text).len();
        self.text.truncate(end);

        if let Some(consumer) = consumer {
            if matches!(reason, FinishReason::ConsumerStopped) {
                self.text.truncate(self.delivered);
            } else {
                self.deliver(stops, consumer, true);
            }
        }

        match &reason {
            FinishReason::Failed(e) => tracing::error!(
                "Generation failed after {} tokens, keeping {} bytes of output: {}",
                self.generated,
                self.text.len(),
                e
            ),
            _ => tracing::debug!(
                "Generation finished ({}): {} prompt tokens, {} generated, streaming: {}",
                reason,
                self.prompt_tokens,
                self.generated,
                streaming
            ),
        }

        Generation {
            text: self.text,
            finish_reason: reason,
            prompt_tokens: self.prompt_tokens,
            generated_tokens: self.generated,
        }
    }
}
