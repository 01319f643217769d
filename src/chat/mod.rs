//! Chat sessions
//!
//! Wraps the engine with ChatML prompt building, a short rolling history and
//! response cleanup.

pub mod prompt;

use std::collections::VecDeque;

use crate::inference::{EngineError, Generation, GenerationRequest, LlamaEngine, StopSequences};
use crate::storage::settings::InferenceSettings;

pub use prompt::{
    clean_response, format_chatml, prepare_turn, Exchange, Turn, DEFAULT_SYSTEM_PROMPT,
    SUMMARIZATION_SYSTEM_PROMPT, SUMMARIZATION_THRESHOLD,
};

/// Number of past exchanges kept in the prompt by default
pub const DEFAULT_MAX_HISTORY_TURNS: usize = 1;

/// A conversation with a loaded model
#[derive(Debug, Clone)]
pub struct ChatSession {
    system_prompt: String,
    max_history_turns: usize,
    collapse_whitespace: bool,
    history: VecDeque<Exchange>,
    /// Sampling parameters; the prompt field is replaced on every turn
    template: GenerationRequest,
}

impl ChatSession {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            max_history_turns: DEFAULT_MAX_HISTORY_TURNS,
            collapse_whitespace: false,
            history: VecDeque::new(),
            template: GenerationRequest::new(""),
        }
    }

    /// Builds a session from persisted settings
    pub fn from_settings(settings: &InferenceSettings) -> Self {
        Self::new(settings.system_prompt.clone())
            .with_max_history_turns(settings.max_history_turns)
            .with_collapse_whitespace(settings.collapse_whitespace)
            .with_template(settings.to_request(""))
    }

    pub fn with_max_history_turns(mut self, turns: usize) -> Self {
        self.max_history_turns = turns;
        self.trim_history();
        self
    }

    pub fn with_collapse_whitespace(mut self, collapse: bool) -> Self {
        self.collapse_whitespace = collapse;
        self
    }

    pub fn with_template(mut self, template: GenerationRequest) -> Self {
        self.template = template;
        self
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn history(&self) -> impl Iterator<Item = &Exchange> {
        self.history.iter()
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
        tracing::debug!("Chat history cleared");
    }

    /// Renders the full prompt for `input` with the current history
    pub fn build_prompt(&self, input: &str) -> String {
        let turn = prepare_turn(input, &self.system_prompt);
        let history: Vec<Exchange> = self.history.iter().cloned().collect();
        format_chatml(turn.system, &history, &turn.user)
    }

    /// Sends one user message and waits for the whole reply
    pub fn send(&mut self, engine: &LlamaEngine, input: &str) -> Result<Generation, EngineError> {
        let stops = engine.stop_sequences().clone();
        self.send_with(input, &stops, |request| engine.generate(request))
    }

    /// Sends one user message, passing reply fragments to `consumer` as they
    /// arrive.
    ///
    /// The fragments are the raw model output; the returned text is cleaned.
    pub fn send_streaming<F>(
        &mut self,
        engine: &LlamaEngine,
        input: &str,
        consumer: F,
    ) -> Result<Generation, EngineError>
    where
        F: FnMut(&str) -> bool,
    {
        let stops = engine.stop_sequences().clone();
        self.send_with(input, &stops, |request| {
            engine.generate_streaming(request, consumer)
        })
    }

    /// Runs one turn through `generate`, cleaning the reply and recording it
    /// in the history.
    ///
    /// Replies cut short by an engine failure are returned but not recorded.
    pub fn send_with<G>(
        &mut self,
        input: &str,
        stops: &StopSequences,
        generate: G,
    ) -> Result<Generation, EngineError>
    where
        G: FnOnce(GenerationRequest) -> Result<Generation, EngineError>,
    {
        let input = input.trim();
        if input.is_empty() {
            return Err(EngineError::EmptyPrompt);
        }

        let request = GenerationRequest {
            prompt: self.build_prompt(input),
            ..self.template.clone()
        };

        let mut generation = generate(request)?;
        generation.text = clean_response(&generation.text, stops, self.collapse_whitespace);

        if generation.has_reply() {
            self.push_exchange(Exchange {
                user: input.to_string(),
                assistant: generation.text.clone(),
            });
        }

        Ok(generation)
    }

    fn push_exchange(&mut self, exchange: Exchange) {
        self.history.push_back(exchange);
        self.trim_history();
    }

    fn trim_history(&mut self) {
        while self.history.len() > self.max_history_turns {
            self.history.pop_front();
        }
    }
}

impl Default for ChatSession {
    fn default() -> Self {
        Self::new(DEFAULT_SYSTEM_PROMPT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::generator::{self, tests::ScriptedBackend};
    use crate::inference::{CancelToken, FinishReason};

    fn run_scripted(
        session: &mut ChatSession,
        input: &str,
        pieces: &[&str],
    ) -> Result<Generation, EngineError> {
        let stops = StopSequences::default();
        let mut backend = ScriptedBackend::new(pieces);
        session.send_with(input, &stops, |request| {
            generator::generate(&mut backend, &request, &stops, &CancelToken::new())
        })
    }

    #[test]
    fn test_send_cleans_and_records_reply() {
        let mut session = ChatSession::default();
        let generation = run_scripted(&mut session, "Hi", &[" Hello", " there!\n"]).unwrap();

        assert_eq!(generation.text, "Hello there!");
        let history: Vec<_> = session.history().collect();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].user, "Hi");
        assert_eq!(history[0].assistant, "Hello there!");
    }

    #[test]
    fn test_history_is_bounded() {
        let mut session = ChatSession::default();
        run_scripted(&mut session, "first", &["one"]).unwrap();
        run_scripted(&mut session, "second", &["two"]).unwrap();

        let history: Vec<_> = session.history().collect();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].user, "second");
    }

    #[test]
    fn test_prompt_includes_previous_exchange() {
        let mut session = ChatSession::default().with_max_history_turns(2);
        run_scripted(&mut session, "My name is Ada.", &["Nice to meet you."]).unwrap();

        let prompt = session.build_prompt("What is my name?");
        assert!(prompt.contains("<|im_start|>user\nMy name is Ada.<|im_end|>"));
        assert!(prompt.contains("<|im_start|>assistant\nNice to meet you.<|im_end|>"));
        assert!(prompt.ends_with("<|im_start|>user\nWhat is my name?<|im_end|>\n<|im_start|>assistant\n"));
    }

    #[test]
    fn test_zero_history_turns_keeps_nothing() {
        let mut session = ChatSession::default().with_max_history_turns(0);
        run_scripted(&mut session, "Hi", &["Hello"]).unwrap();
        assert_eq!(session.history().count(), 0);
    }

    #[test]
    fn test_blank_input_rejected() {
        let mut session = ChatSession::default();
        let result = session.send_with("   ", &StopSequences::default(), |_| {
            panic!("blank input must not reach the engine")
        });
        assert!(matches!(result, Err(EngineError::EmptyPrompt)));
    }

    #[test]
    fn test_failed_reply_not_recorded() {
        let mut session = ChatSession::default();
        let result = session.send_with("Hi", &StopSequences::default(), |_| {
            Ok(Generation {
                text: "partial".to_string(),
                finish_reason: FinishReason::Failed(EngineError::Decode("boom".to_string())),
                prompt_tokens: 4,
                generated_tokens: 1,
            })
        });

        assert_eq!(result.unwrap().text, "partial");
        assert_eq!(session.history().count(), 0);
    }

    #[test]
    fn test_empty_reply_not_recorded() {
        let mut session = ChatSession::default();
        let generation = run_scripted(&mut session, "Hi", &["  \n"]).unwrap();

        assert!(generation.text.is_empty());
        assert_eq!(session.history().count(), 0);
    }

    #[test]
    fn test_template_parameters_are_used() {
        let template = GenerationRequest {
            max_tokens: 7,
            temperature: 0.2,
            ..GenerationRequest::new("")
        };
        let mut session = ChatSession::default().with_template(template);

        session
            .send_with("Hi", &StopSequences::default(), |request| {
                assert_eq!(request.max_tokens, 7);
                assert!(request.prompt.contains("<|im_start|>user\nHi<|im_end|>"));
                Ok(Generation {
                    text: "ok".to_string(),
                    finish_reason: FinishReason::EndOfGeneration,
                    prompt_tokens: 4,
                    generated_tokens: 1,
                })
            })
            .unwrap();
    }

    #[test]
    fn test_clear_history() {
        let mut session = ChatSession::default();
        run_scripted(&mut session, "Hi", &["Hello"]).unwrap();
        session.clear_history();
        assert_eq!(session.history().count(), 0);
    }
}
