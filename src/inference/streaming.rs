//! Streaming inference support
//!
//! Handles fragment-by-fragment streaming output from the worker thread.

use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use crate::inference::cancel::CancelToken;
use crate::inference::engine::EngineError;
use crate::inference::generator::Generation;

/// Represents an item emitted during streaming inference.
#[derive(Debug, Clone)]
pub enum StreamToken {
    /// A generated text fragment, always complete UTF-8
    Token(String),
    /// Generation finished, possibly cut short by an engine failure
    Done(Generation),
    /// Generation could not start
    Error(EngineError),
}

impl StreamToken {
    /// Returns true if this is a token variant
    pub fn is_token(&self) -> bool {
        matches!(self, StreamToken::Token(_))
    }

    /// Returns true if generation is complete
    pub fn is_done(&self) -> bool {
        matches!(self, StreamToken::Done(_))
    }

    /// Returns true if an error occurred
    pub fn is_error(&self) -> bool {
        matches!(self, StreamToken::Error(_))
    }

    /// Extracts the token string if this is a Token variant
    pub fn as_token(&self) -> Option<&str> {
        match self {
            StreamToken::Token(s) => Some(s),
            _ => None,
        }
    }

    /// Extracts the error if this is an Error variant
    pub fn as_error(&self) -> Option<&EngineError> {
        match self {
            StreamToken::Error(e) => Some(e),
            _ => None,
        }
    }

    fn is_terminal(&self) -> bool {
        !self.is_token()
    }
}

/// Lazy, cancelable sequence of stream tokens for one generation.
///
/// Yields fragments in order and ends after the `Done` or `Error` item.
/// Dropping the stream stops the generation at its next fragment.
pub struct GenerationStream {
    receiver: Receiver<StreamToken>,
    cancel: CancelToken,
    finished: bool,
}

impl GenerationStream {
    pub fn new(receiver: Receiver<StreamToken>, cancel: CancelToken) -> Self {
        Self {
            receiver,
            cancel,
            finished: false,
        }
    }

    /// Asks the generation to stop before its next token.
    ///
    /// The stream still ends with a `Done` item carrying the text so far.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Handle that can stop this generation from another thread
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Waits up to `timeout` for the next item.
    ///
    /// Returns `None` on timeout or once the stream has ended.
    pub fn next_timeout(&mut self, timeout: Duration) -> Option<StreamToken> {
        if self.finished {
            return None;
        }
        match self.receiver.recv_timeout(timeout) {
            Ok(token) => Some(self.observe(token)),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => self.disconnected(),
        }
    }

    /// Drains the stream, returning the final generation
    pub fn wait(self) -> Result<Generation, EngineError> {
        for token in self {
            match token {
                StreamToken::Token(_) => {}
                StreamToken::Done(generation) => return Ok(generation),
                StreamToken::Error(e) => return Err(e),
            }
        }
        Err(EngineError::WorkerError(
            "Stream ended without a result".to_string(),
        ))
    }

    fn observe(&mut self, token: StreamToken) -> StreamToken {
        if token.is_terminal() {
            self.finished = true;
        }
        token
    }

    fn disconnected(&mut self) -> Option<StreamToken> {
        self.finished = true;
        tracing::debug!("Stream sender dropped before completion");
        Some(StreamToken::Error(EngineError::WorkerError(
            "Worker stopped before finishing the generation".to_string(),
        )))
    }
}

impl Iterator for GenerationStream {
    type Item = StreamToken;

    fn next(&mut self) -> Option<StreamToken> {
        if self.finished {
            return None;
        }
        match self.receiver.recv() {
            Ok(token) => Some(self.observe(token)),
            Err(_) => self.disconnected(),
        }
    }
}

impl Drop for GenerationStream {
    fn drop(&mut self) {
        if !self.finished {
            self.cancel.cancel();
        }
    }
}

/// Feeds fragments from a [`stream_in_step`] producer to `consumer`,
/// answering each one with the consumer's verdict.
///
/// Returns the producer's final generation, so a stopped stream reports
/// exactly what was delivered.
///
/// [`stream_in_step`]: crate::inference::generator::stream_in_step
pub fn consume_in_step<F>(
    receiver: Receiver<StreamToken>,
    verdicts: Sender<bool>,
    mut consumer: F,
) -> Result<Generation, EngineError>
where
    F: FnMut(&str) -> bool,
{
    for token in receiver {
        match token {
            StreamToken::Token(fragment) => {
                // A send error means the producer is gone; its last item is
                // still in the channel.
                let _ = verdicts.send(consumer(&fragment));
            }
            StreamToken::Done(generation) => return Ok(generation),
            StreamToken::Error(e) => return Err(e),
        }
    }

    Err(EngineError::WorkerError(
        "Worker stopped before finishing the generation".to_string(),
    ))
}
