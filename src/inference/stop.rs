//! Stop-sequence detection
//!
//! Models sometimes run past their own turn and start writing the next one
//! ("\n\nUser: ..."). These delimiters are searched in the generated text and
//! the output is cut at the earliest one.

use crate::truncate_str;

/// Chat-template delimiters that end a response
pub const DEFAULT_STOP_SEQUENCES: &[&str] = &[
    "\n\nUser:",
    "\nUser:",
    "\nHuman:",
    "\nAssistant:",
    "### Instruction:",
    "### Input:",
    "### Response:",
    "### Human:",
    "### Assistant:",
    "### User:",
    "### System:",
    "<|user|>",
    "<|assistant|>",
    "<|im_start|>",
    "<|im_end|>",
    "<|endoftext|>",
    "</s>",
];

/// Ordered set of literal stop sequences
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopSequences {
    sequences: Vec<String>,
    /// Byte length of the longest member
    longest: usize,
}

impl StopSequences {
    /// Builds a set from `sequences`, skipping empty strings.
    pub fn new<I, S>(sequences: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let sequences: Vec<String> = sequences
            .into_iter()
            .map(Into::into)
            .filter(|s: &String| !s.is_empty())
            .collect();
        let longest = sequences.iter().map(String::len).max().unwrap_or(0);

        Self { sequences, longest }
    }

    /// A set that never matches
    pub fn none() -> Self {
        Self::new(Vec::<String>::new())
    }

    pub fn as_slice(&self) -> &[String] {
        &self.sequences
    }

    /// Returns the byte offset of the earliest-starting stop sequence.
    ///
    /// Members matching at the same offset resolve to the first one in set order.
    pub fn find(&self, text: &str) -> Option<usize> {
        let mut earliest: Option<usize> = None;
        for sequence in &self.sequences {
            if let Some(pos) = text.find(sequence.as_str()) {
                if earliest.map_or(true, |e| pos < e) {
                    earliest = Some(pos);
                }
            }
        }
        earliest
    }

    /// Like [`find`](Self::find), for text whose prefix up to `scan_from` is
    /// already known to be free of stop sequences.
    ///
    /// Only matches that end at or after `scan_from` are possible, so the
    /// search window starts one delimiter length before it.
    pub fn find_from(&self, text: &str, scan_from: usize) -> Option<usize> {
        let start = scan_from.saturating_sub(self.longest.saturating_sub(1));
        let start = truncate_str(text, start).len();
        self.find(&text[start..]).map(|pos| start + pos)
    }

    pub fn detect(&self, text: &str) -> bool {
        self.find(text).is_some()
    }

    /// Truncates `text` at the earliest stop sequence.
    pub fn trim<'a>(&self, text: &'a str) -> &'a str {
        match self.find(text) {
            Some(pos) => &text[..pos],
            None => text,
        }
    }

    /// Returns the earliest offset from which the tail of `text` could still
    /// grow into a stop sequence, or `text.len()` if no tail can.
    ///
    /// Streaming holds that tail back so a consumer never sees a partial
    /// delimiter that is later trimmed away.
    pub fn holdback_start(&self, text: &str) -> usize {
        let window = text.len().saturating_sub(self.longest.saturating_sub(1));
        let window = truncate_str(text, window).len();

        (window..text.len())
            .filter(|&pos| text.is_char_boundary(pos))
            .find(|&pos| {
                let tail = &text[pos..];
                self.sequences
                    .iter()
                    .any(|s| s.len() > tail.len() && s.starts_with(tail))
            })
            .unwrap_or(text.len())
    }
}

impl Default for StopSequences {
    fn default() -> Self {
        Self::new(DEFAULT_STOP_SEQUENCES.iter().copied())
    }
}
