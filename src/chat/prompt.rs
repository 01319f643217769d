//! Prompt formatting and response cleanup
//!
//! Prompts use the ChatML layout (`<|im_start|>role ... <|im_end|>`).

use once_cell::sync::Lazy;
use regex::Regex;

use crate::inference::StopSequences;

/// Inputs longer than this many characters are treated as text to summarize
pub const SUMMARIZATION_THRESHOLD: usize = 200;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant. Answer directly and concisely. \
Stay focused on what was asked. Do not add unrelated information.";

pub const SUMMARIZATION_SYSTEM_PROMPT: &str = "You are a summarization assistant. \
Summarize the given text concisely. Extract only the key points. \
Output a brief summary, not the original text.";

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid whitespace regex"));

/// One finished user/assistant exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    pub user: String,
    pub assistant: String,
}

/// System and user text for one turn after input classification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn<'a> {
    pub system: &'a str,
    pub user: String,
}

/// Decides how to present `input` to the model.
///
/// Long inputs are assumed to be pasted text and get the summarization system
/// prompt, with an explicit instruction unless the input already asks for a
/// summary.
pub fn prepare_turn<'a>(input: &str, system_prompt: &'a str) -> Turn<'a> {
    let input = input.trim();

    if input.chars().count() <= SUMMARIZATION_THRESHOLD {
        return Turn {
            system: system_prompt,
            user: input.to_string(),
        };
    }

    let user = if input.to_lowercase().contains("summar") {
        input.to_string()
    } else {
        format!("Summarize this:\n{}", input)
    };

    Turn {
        system: SUMMARIZATION_SYSTEM_PROMPT,
        user,
    }
}

/// Renders a ChatML prompt ending with an open assistant turn
pub fn format_chatml(system: &str, history: &[Exchange], user: &str) -> String {
    let mut prompt = String::new();
    push_block(&mut prompt, "system", system);
    for exchange in history {
        push_block(&mut prompt, "user", &exchange.user);
        push_block(&mut prompt, "assistant", &exchange.assistant);
    }
    push_block(&mut prompt, "user", user);
    prompt.push_str("<|im_start|>assistant\n");
    prompt
}

fn push_block(prompt: &mut String, role: &str, content: &str) {
    prompt.push_str("<|im_start|>");
    prompt.push_str(role);
    prompt.push('\n');
    prompt.push_str(content);
    prompt.push_str("<|im_end|>\n");
}

/// Strips surrounding whitespace and anything from the first stop sequence on.
///
/// With `collapse_whitespace`, every whitespace run becomes a single space.
pub fn clean_response(response: &str, stops: &StopSequences, collapse_whitespace: bool) -> String {
    let cleaned = stops.trim(response.trim()).trim();

    if collapse_whitespace {
        WHITESPACE.replace_all(cleaned, " ").into_owned()
    } else {
        cleaned.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_input_keeps_system_prompt() {
        let turn = prepare_turn("  What is Rust?  ", DEFAULT_SYSTEM_PROMPT);
        assert_eq!(turn.system, DEFAULT_SYSTEM_PROMPT);
        assert_eq!(turn.user, "What is Rust?");
    }

    #[test]
    fn test_long_input_becomes_summarization() {
        let text = "word ".repeat(60);
        let turn = prepare_turn(&text, DEFAULT_SYSTEM_PROMPT);

        assert_eq!(turn.system, SUMMARIZATION_SYSTEM_PROMPT);
        assert!(turn.user.starts_with("Summarize this:\n"));
    }

    #[test]
    fn test_long_input_asking_for_summary_kept() {
        let text = format!("Please summarize: {}", "data ".repeat(60));
        let turn = prepare_turn(&text, DEFAULT_SYSTEM_PROMPT);

        assert_eq!(turn.system, SUMMARIZATION_SYSTEM_PROMPT);
        assert!(turn.user.starts_with("Please summarize"));
    }

    #[test]
    fn test_format_chatml_without_history() {
        let prompt = format_chatml("Be brief.", &[], "Hi");
        assert_eq!(
            prompt,
            "<|im_start|>system\nBe brief.<|im_end|>\n\
             <|im_start|>user\nHi<|im_end|>\n\
             <|im_start|>assistant\n"
        );
    }

    #[test]
    fn test_format_chatml_with_history() {
        let history = vec![Exchange {
            user: "Hi".to_string(),
            assistant: "Hello!".to_string(),
        }];
        let prompt = format_chatml("sys", &history, "How are you?");

        let user_at = prompt.find("<|im_start|>user\nHi").unwrap();
        let reply_at = prompt.find("<|im_start|>assistant\nHello!<|im_end|>").unwrap();
        let next_at = prompt.find("<|im_start|>user\nHow are you?").unwrap();
        assert!(user_at < reply_at && reply_at < next_at);
        assert!(prompt.ends_with("<|im_start|>assistant\n"));
    }

    #[test]
    fn test_clean_response_trims_stop_sequence() {
        let stops = StopSequences::default();
        let cleaned = clean_response("  Sure!\n\nUser: what now", &stops, false);
        assert_eq!(cleaned, "Sure!");
    }

    #[test]
    fn test_clean_response_collapses_whitespace() {
        let stops = StopSequences::default();
        let cleaned = clean_response("one\n\n two\t three ", &stops, true);
        assert_eq!(cleaned, "one two three");
    }

    #[test]
    fn test_clean_response_keeps_layout_by_default() {
        let stops = StopSequences::default();
        let cleaned = clean_response("- a\n- b\n", &stops, false);
        assert_eq!(cleaned, "- a\n- b");
    }
}
