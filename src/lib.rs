//! LocalChat Library
//!
//! On-device LLM text generation over llama.cpp: a cancellable, streaming
//! generation loop, chat sessions and local persistence.

pub mod chat;
pub mod inference;
pub mod storage;
pub mod system;
pub mod types;

/// Safely truncate a string at a char boundary, never panics.
pub fn truncate_str(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
