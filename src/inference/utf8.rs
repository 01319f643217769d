//! UTF-8 fragment assembly
//!
//! Tokens map to raw byte pieces that may end in the middle of a multi-byte
//! character. The assembler holds bytes back until the whole buffer decodes.

/// Accumulates token bytes until they form complete UTF-8 text
#[derive(Debug, Clone, Default)]
pub struct Utf8Assembler {
    buffer: Vec<u8>,
}

impl Utf8Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `bytes` and returns the buffered text once it is valid UTF-8.
    ///
    /// An invalid or incomplete buffer is kept as is, on the assumption that
    /// continuation bytes arrive with the next token.
    pub fn push(&mut self, bytes: &[u8]) -> Option<String> {
        self.buffer.extend_from_slice(bytes);

        if self.buffer.is_empty() || std::str::from_utf8(&self.buffer).is_err() {
            return None;
        }

        let text = String::from_utf8(std::mem::take(&mut self.buffer)).ok()?;
        Some(text)
    }

    /// Flushes the buffer at end of stream.
    ///
    /// Bytes that never became valid UTF-8 are dropped.
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }

        let bytes = std::mem::take(&mut self.buffer);
        match String::from_utf8(bytes) {
            Ok(text) => Some(text),
            Err(e) => {
                tracing::debug!(
                    "Dropping {} trailing bytes that are not valid UTF-8",
                    e.as_bytes().len()
                );
                None
            }
        }
    }

    /// Number of bytes waiting for completion
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assemble(pieces: &[&[u8]]) -> Vec<String> {
        let mut assembler = Utf8Assembler::new();
        let mut out: Vec<String> = pieces.iter().filter_map(|p| assembler.push(p)).collect();
        out.extend(assembler.finish());
        out
    }

    #[test]
    fn test_ascii_passes_through() {
        let out = assemble(&[b"He", b"llo", b" wor", b"ld"]);
        assert_eq!(out, vec!["He", "llo", " wor", "ld"]);
    }

    #[test]
    fn test_split_multibyte_char() {
        // "é" is 0xC3 0xA9
        let mut assembler = Utf8Assembler::new();
        assert_eq!(assembler.push(&[b'c', b'a', b'f', 0xC3]), None);
        assert_eq!(assembler.pending(), 4);
        assert_eq!(assembler.push(&[0xA9]), Some("café".to_string()));
        assert_eq!(assembler.pending(), 0);
    }

    #[test]
    fn test_four_byte_char_across_three_pushes() {
        let crab = "🦀".as_bytes();
        let out = assemble(&[&crab[..1], &crab[1..3], &crab[3..], b"!"]);
        assert_eq!(out.concat(), "🦀!");
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_reassembly_preserves_bytes() {
        let text = "naïve 日本語 🦀 done";
        let bytes = text.as_bytes();
        for chunk in 1..=5 {
            let pieces: Vec<&[u8]> = bytes.chunks(chunk).collect();
            let out = assemble(&pieces);
            assert_eq!(out.concat(), text, "chunk size {chunk}");
            assert!(out.iter().all(|s| !s.is_empty()));
        }
    }

    #[test]
    fn test_invalid_lead_byte_keeps_buffering() {
        let mut assembler = Utf8Assembler::new();
        assert_eq!(assembler.push(&[0xFF]), None);
        assert_eq!(assembler.push(b"abc"), None);
        assert_eq!(assembler.pending(), 4);
    }

    #[test]
    fn test_finish_drops_invalid_tail() {
        let mut assembler = Utf8Assembler::new();
        assert_eq!(assembler.push(b"ok"), Some("ok".to_string()));
        assert_eq!(assembler.push(&[0xE6, 0x97]), None);
        assert_eq!(assembler.finish(), None);
        assert_eq!(assembler.pending(), 0);
    }

    #[test]
    fn test_empty_push_emits_nothing() {
        let mut assembler = Utf8Assembler::new();
        assert_eq!(assembler.push(b""), None);
        assert_eq!(assembler.finish(), None);
    }
}
