//! Incremental UTF-8 decoding of terminal byte streams.
//!
//! PTYs and terminals cut their streams at arbitrary byte boundaries, so a
//! multi-byte character can straddle two reads. Envelope payloads must be
//! valid UTF-8, so the trailing incomplete sequence of a chunk is held back
//! and prepended to the next one.
//! Bytes that can never form a valid character become U+FFFD.

/// Stateful decoder that turns a byte stream into text without reordering.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    /// Creates an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes the next chunk, holding back an incomplete trailing character.
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        let mut input = std::mem::take(&mut self.pending);
        input.extend_from_slice(chunk);

        let mut out = String::with_capacity(input.len());
        let mut rest = input.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(text) => {
                    out.push_str(text);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            self.pending = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// Flushes whatever is still held back, e.g. when the stream ends.
    pub fn finish(&mut self) -> String {
        let pending = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&pending).into_owned()
    }

    /// Number of bytes currently held back.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ascii_passes_through() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.decode(b"hello\r\n"), "hello\r\n");
        assert_eq!(decoder.pending_len(), 0);
    }

    #[test]
    fn test_split_multibyte_character() {
        // "é" is 0xC3 0xA9, "€" is 0xE2 0x82 0xAC
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.decode(b"caf\xC3"), "caf");
        assert_eq!(decoder.pending_len(), 1);
        assert_eq!(decoder.decode(b"\xA9 \xE2\x82"), "é ");
        assert_eq!(decoder.decode(b"\xAC!"), "€!");
        assert_eq!(decoder.pending_len(), 0);
    }

    #[test]
    fn test_byte_at_a_time_preserves_order() {
        let text = "ls → ünïcödé ✓\r\n";
        let mut decoder = Utf8Decoder::new();
        let mut out = String::new();
        for byte in text.as_bytes() {
            out.push_str(&decoder.decode(std::slice::from_ref(byte)));
        }
        out.push_str(&decoder.finish());
        assert_eq!(out, text);
    }

    #[test]
    fn test_invalid_bytes_are_replaced() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.decode(b"a\xFFb"), "a\u{FFFD}b");
    }

    #[test]
    fn test_finish_flushes_incomplete_tail() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.decode(b"x\xE2\x82"), "x");
        assert_eq!(decoder.finish(), "\u{FFFD}");
        assert_eq!(decoder.pending_len(), 0);
    }
}
