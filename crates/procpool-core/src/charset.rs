//! Byte/string conversion for the pump and stdin writer.
//!
//! `Latin1` is the default and the one that matters: ISO-8859-1 maps each
//! byte 0..=255 directly onto the Unicode codepoints U+0000..=U+00FF, so an
//! arbitrary byte sequence (including a child's base64 frames, or any other
//! binary payload it chooses to emit) round-trips through a `String`
//! losslessly. Do not default this to UTF-8 — a child emitting non-UTF-8
//! bytes would otherwise corrupt or drop data at the pump.

/// Decoding/encoding strategy for a shell's stdin/stdout/stderr streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Charset {
    /// Identity byte<->char mapping. Lossless for arbitrary bytes. Default.
    #[default]
    Latin1,
    /// Lossy UTF-8 decoding, for children known to speak UTF-8 and where
    /// human-readable logs matter more than byte-perfect round-tripping.
    Utf8Lossy,
}

impl Charset {
    /// Decode a byte slice into a `String` according to this charset.
    pub fn decode(self, bytes: &[u8]) -> String {
        match self {
            Charset::Latin1 => bytes.iter().map(|&b| b as char).collect(),
            Charset::Utf8Lossy => String::from_utf8_lossy(bytes).into_owned(),
        }
    }

    /// Encode a `String` back into bytes according to this charset.
    ///
    /// For `Latin1`, any char outside `U+0000..=U+00FF` (which should not
    /// occur in text that itself came from `decode`) is replaced with `?`.
    pub fn encode(self, s: &str) -> Vec<u8> {
        match self {
            Charset::Latin1 => s
                .chars()
                .map(|c| if (c as u32) <= 0xFF { c as u8 } else { b'?' })
                .collect(),
            Charset::Utf8Lossy => s.as_bytes().to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latin1_round_trips_arbitrary_bytes() {
        let bytes: Vec<u8> = (0..=255u8).collect();
        let decoded = Charset::Latin1.decode(&bytes);
        assert_eq!(decoded.chars().count(), 256);
        let encoded = Charset::Latin1.encode(&decoded);
        assert_eq!(encoded, bytes);
    }

    #[test]
    fn latin1_preserves_high_bytes_invalid_as_utf8() {
        // 0xFF 0xFE is not valid UTF-8, but is two valid Latin-1 codepoints.
        let bytes = [0xFFu8, 0xFE];
        let decoded = Charset::Latin1.decode(&bytes);
        assert_eq!(decoded.chars().count(), 2);
        assert_eq!(Charset::Latin1.encode(&decoded), bytes);
    }

    #[test]
    fn utf8_lossy_decodes_valid_utf8() {
        let bytes = "hello \u{1F525}".as_bytes();
        assert_eq!(Charset::Utf8Lossy.decode(bytes), "hello \u{1F525}");
    }

    #[test]
    fn utf8_lossy_replaces_invalid_sequences() {
        let bytes = [b'a', 0xFF, b'b'];
        let decoded = Charset::Utf8Lossy.decode(&bytes);
        assert!(decoded.contains('a') && decoded.contains('b'));
    }

    #[test]
    fn default_is_latin1() {
        assert_eq!(Charset::default(), Charset::Latin1);
    }
}
