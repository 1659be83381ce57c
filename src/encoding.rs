//! Encoding names for text chunks
//!
//! Writes may carry text together with an encoding; in byte mode with
//! `decode_strings` enabled the text is converted to bytes before it reaches
//! the sink. Readables use the same names for `set_encoding`.

use crate::error::{StreamError, StreamResult};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64_STANDARD};
use bytes::Bytes;
use std::{fmt, str::FromStr};

/// Supported encodings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    #[default]
    Utf8,
    Utf16Le,
    Latin1,
    Ascii,
    Base64,
    Hex,
    /// The chunk is already bytes
    Buffer,
}

impl FromStr for Encoding {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "utf8" | "utf-8" => Ok(Encoding::Utf8),
            "utf16le" | "utf-16le" | "ucs2" | "ucs-2" => Ok(Encoding::Utf16Le),
            "latin1" | "binary" => Ok(Encoding::Latin1),
            "ascii" => Ok(Encoding::Ascii),
            "base64" => Ok(Encoding::Base64),
            "hex" => Ok(Encoding::Hex),
            "buffer" => Ok(Encoding::Buffer),
            _ => Err(StreamError::UnknownEncoding(s.to_string())),
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Encoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            Encoding::Utf8 => "utf8",
            Encoding::Utf16Le => "utf16le",
            Encoding::Latin1 => "latin1",
            Encoding::Ascii => "ascii",
            Encoding::Base64 => "base64",
            Encoding::Hex => "hex",
            Encoding::Buffer => "buffer",
        }
    }

    /// Encode a string to bytes using this encoding
    pub fn encode(&self, text: &str) -> StreamResult<Bytes> {
        let bytes = match self {
            Encoding::Utf8 | Encoding::Buffer => text.as_bytes().to_vec(),
            Encoding::Latin1 | Encoding::Ascii => {
                text.chars().map(|c| (c as u32 & 0xFF) as u8).collect()
            }
            Encoding::Utf16Le => {
                let mut bytes = Vec::with_capacity(text.len() * 2);
                for unit in text.encode_utf16() {
                    bytes.extend_from_slice(&unit.to_le_bytes());
                }
                bytes
            }
            Encoding::Base64 => {
                BASE64_STANDARD
                    .decode(text.trim())
                    .map_err(|e| StreamError::InvalidEncodedData {
                        encoding: "base64",
                        reason: e.to_string(),
                    })?
            }
            Encoding::Hex => hex_prefix(text.trim()),
        };
        Ok(Bytes::from(bytes))
    }
}

/// Decode the longest valid prefix of a hex string
fn hex_prefix(s: &str) -> Vec<u8> {
    let even = s.len() - s.len() % 2;
    let mut bytes = Vec::with_capacity(even / 2);
    for pair in s.as_bytes()[..even].chunks(2) {
        match hex::decode(pair) {
            Ok(b) => bytes.extend(b),
            // Stop at invalid hex
            Err(_) => break,
        }
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_aliases() {
        assert_eq!("UTF-8".parse::<Encoding>().unwrap(), Encoding::Utf8);
        assert_eq!("ucs2".parse::<Encoding>().unwrap(), Encoding::Utf16Le);
        assert_eq!("binary".parse::<Encoding>().unwrap(), Encoding::Latin1);
        assert!(matches!(
            "klingon".parse::<Encoding>(),
            Err(StreamError::UnknownEncoding(_))
        ));
    }

    #[test]
    fn test_encode() {
        assert_eq!(&Encoding::Utf8.encode("hé").unwrap()[..], "hé".as_bytes());
        assert_eq!(&Encoding::Latin1.encode("hé").unwrap()[..], &[b'h', 0xE9]);
        assert_eq!(&Encoding::Utf16Le.encode("A").unwrap()[..], &[0x41, 0x00]);
        assert_eq!(&Encoding::Hex.encode("0aff").unwrap()[..], &[0x0A, 0xFF]);
        assert_eq!(&Encoding::Hex.encode("0azz11").unwrap()[..], &[0x0A]);
        assert_eq!(&Encoding::Base64.encode("aGk=").unwrap()[..], b"hi");
        assert!(Encoding::Base64.encode("@@@").is_err());
    }
}
