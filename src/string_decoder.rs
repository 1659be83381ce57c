//! Incremental string decoding for readables with an encoding set
//!
//! Decodes byte chunks into text in a manner that preserves multi-byte
//! UTF-8 and UTF-16 characters split across chunk boundaries.

use crate::encoding::Encoding;
use base64::{Engine, engine::general_purpose};

/// Decoder state carried by a readable after `set_encoding`
#[derive(Clone, Debug)]
pub struct StringDecoder {
    encoding: Encoding,
    /// Buffer for incomplete multi-byte sequences
    pending: Vec<u8>,
    /// For UTF-16: whether we have a pending first byte
    utf16_pending: Option<u8>,
}

impl StringDecoder {
    pub fn new(encoding: Encoding) -> Self {
        Self {
            encoding,
            pending: Vec::new(),
            utf16_pending: None,
        }
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Write bytes and return decoded string, keeping incomplete sequences buffered
    pub fn write(&mut self, bytes: &[u8]) -> String {
        match self.encoding {
            Encoding::Utf8 | Encoding::Buffer => self.write_utf8(bytes),
            Encoding::Utf16Le => self.write_utf16le(bytes),
            Encoding::Base64 => self.write_base64(bytes),
            Encoding::Latin1 => bytes.iter().map(|&b| b as char).collect(),
            Encoding::Ascii => bytes.iter().map(|&b| (b & 0x7F) as char).collect(),
            Encoding::Hex => hex::encode(bytes),
        }
    }

    /// End decoding, flushing whatever is still buffered
    pub fn end(&mut self) -> String {
        let mut result = String::new();

        if !self.pending.is_empty() || self.utf16_pending.is_some() {
            match self.encoding {
                Encoding::Base64 => {
                    result.push_str(&general_purpose::STANDARD.encode(&self.pending));
                }
                // Incomplete UTF-8 / UTF-16 becomes a replacement character
                _ => result.push('\u{FFFD}'),
            }
            self.pending.clear();
            self.utf16_pending = None;
        }

        result
    }

    fn write_utf8(&mut self, bytes: &[u8]) -> String {
        let mut result = String::new();

        let mut all_bytes: Vec<u8> = self.pending.drain(..).collect();
        all_bytes.extend_from_slice(bytes);

        let mut i = 0;
        while i < all_bytes.len() {
            let b = all_bytes[i];

            // Expected length of this UTF-8 sequence
            let seq_len = if b < 0x80 {
                1
            } else if b < 0xC0 {
                // Stray continuation byte
                result.push('\u{FFFD}');
                i += 1;
                continue;
            } else if b < 0xE0 {
                2
            } else if b < 0xF0 {
                3
            } else if b < 0xF8 {
                4
            } else {
                result.push('\u{FFFD}');
                i += 1;
                continue;
            };

            if i + seq_len > all_bytes.len() {
                self.pending = all_bytes[i..].to_vec();
                break;
            }

            match std::str::from_utf8(&all_bytes[i..i + seq_len]) {
                Ok(s) => result.push_str(s),
                Err(_) => result.push('\u{FFFD}'),
            }

            i += seq_len;
        }

        result
    }

    fn write_utf16le(&mut self, bytes: &[u8]) -> String {
        let mut result = String::new();

        let mut all_bytes: Vec<u8> = self.pending.drain(..).collect();
        if let Some(b) = self.utf16_pending.take() {
            all_bytes.push(b);
        }
        all_bytes.extend_from_slice(bytes);

        let mut i = 0;
        while i + 1 < all_bytes.len() {
            let code_unit = u16::from_le_bytes([all_bytes[i], all_bytes[i + 1]]);

            if (0xD800..=0xDBFF).contains(&code_unit) {
                if i + 3 < all_bytes.len() {
                    let code_unit2 = u16::from_le_bytes([all_bytes[i + 2], all_bytes[i + 3]]);
                    if (0xDC00..=0xDFFF).contains(&code_unit2) {
                        let code_point = 0x10000
                            + ((code_unit as u32 - 0xD800) << 10)
                            + (code_unit2 as u32 - 0xDC00);
                        result.push(char::from_u32(code_point).unwrap_or('\u{FFFD}'));
                        i += 4;
                        continue;
                    }
                } else {
                    // Wait for the low surrogate
                    self.pending = all_bytes[i..].to_vec();
                    return result;
                }
            }

            result.push(char::from_u32(code_unit as u32).unwrap_or('\u{FFFD}'));
            i += 2;
        }

        if i < all_bytes.len() {
            self.utf16_pending = Some(all_bytes[i]);
        }

        result
    }

    fn write_base64(&mut self, bytes: &[u8]) -> String {
        let mut all_bytes: Vec<u8> = self.pending.drain(..).collect();
        all_bytes.extend_from_slice(bytes);

        // Base64 works in groups of 3 bytes -> 4 chars
        let complete_len = (all_bytes.len() / 3) * 3;
        self.pending = all_bytes.split_off(complete_len);
        general_purpose::STANDARD.encode(&all_bytes)
    }
}
