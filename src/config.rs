//! Stream construction options

use crate::encoding::Encoding;

/// Default buffering threshold in byte mode
pub const DEFAULT_HIGH_WATER_MARK: usize = 16 * 1024;

/// Default buffering threshold in object mode, in items
pub const DEFAULT_OBJECT_HIGH_WATER_MARK: usize = 16;

/// Largest mark `read(n)` may raise a readable's high-water mark to
pub const MAX_HIGH_WATER_MARK: usize = 0x4000_0000;

pub(crate) fn default_high_water_mark(object_mode: bool) -> usize {
    if object_mode {
        DEFAULT_OBJECT_HIGH_WATER_MARK
    } else {
        DEFAULT_HIGH_WATER_MARK
    }
}

/// Configuration for the readable side of a stream
#[derive(Debug, Clone)]
pub struct ReadableOptions {
    /// Buffering threshold; defaults depend on `object_mode`
    pub high_water_mark: Option<usize>,
    /// Carry arbitrary values instead of bytes
    pub object_mode: bool,
    /// Decode byte chunks to text with this encoding
    pub encoding: Option<Encoding>,
    /// Emit `close` after destroy
    pub emit_close: bool,
    /// Destroy the stream after `end`
    pub auto_destroy: bool,
}

impl Default for ReadableOptions {
    fn default() -> Self {
        Self {
            high_water_mark: None,
            object_mode: false,
            encoding: None,
            emit_close: true,
            auto_destroy: true,
        }
    }
}

impl ReadableOptions {
    /// Object-mode options with every other field defaulted
    pub fn object() -> Self {
        Self {
            object_mode: true,
            ..Default::default()
        }
    }

    pub(crate) fn resolved_high_water_mark(&self) -> usize {
        self.high_water_mark
            .unwrap_or_else(|| default_high_water_mark(self.object_mode))
    }
}

/// Configuration for the writable side of a stream
#[derive(Debug, Clone)]
pub struct WritableOptions {
    /// Buffering threshold; defaults depend on `object_mode`
    pub high_water_mark: Option<usize>,
    /// Carry arbitrary values instead of bytes
    pub object_mode: bool,
    /// Convert text chunks to bytes before they reach the sink
    pub decode_strings: bool,
    /// Encoding used for text writes that name none
    pub default_encoding: Encoding,
    /// Emit `close` after destroy
    pub emit_close: bool,
    /// Destroy the stream after `finish`
    pub auto_destroy: bool,
}

impl Default for WritableOptions {
    fn default() -> Self {
        Self {
            high_water_mark: None,
            object_mode: false,
            decode_strings: true,
            default_encoding: Encoding::Utf8,
            emit_close: true,
            auto_destroy: true,
        }
    }
}

impl WritableOptions {
    /// Object-mode options with every other field defaulted
    pub fn object() -> Self {
        Self {
            object_mode: true,
            ..Default::default()
        }
    }

    pub(crate) fn resolved_high_water_mark(&self) -> usize {
        self.high_water_mark
            .unwrap_or_else(|| default_high_water_mark(self.object_mode))
    }
}

/// Configuration for a stream with both sides
#[derive(Debug, Clone)]
pub struct DuplexOptions {
    pub readable: ReadableOptions,
    pub writable: WritableOptions,
    /// Keep the writable side open after the readable side ended
    pub allow_half_open: bool,
}

impl Default for DuplexOptions {
    fn default() -> Self {
        Self {
            readable: ReadableOptions::default(),
            writable: WritableOptions::default(),
            allow_half_open: true,
        }
    }
}

impl DuplexOptions {
    /// Object mode on both sides
    pub fn object() -> Self {
        Self {
            readable: ReadableOptions::object(),
            writable: WritableOptions::object(),
            ..Default::default()
        }
    }

    /// Same high-water mark on both sides
    pub fn with_high_water_mark(mut self, high_water_mark: usize) -> Self {
        self.readable.high_water_mark = Some(high_water_mark);
        self.writable.high_water_mark = Some(high_water_mark);
        self
    }
}

/// Configuration for `pipe`
#[derive(Debug, Clone)]
pub struct PipeOptions {
    /// End the destination when the source ends
    pub end: bool,
}

impl Default for PipeOptions {
    fn default() -> Self {
        Self { end: true }
    }
}

/// Which sides `finished` waits for; unset means "whatever the stream has"
#[derive(Debug, Clone, Default)]
pub struct FinishedOptions {
    pub readable: Option<bool>,
    pub writable: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_marks() {
        assert_eq!(ReadableOptions::default().resolved_high_water_mark(), 16 * 1024);
        assert_eq!(ReadableOptions::object().resolved_high_water_mark(), 16);
        let options = WritableOptions {
            high_water_mark: Some(3),
            ..Default::default()
        };
        assert_eq!(options.resolved_high_water_mark(), 3);
    }

    #[test]
    fn test_duplex_defaults() {
        let options = DuplexOptions::default();
        assert!(options.allow_half_open);
        assert!(options.writable.decode_strings);
        let options = DuplexOptions::object().with_high_water_mark(2);
        assert!(options.readable.object_mode && options.writable.object_mode);
        assert_eq!(options.writable.resolved_high_water_mark(), 2);
    }
}
