//! Ordered queue of chunks waiting to be read
//!
//! The aggregate length is maintained on every mutation, so it always equals
//! the sum of the unit sizes of the queued chunks (one per chunk in object
//! mode, bytes or characters otherwise).

use crate::chunk::Chunk;
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;

#[derive(Debug, Default)]
pub(crate) struct BufferList {
    chunks: VecDeque<Chunk>,
    length: usize,
    object_mode: bool,
}

impl BufferList {
    pub(crate) fn new(object_mode: bool) -> Self {
        Self {
            chunks: VecDeque::new(),
            length: 0,
            object_mode,
        }
    }

    fn unit_len(&self, chunk: &Chunk) -> usize {
        if self.object_mode { 1 } else { chunk.len() }
    }

    /// Aggregate length in units
    pub(crate) fn length(&self) -> usize {
        self.length
    }

    /// Number of queued chunks
    pub(crate) fn count(&self) -> usize {
        self.chunks.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub(crate) fn push(&mut self, chunk: Chunk) {
        self.length += self.unit_len(&chunk);
        self.chunks.push_back(chunk);
    }

    pub(crate) fn unshift(&mut self, chunk: Chunk) {
        self.length += self.unit_len(&chunk);
        self.chunks.push_front(chunk);
    }

    pub(crate) fn shift(&mut self) -> Option<Chunk> {
        let chunk = self.chunks.pop_front()?;
        self.length -= self.unit_len(&chunk);
        Some(chunk)
    }

    pub(crate) fn first(&self) -> Option<&Chunk> {
        self.chunks.front()
    }

    pub(crate) fn clear(&mut self) {
        self.chunks.clear();
        self.length = 0;
    }

    /// Remove every chunk, returning them in order
    pub(crate) fn drain(&mut self) -> Vec<Chunk> {
        self.length = 0;
        self.chunks.drain(..).collect()
    }

    /// Remove everything as a single chunk
    pub(crate) fn take_all(&mut self) -> Option<Chunk> {
        match self.chunks.len() {
            0 => None,
            1 => self.shift(),
            _ => {
                let joined = if self.chunks.iter().all(|c| matches!(c, Chunk::Text(_))) {
                    Chunk::Text(self.join())
                } else {
                    Chunk::Bytes(self.concat())
                };
                self.clear();
                Some(joined)
            }
        }
    }

    /// Concatenate all byte payloads without consuming them
    fn concat(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.length);
        for chunk in &self.chunks {
            out.extend_from_slice(&chunk.to_bytes());
        }
        out.freeze()
    }

    /// Concatenate all text payloads without consuming them
    fn join(&self) -> String {
        let mut out = String::with_capacity(self.length);
        for chunk in &self.chunks {
            if let Chunk::Text(s) = chunk {
                out.push_str(s);
            }
        }
        out
    }

    /// Consume `n` units from the front, splitting a chunk if needed
    pub(crate) fn consume(&mut self, n: usize, has_strings: bool) -> Option<Chunk> {
        let first_len = self.unit_len(self.chunks.front()?);
        if n < first_len {
            // Slice the first chunk in place
            let head = match self.chunks.front_mut()? {
                Chunk::Bytes(b) => Some(Chunk::Bytes(b.split_to(n))),
                Chunk::Text(s) => {
                    let at = s.char_indices().nth(n).map(|(i, _)| i).unwrap_or(s.len());
                    let rest = s.split_off(at);
                    Some(Chunk::Text(std::mem::replace(s, rest)))
                }
                Chunk::Object(_) => None,
            };
            if let Some(head) = head {
                self.length -= n;
                return Some(head);
            }
        }
        if n <= first_len {
            return self.shift();
        }
        if has_strings {
            Some(Chunk::Text(self.take_text(n)))
        } else {
            Some(Chunk::Bytes(self.take_bytes(n)))
        }
    }

    fn take_text(&mut self, n: usize) -> String {
        let mut out = String::new();
        let mut remaining = n;
        while remaining > 0 {
            let Some(chunk) = self.chunks.pop_front() else { break };
            let text = match chunk {
                Chunk::Text(s) => s,
                other => String::from_utf8_lossy(&other.to_bytes()).into_owned(),
            };
            let len = text.chars().count();
            if len <= remaining {
                out.push_str(&text);
                remaining -= len;
                self.length -= len;
            } else {
                let at = text.char_indices().nth(remaining).map(|(i, _)| i).unwrap_or(text.len());
                out.push_str(&text[..at]);
                let rest = text[at..].to_string();
                self.length -= remaining;
                remaining = 0;
                self.chunks.push_front(Chunk::Text(rest));
            }
        }
        out
    }

    fn take_bytes(&mut self, n: usize) -> Bytes {
        let mut out = BytesMut::with_capacity(n);
        let mut remaining = n;
        while remaining > 0 {
            let Some(chunk) = self.chunks.pop_front() else { break };
            let mut bytes = chunk.to_bytes();
            if bytes.len() <= remaining {
                remaining -= bytes.len();
                self.length -= bytes.len();
                out.extend_from_slice(&bytes);
            } else {
                out.extend_from_slice(&bytes.split_to(remaining));
                self.length -= remaining;
                remaining = 0;
                self.chunks.push_front(Chunk::Bytes(bytes));
            }
        }
        out.freeze()
    }
}
