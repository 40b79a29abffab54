// Copyright 2026 dotforge developers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

//! Growable byte sink for image emission.
//!
//! [`Writer`] is the output counterpart of [`crate::file::parser::Parser`]: a
//! position-tracked sink over an owned `Vec<u8>` with little-endian primitive
//! writes, zero-fill padding and power-of-two alignment. Segments write
//! exactly their physical size through it; padding between children is always
//! explicit.

use crate::file::io::LeBytes;

/// A growable, position-tracked byte sink.
///
/// Writes past the current end grow the buffer with zero fill, so sparse
/// emission (headers first, section data at aligned offsets) needs no manual
/// pre-sizing.
pub struct Writer {
    buffer: Vec<u8>,
    position: usize,
}

impl Writer {
    /// Create an empty writer.
    #[must_use]
    pub fn new() -> Self {
        Writer {
            buffer: Vec::new(),
            position: 0,
        }
    }

    /// Create a writer with `capacity` bytes preallocated.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Writer {
            buffer: Vec::with_capacity(capacity),
            position: 0,
        }
    }

    /// Current write position.
    #[must_use]
    pub fn pos(&self) -> usize {
        self.position
    }

    /// Number of bytes emitted so far (high-water mark).
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// `true` if nothing has been written yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Move the write position, zero-filling if it points past the end.
    pub fn seek(&mut self, pos: usize) {
        if pos > self.buffer.len() {
            self.buffer.resize(pos, 0);
        }
        self.position = pos;
    }

    /// Write raw bytes at the current position.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        let end = self.position + bytes.len();
        if end > self.buffer.len() {
            self.buffer.resize(end, 0);
        }
        self.buffer[self.position..end].copy_from_slice(bytes);
        self.position = end;
    }

    /// Write a little-endian primitive at the current position.
    pub fn write_le<T: LeBytes>(&mut self, value: T) {
        self.write_bytes(value.to_le_bytes().as_ref());
    }

    /// Write `count` zero bytes.
    pub fn write_zeros(&mut self, count: usize) {
        let end = self.position + count;
        if end > self.buffer.len() {
            self.buffer.resize(end, 0);
        } else {
            self.buffer[self.position..end].fill(0);
        }
        self.position = end;
    }

    /// Zero-pad up to the next multiple of `boundary` (a power of two).
    pub fn align_to(&mut self, boundary: usize) {
        debug_assert!(boundary.is_power_of_two());
        let aligned = (self.position + boundary - 1) & !(boundary - 1);
        self.write_zeros(aligned - self.position);
    }

    /// Zero-pad up to the absolute position `pos`. Positions behind the cursor
    /// only move the cursor.
    pub fn pad_to(&mut self, pos: usize) {
        if pos > self.position {
            self.write_zeros(pos - self.position);
        } else {
            self.position = pos;
        }
    }

    /// Consume the writer and return the emitted bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    /// Borrow the emitted bytes.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.buffer
    }
}

impl Default for Writer {
    fn default() -> Self {
        Self::new()
    }
}
