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

//! Builder-side metadata heap buffers.
//!
//! The four heaps (`#Strings`, `#Blob`, `#GUID`, `#US`) accumulate content
//! while table rows still hold logical references; every insertion
//! deduplicates by exact value and returns the final heap offset (or index,
//! for GUIDs) immediately, so row serialization never needs a fixup for heap
//! columns. Heap sizes are frozen when the builder snapshots [`sizes`] for
//! its measure pass — inserting afterward is the caller's defect and shifts
//! nothing retroactively, hence the buffers are consumed into bytes exactly
//! once.
//!
//! # Reference
//! - [ECMA-335 II.24.2.3–II.24.2.6](https://ecma-international.org/wp-content/uploads/ECMA-335_6th_edition_june_2012.pdf)
//!
//! [`sizes`]: crate::metadata::tables::TableSizes::from_heap_sizes

use std::collections::HashMap;

use uguid::Guid;
use widestring::U16String;

use crate::{Error, Result};

/// Append an ECMA-335 compressed unsigned integer to `buffer`.
///
/// # Errors
/// Returns [`crate::Error::Error`] for values above the encodable maximum
/// (`0x1FFF_FFFF`).
pub fn write_compressed_uint(buffer: &mut Vec<u8>, value: u32) -> Result<()> {
    if value <= 0x7F {
        buffer.push(value as u8);
    } else if value <= 0x3FFF {
        buffer.push(0x80 | (value >> 8) as u8);
        buffer.push(value as u8);
    } else if value <= 0x1FFF_FFFF {
        buffer.push(0xC0 | (value >> 24) as u8);
        buffer.push((value >> 16) as u8);
        buffer.push((value >> 8) as u8);
        buffer.push(value as u8);
    } else {
        return Err(Error::Error(format!(
            "Value {value:#x} exceeds the compressed integer range"
        )));
    }
    Ok(())
}

/// The `#Strings` heap: NUL-terminated UTF-8, offset 0 is the empty string.
pub struct StringsHeapBuffer {
    data: Vec<u8>,
    index: HashMap<String, u32>,
}

impl StringsHeapBuffer {
    /// An empty heap containing only the mandatory leading NUL.
    #[must_use]
    pub fn new() -> Self {
        StringsHeapBuffer {
            data: vec![0],
            index: HashMap::new(),
        }
    }

    /// Insert `value` if not present and return its heap offset.
    ///
    /// The empty string is always offset 0.
    ///
    /// # Errors
    /// Returns [`crate::Error::Error`] for strings containing an interior NUL,
    /// which cannot be represented in a NUL-terminated heap.
    pub fn get_or_add(&mut self, value: &str) -> Result<u32> {
        if value.is_empty() {
            return Ok(0);
        }
        if value.as_bytes().contains(&0) {
            return Err(Error::Error(format!(
                "String {value:?} contains an interior NUL"
            )));
        }
        if let Some(offset) = self.index.get(value) {
            return Ok(*offset);
        }

        let offset = self.data.len() as u32;
        self.data.extend_from_slice(value.as_bytes());
        self.data.push(0);
        self.index.insert(value.to_string(), offset);
        Ok(offset)
    }

    /// Current heap size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    /// Consume the buffer into its serialized form.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

impl Default for StringsHeapBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// The `#GUID` heap: 16-byte values addressed by 1-based index.
pub struct GuidHeapBuffer {
    guids: Vec<Guid>,
    index: HashMap<Guid, u32>,
}

impl GuidHeapBuffer {
    /// An empty heap.
    #[must_use]
    pub fn new() -> Self {
        GuidHeapBuffer {
            guids: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Insert `value` if not present and return its 1-based index.
    pub fn get_or_add(&mut self, value: Guid) -> u32 {
        if let Some(index) = self.index.get(&value) {
            return *index;
        }
        self.guids.push(value);
        let index = self.guids.len() as u32;
        self.index.insert(value, index);
        index
    }

    /// Number of GUIDs in the heap.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.guids.len() as u64
    }

    /// Current heap size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.guids.len() as u64 * 16
    }

    /// Consume the buffer into its serialized form.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        let mut data = Vec::with_capacity(self.guids.len() * 16);
        for guid in self.guids {
            data.extend_from_slice(&guid.to_bytes());
        }
        data
    }
}

impl Default for GuidHeapBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// The `#Blob` heap: length-prefixed binary values, offset 0 is the empty
/// blob.
pub struct BlobHeapBuffer {
    data: Vec<u8>,
    index: HashMap<Vec<u8>, u32>,
}

impl BlobHeapBuffer {
    /// An empty heap containing only the mandatory leading zero byte.
    #[must_use]
    pub fn new() -> Self {
        BlobHeapBuffer {
            data: vec![0],
            index: HashMap::new(),
        }
    }

    /// Insert `value` if not present and return its heap offset.
    ///
    /// The empty blob is always offset 0.
    ///
    /// # Errors
    /// Returns [`crate::Error::Error`] if the blob exceeds the compressed
    /// length range.
    pub fn get_or_add(&mut self, value: &[u8]) -> Result<u32> {
        if value.is_empty() {
            return Ok(0);
        }
        if let Some(offset) = self.index.get(value) {
            return Ok(*offset);
        }

        let offset = self.data.len() as u32;
        write_compressed_uint(&mut self.data, value.len() as u32)?;
        self.data.extend_from_slice(value);
        self.index.insert(value.to_vec(), offset);
        Ok(offset)
    }

    /// Current heap size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    /// Consume the buffer into its serialized form.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

impl Default for BlobHeapBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// The `#US` heap: UTF-16 string literals referenced by `ldstr` tokens.
///
/// Each entry is a compressed byte length covering the UTF-16 code units plus
/// one terminal flag byte; the flag is 1 when any unit needs handling beyond
/// plain ASCII comparison.
pub struct UserStringHeapBuffer {
    data: Vec<u8>,
    index: HashMap<String, u32>,
}

impl UserStringHeapBuffer {
    /// An empty heap containing only the mandatory leading zero byte.
    #[must_use]
    pub fn new() -> Self {
        UserStringHeapBuffer {
            data: vec![0],
            index: HashMap::new(),
        }
    }

    /// Insert `value` if not present and return its heap offset, suitable for
    /// embedding in an `ldstr` token (table byte 0x70).
    ///
    /// # Errors
    /// Returns [`crate::Error::Error`] if the encoded string exceeds the
    /// compressed length range.
    pub fn get_or_add(&mut self, value: &str) -> Result<u32> {
        if let Some(offset) = self.index.get(value) {
            return Ok(*offset);
        }

        let units = U16String::from_str(value);
        let offset = self.data.len() as u32;
        let byte_len = units.len() as u32 * 2 + 1;
        write_compressed_uint(&mut self.data, byte_len)?;
        for unit in units.as_slice() {
            self.data.extend_from_slice(&unit.to_le_bytes());
        }
        self.data.push(Self::terminal_byte(units.as_slice()));
        self.index.insert(value.to_string(), offset);
        Ok(offset)
    }

    // ECMA-335 II.24.2.4: 1 if any unit requires more than simple ASCII
    // handling, 0 otherwise.
    fn terminal_byte(units: &[u16]) -> u8 {
        let special = units.iter().any(|&unit| {
            matches!(unit, 0x01..=0x08 | 0x0E..=0x1F | 0x27 | 0x2D | 0x7F) || unit >= 0x80
        });
        u8::from(special)
    }

    /// Current heap size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    /// Consume the buffer into its serialized form.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

impl Default for UserStringHeapBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strings_dedup() {
        let mut heap = StringsHeapBuffer::new();
        let a = heap.get_or_add("Main").unwrap();
        let b = heap.get_or_add("Program").unwrap();
        let c = heap.get_or_add("Main").unwrap();

        assert_eq!(a, 1);
        assert_eq!(b, 6); // "Main\0" is 5 bytes
        assert_eq!(a, c);
        assert_eq!(heap.get_or_add("").unwrap(), 0);

        let bytes = heap.into_bytes();
        assert_eq!(&bytes[..6], b"\0Main\0");
    }

    #[test]
    fn strings_reject_interior_nul() {
        let mut heap = StringsHeapBuffer::new();
        assert!(heap.get_or_add("a\0b").is_err());
    }

    #[test]
    fn guid_indices_are_one_based() {
        let mut heap = GuidHeapBuffer::new();
        let mvid = Guid::from_bytes([7; 16]);
        let other = Guid::from_bytes([9; 16]);

        assert_eq!(heap.get_or_add(mvid), 1);
        assert_eq!(heap.get_or_add(other), 2);
        assert_eq!(heap.get_or_add(mvid), 1);
        assert_eq!(heap.size(), 32);
    }

    #[test]
    fn blob_prefix_and_dedup() {
        let mut heap = BlobHeapBuffer::new();
        let sig = [0x00, 0x01, 0x0E]; // static, 1 arg, string
        let a = heap.get_or_add(&sig).unwrap();
        let b = heap.get_or_add(&sig).unwrap();
        assert_eq!(a, 1);
        assert_eq!(a, b);

        let bytes = heap.into_bytes();
        assert_eq!(bytes, [0x00, 0x03, 0x00, 0x01, 0x0E]);
    }

    #[test]
    fn user_string_encoding() {
        let mut heap = UserStringHeapBuffer::new();
        let offset = heap.get_or_add("Hi").unwrap();
        assert_eq!(offset, 1);

        let bytes = heap.into_bytes();
        // Length 5 (2 units * 2 + flag), "H", "i", ASCII flag 0.
        assert_eq!(bytes, [0x00, 0x05, b'H', 0x00, b'i', 0x00, 0x00]);
    }

    #[test]
    fn user_string_terminal_flag() {
        let mut heap = UserStringHeapBuffer::new();
        heap.get_or_add("é").unwrap();
        let bytes = heap.into_bytes();
        assert_eq!(*bytes.last().unwrap(), 1);
    }

    #[test]
    fn compressed_uint_widths() {
        let mut buffer = Vec::new();
        write_compressed_uint(&mut buffer, 0x7F).unwrap();
        write_compressed_uint(&mut buffer, 0x80).unwrap();
        write_compressed_uint(&mut buffer, 0x4000).unwrap();
        assert_eq!(buffer, [0x7F, 0x80, 0x80, 0xC0, 0x00, 0x40, 0x00]);

        assert!(write_compressed_uint(&mut buffer, 0x2000_0000).is_err());
    }
}
