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

//! Sequential byte cursor for PE and metadata decoding.
//!
//! [`Parser`] is a bounds-checked cursor over a borrowed byte slice. Beyond
//! fixed-width primitives it understands the ECMA-335 compressed integer
//! encodings and the length-prefixed string forms that appear in metadata
//! heaps. A parser can be [`Parser::fork`]ed into an independent cursor over
//! the same backing data for speculative or nested parsing.
//!
//! # Reference
//! - [ECMA-335 II.23.2](https://ecma-international.org/wp-content/uploads/ECMA-335_6th_edition_june_2012.pdf) (compressed integers)

use crate::{
    file::io::{read_le_at, LeBytes},
    metadata::token::Token,
    Error::OutOfBounds,
    Result,
};

/// A bounds-checked cursor over a byte slice.
///
/// Maintains a position that advances with each read; all operations validate
/// remaining length first, so malformed or truncated input surfaces as
/// [`crate::Error::OutOfBounds`] or [`crate::Error::Malformed`] instead of a
/// panic.
pub struct Parser<'a> {
    /// The binary data being parsed
    data: &'a [u8],
    /// Current position within the data buffer
    position: usize,
}

impl<'a> Parser<'a> {
    /// Create a new [`Parser`] over `data`, positioned at the start.
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Parser { data, position: 0 }
    }

    /// Length of the underlying data buffer.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// `true` if the underlying buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Current cursor position.
    #[must_use]
    pub fn pos(&self) -> usize {
        self.position
    }

    /// `true` if at least one more byte can be read.
    #[must_use]
    pub fn has_more_data(&self) -> bool {
        self.position < self.data.len()
    }

    /// An independent cursor over the same backing buffer, positioned at the
    /// fork point.
    ///
    /// Reads through the fork never move this parser, which makes lookahead
    /// over nested structures cheap and side-effect free.
    #[must_use]
    pub fn fork(&self) -> Parser<'a> {
        Parser {
            data: self.data,
            position: self.position,
        }
    }

    /// Move the cursor to `pos`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if `pos` is past the end of the data.
    pub fn seek(&mut self, pos: usize) -> Result<()> {
        if pos > self.data.len() {
            return Err(OutOfBounds);
        }

        self.position = pos;
        Ok(())
    }

    /// Move the cursor forward by `count` bytes.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if this would move past the end.
    pub fn advance_by(&mut self, count: usize) -> Result<()> {
        let Some(target) = self.position.checked_add(count) else {
            return Err(OutOfBounds);
        };
        self.seek(target)
    }

    /// Align the cursor up to the next multiple of `boundary` (a power of two),
    /// relative to the start of the buffer.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the aligned position is past the end.
    pub fn align(&mut self, boundary: usize) -> Result<()> {
        debug_assert!(boundary.is_power_of_two());
        let aligned = (self.position + boundary - 1) & !(boundary - 1);
        self.seek(aligned)
    }

    /// The current byte without advancing.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] at the end of the data.
    pub fn peek_byte(&self) -> Result<u8> {
        match self.data.get(self.position) {
            Some(byte) => Ok(*byte),
            None => Err(OutOfBounds),
        }
    }

    /// Read a little-endian primitive, advancing past it.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if insufficient bytes remain.
    pub fn read_le<T: LeBytes>(&mut self) -> Result<T> {
        read_le_at(self.data, &mut self.position)
    }

    /// Read `count` raw bytes, advancing past them.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if fewer than `count` bytes remain.
    pub fn read_bytes(&mut self, count: usize) -> Result<&'a [u8]> {
        let Some(end) = self.position.checked_add(count) else {
            return Err(OutOfBounds);
        };
        if end > self.data.len() {
            return Err(OutOfBounds);
        }

        let slice = &self.data[self.position..end];
        self.position = end;
        Ok(slice)
    }

    /// Read an ECMA-335 compressed unsigned integer.
    ///
    /// The top bits of the first byte select the width: `0xxxxxxx` is one
    /// byte, `10xxxxxx x` two bytes, `110xxxxx x y z` four bytes.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] on the reserved `111xxxxx` prefix and
    /// [`crate::Error::OutOfBounds`] on truncation.
    pub fn read_compressed_uint(&mut self) -> Result<u32> {
        let first = self.read_le::<u8>()?;

        if first & 0x80 == 0 {
            return Ok(u32::from(first));
        }

        if first & 0xC0 == 0x80 {
            let second = self.read_le::<u8>()?;
            return Ok((u32::from(first & 0x3F) << 8) | u32::from(second));
        }

        if first & 0xE0 == 0xC0 {
            let b2 = self.read_le::<u8>()?;
            let b3 = self.read_le::<u8>()?;
            let b4 = self.read_le::<u8>()?;
            return Ok((u32::from(first & 0x1F) << 24)
                | (u32::from(b2) << 16)
                | (u32::from(b3) << 8)
                | u32::from(b4));
        }

        Err(malformed_error!(
            "Invalid compressed integer prefix - {:#04x}",
            first
        ))
    }

    /// Read an ECMA-335 compressed signed integer.
    ///
    /// The value is stored rotated: sign bit in the least significant position
    /// of the compressed unsigned form.
    ///
    /// # Errors
    /// Returns an error if the underlying compressed unsigned read fails.
    pub fn read_compressed_int(&mut self) -> Result<i32> {
        let start = self.position;
        let raw = self.read_compressed_uint()?;
        let byte_len = self.position - start;

        let value_bits = match byte_len {
            1 => 7,
            2 => 14,
            _ => 29,
        };

        let shifted = raw >> 1;
        if raw & 1 == 0 {
            return Ok(shifted as i32);
        }

        Ok((shifted as i32) - (1 << (value_bits - 1)))
    }

    /// Read a compressed `TypeDefOrRef` token as used in signatures.
    ///
    /// The two low bits of the compressed value select the table
    /// (`TypeDef`/`TypeRef`/`TypeSpec`), the rest is the row index.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] on the reserved table tag.
    pub fn read_compressed_token(&mut self) -> Result<Token> {
        let value = self.read_compressed_uint()?;
        let rid = value >> 2;

        let table = match value & 0x3 {
            0 => 0x02, // TypeDef
            1 => 0x01, // TypeRef
            2 => 0x1B, // TypeSpec
            _ => {
                return Err(malformed_error!(
                    "Invalid compressed token table tag - {}",
                    value & 0x3
                ))
            }
        };

        Ok(Token::from_parts(table, rid))
    }

    /// Read a null-terminated UTF-8 string, advancing past the terminator.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if no terminator exists or the bytes
    /// are not valid UTF-8.
    pub fn read_string_utf8(&mut self) -> Result<&'a str> {
        let remaining = &self.data[self.position..];
        let Some(nul) = remaining.iter().position(|&b| b == 0) else {
            return Err(malformed_error!(
                "Unterminated UTF-8 string at offset {}",
                self.position
            ));
        };

        match std::str::from_utf8(&remaining[..nul]) {
            Ok(result) => {
                self.position += nul + 1;
                Ok(result)
            }
            Err(_) => Err(malformed_error!(
                "Invalid UTF-8 string at offset {}",
                self.position
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_reads() {
        let data = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
        let mut parser = Parser::new(&data);

        assert_eq!(parser.read_le::<u32>().unwrap(), 0x0403_0201);
        parser.seek(6).unwrap();
        assert_eq!(parser.read_le::<u16>().unwrap(), 0x0807);
        assert!(!parser.has_more_data());
    }

    #[test]
    fn fork_is_independent() {
        let data = [0xAA, 0xBB, 0xCC];
        let mut parser = Parser::new(&data);
        parser.advance_by(1).unwrap();

        let mut forked = parser.fork();
        assert_eq!(forked.read_le::<u8>().unwrap(), 0xBB);
        assert_eq!(forked.read_le::<u8>().unwrap(), 0xCC);

        // Original cursor untouched by the fork's reads.
        assert_eq!(parser.pos(), 1);
        assert_eq!(parser.read_le::<u8>().unwrap(), 0xBB);
    }

    #[test]
    fn compressed_uint() {
        let one = [0x03];
        assert_eq!(Parser::new(&one).read_compressed_uint().unwrap(), 3);

        let one_max = [0x7F];
        assert_eq!(Parser::new(&one_max).read_compressed_uint().unwrap(), 0x7F);

        let two = [0x80, 0x80];
        assert_eq!(Parser::new(&two).read_compressed_uint().unwrap(), 0x80);

        let two_max = [0xBF, 0xFF];
        assert_eq!(Parser::new(&two_max).read_compressed_uint().unwrap(), 0x3FFF);

        let four = [0xC0, 0x00, 0x40, 0x00];
        assert_eq!(Parser::new(&four).read_compressed_uint().unwrap(), 0x4000);

        let invalid = [0xFF];
        assert!(Parser::new(&invalid).read_compressed_uint().is_err());
    }

    #[test]
    fn compressed_int() {
        // Examples from ECMA-335 II.23.2
        assert_eq!(Parser::new(&[0x06]).read_compressed_int().unwrap(), 3);
        assert_eq!(Parser::new(&[0x7B]).read_compressed_int().unwrap(), -3);
        assert_eq!(Parser::new(&[0x80, 0x80]).read_compressed_int().unwrap(), 64);
        assert_eq!(Parser::new(&[0x01]).read_compressed_int().unwrap(), -64);
    }

    #[test]
    fn compressed_token() {
        // 0x49 = (18 << 2) | 1 -> TypeRef row 18
        let data = [0x49];
        let token = Parser::new(&data).read_compressed_token().unwrap();
        assert_eq!(token.table(), 0x01);
        assert_eq!(token.rid(), 18);
    }

    #[test]
    fn utf8_string() {
        let data = [b'a', b'b', b'c', 0x00, 0xFF];
        let mut parser = Parser::new(&data);
        assert_eq!(parser.read_string_utf8().unwrap(), "abc");
        assert_eq!(parser.pos(), 4);

        let unterminated = [b'a', b'b'];
        assert!(Parser::new(&unterminated).read_string_utf8().is_err());
    }

    #[test]
    fn align() {
        let data = [0u8; 16];
        let mut parser = Parser::new(&data);
        parser.advance_by(3).unwrap();
        parser.align(4).unwrap();
        assert_eq!(parser.pos(), 4);
        parser.align(4).unwrap();
        assert_eq!(parser.pos(), 4);
    }
}
