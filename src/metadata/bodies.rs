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

//! CIL method body headers and the method-body table buffer.
//!
//! A body is serialized in the **tiny** format (a single header byte) when the
//! code is at most 63 bytes, declares no locals or exception handlers and
//! needs a max-stack of at most 8; otherwise the 12-byte **fat** header is
//! used. Exception handler sections follow fat bodies at 4-byte alignment, in
//! the small clause form when every clause's offsets fit its narrow fields and
//! in the fat clause form otherwise.
//!
//! The contained instruction bytes are opaque to this crate — instruction
//! encoding is the caller's concern.
//!
//! # Reference
//! - [ECMA-335 II.25.4](https://ecma-international.org/wp-content/uploads/ECMA-335_6th_edition_june_2012.pdf)

use crate::{
    file::parser::Parser,
    layout::{SegmentArena, SegmentId, SegmentKind},
    metadata::token::Token,
    Error, Result,
};

const FORMAT_TINY: u8 = 0x2;
const FORMAT_FAT: u8 = 0x3;
const FLAG_MORE_SECTS: u16 = 0x8;
const FLAG_INIT_LOCALS: u16 = 0x10;

const SECTION_EHTABLE: u8 = 0x01;
const SECTION_FAT_FORMAT: u8 = 0x40;
const SECTION_MORE_SECTS: u8 = 0x80;

/// One exception handling clause of a method body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionHandler {
    /// Clause kind: 0 = typed catch, 1 = filter, 2 = finally, 4 = fault.
    pub flags: u32,
    /// Offset of the protected region within the code.
    pub try_offset: u32,
    /// Length of the protected region.
    pub try_length: u32,
    /// Offset of the handler within the code.
    pub handler_offset: u32,
    /// Length of the handler.
    pub handler_length: u32,
    /// Caught type token for typed clauses, filter code offset for filters,
    /// 0 otherwise.
    pub class_token_or_filter_offset: u32,
}

impl ExceptionHandler {
    // Small clauses pack try_offset/handler_offset into u16 and the lengths
    // into u8.
    fn fits_small(&self) -> bool {
        self.try_offset <= 0xFFFF
            && self.try_length <= 0xFF
            && self.handler_offset <= 0xFFFF
            && self.handler_length <= 0xFF
    }
}

/// A method body: instruction bytes plus the header-level properties.
#[derive(Debug, Clone)]
pub struct MethodBody {
    /// The raw CIL instruction stream.
    pub code: Vec<u8>,
    /// Maximum evaluation stack depth.
    pub max_stack: u16,
    /// `StandAloneSig` token describing the local variables, null for none.
    pub local_var_sig_token: Token,
    /// Whether the runtime zero-initializes locals.
    pub init_locals: bool,
    /// Exception handling clauses, in nesting order.
    pub exception_handlers: Vec<ExceptionHandler>,
}

impl MethodBody {
    /// A body with only code: no locals, no handlers, default max-stack 8.
    #[must_use]
    pub fn tiny(code: Vec<u8>) -> Self {
        MethodBody {
            code,
            max_stack: 8,
            local_var_sig_token: Token::new(0),
            init_locals: false,
            exception_handlers: Vec::new(),
        }
    }

    /// `true` if this body serializes in the tiny format.
    #[must_use]
    pub fn is_tiny(&self) -> bool {
        self.code.len() <= 63
            && self.max_stack <= 8
            && self.local_var_sig_token.is_null()
            && self.exception_handlers.is_empty()
    }

    /// Serialize the body, headers included.
    ///
    /// # Errors
    /// Returns [`crate::Error::Error`] if the code exceeds the fat header's
    /// 32-bit size field.
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.is_tiny() {
            let mut data = Vec::with_capacity(1 + self.code.len());
            data.push(((self.code.len() as u8) << 2) | FORMAT_TINY);
            data.extend_from_slice(&self.code);
            return Ok(data);
        }

        let code_size = u32::try_from(self.code.len())
            .map_err(|_| Error::Error("Method body code exceeds 4GiB".to_string()))?;

        let mut flags = u16::from(FORMAT_FAT) | (3 << 12); // header size in dwords
        if self.init_locals {
            flags |= FLAG_INIT_LOCALS;
        }
        if !self.exception_handlers.is_empty() {
            flags |= FLAG_MORE_SECTS;
        }

        let mut data = Vec::with_capacity(12 + self.code.len());
        data.extend_from_slice(&flags.to_le_bytes());
        data.extend_from_slice(&self.max_stack.to_le_bytes());
        data.extend_from_slice(&code_size.to_le_bytes());
        data.extend_from_slice(&self.local_var_sig_token.value().to_le_bytes());
        data.extend_from_slice(&self.code);

        if !self.exception_handlers.is_empty() {
            while data.len() % 4 != 0 {
                data.push(0);
            }
            self.encode_handler_section(&mut data)?;
        }

        Ok(data)
    }

    fn encode_handler_section(&self, data: &mut Vec<u8>) -> Result<()> {
        let handlers = &self.exception_handlers;
        let small_size = handlers.len() * 12 + 4;
        let use_small = small_size <= 0xFF && handlers.iter().all(ExceptionHandler::fits_small);

        if use_small {
            data.push(SECTION_EHTABLE);
            data.push(small_size as u8);
            data.extend_from_slice(&[0, 0]);
            for handler in handlers {
                data.extend_from_slice(&(handler.flags as u16).to_le_bytes());
                data.extend_from_slice(&(handler.try_offset as u16).to_le_bytes());
                data.push(handler.try_length as u8);
                data.extend_from_slice(&(handler.handler_offset as u16).to_le_bytes());
                data.push(handler.handler_length as u8);
                data.extend_from_slice(&handler.class_token_or_filter_offset.to_le_bytes());
            }
            return Ok(());
        }

        let fat_size = handlers.len() * 24 + 4;
        if fat_size > 0x00FF_FFFF {
            return Err(Error::Error(
                "Exception handler section exceeds the 24-bit size field".to_string(),
            ));
        }
        data.push(SECTION_EHTABLE | SECTION_FAT_FORMAT);
        data.push(fat_size as u8);
        data.push((fat_size >> 8) as u8);
        data.push((fat_size >> 16) as u8);
        for handler in handlers {
            data.extend_from_slice(&handler.flags.to_le_bytes());
            data.extend_from_slice(&handler.try_offset.to_le_bytes());
            data.extend_from_slice(&handler.try_length.to_le_bytes());
            data.extend_from_slice(&handler.handler_offset.to_le_bytes());
            data.extend_from_slice(&handler.handler_length.to_le_bytes());
            data.extend_from_slice(&handler.class_token_or_filter_offset.to_le_bytes());
        }
        Ok(())
    }

    /// Decode a body at the parser's position.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] on an unknown format tag or
    /// inconsistent section sizes, [`crate::Error::OutOfBounds`] on
    /// truncation.
    pub fn decode(parser: &mut Parser<'_>) -> Result<MethodBody> {
        let first = parser.read_le::<u8>()?;

        if first & 0x3 == FORMAT_TINY {
            let code = parser.read_bytes(usize::from(first >> 2))?.to_vec();
            return Ok(MethodBody::tiny(code));
        }

        if first & 0x3 != FORMAT_FAT {
            return Err(malformed_error!(
                "Unknown method body format tag - {:#04x}",
                first & 0x3
            ));
        }

        let second = parser.read_le::<u8>()?;
        let flags = u16::from_le_bytes([first, second]);
        let max_stack = parser.read_le::<u16>()?;
        let code_size = parser.read_le::<u32>()?;
        let local_var_sig_token = Token::new(parser.read_le::<u32>()?);
        let code = parser.read_bytes(code_size as usize)?.to_vec();

        let mut exception_handlers = Vec::new();
        if flags & FLAG_MORE_SECTS != 0 {
            parser.align(4)?;
            loop {
                let more = Self::decode_handler_section(parser, &mut exception_handlers)?;
                if !more {
                    break;
                }
            }
        }

        Ok(MethodBody {
            code,
            max_stack,
            local_var_sig_token,
            init_locals: flags & FLAG_INIT_LOCALS != 0,
            exception_handlers,
        })
    }

    fn decode_handler_section(
        parser: &mut Parser<'_>,
        handlers: &mut Vec<ExceptionHandler>,
    ) -> Result<bool> {
        let kind = parser.read_le::<u8>()?;
        if kind & SECTION_EHTABLE == 0 {
            return Err(malformed_error!(
                "Unknown method data section kind - {:#04x}",
                kind
            ));
        }

        if kind & SECTION_FAT_FORMAT != 0 {
            let b0 = parser.read_le::<u8>()?;
            let b1 = parser.read_le::<u8>()?;
            let b2 = parser.read_le::<u8>()?;
            let size = u32::from(b0) | (u32::from(b1) << 8) | (u32::from(b2) << 16);
            if size < 4 || (size - 4) % 24 != 0 {
                return Err(malformed_error!("Invalid fat EH section size - {}", size));
            }
            for _ in 0..(size - 4) / 24 {
                handlers.push(ExceptionHandler {
                    flags: parser.read_le::<u32>()?,
                    try_offset: parser.read_le::<u32>()?,
                    try_length: parser.read_le::<u32>()?,
                    handler_offset: parser.read_le::<u32>()?,
                    handler_length: parser.read_le::<u32>()?,
                    class_token_or_filter_offset: parser.read_le::<u32>()?,
                });
            }
        } else {
            let size = parser.read_le::<u8>()?;
            parser.advance_by(2)?;
            if size < 4 || (size - 4) % 12 != 0 {
                return Err(malformed_error!("Invalid small EH section size - {}", size));
            }
            for _ in 0..(size - 4) / 12 {
                handlers.push(ExceptionHandler {
                    flags: u32::from(parser.read_le::<u16>()?),
                    try_offset: u32::from(parser.read_le::<u16>()?),
                    try_length: u32::from(parser.read_le::<u8>()?),
                    handler_offset: u32::from(parser.read_le::<u16>()?),
                    handler_length: u32::from(parser.read_le::<u8>()?),
                    class_token_or_filter_offset: parser.read_le::<u32>()?,
                });
            }
        }

        Ok(kind & SECTION_MORE_SECTS != 0)
    }
}

/// The method-body table: a composite partitioned into tiny, fat and native
/// sub-lists.
///
/// Tiny bodies pack back to back; fat bodies need 4-byte alignment relative
/// to the table, which the partitioning satisfies without per-body padding
/// waste between tiny neighbors. Native bodies are opaque pre-encoded blobs.
pub struct MethodBodyBuffer {
    root: SegmentId,
    tiny: SegmentId,
    fat: SegmentId,
    native: SegmentId,
}

impl MethodBodyBuffer {
    /// Create the partitioned composite inside `arena`.
    ///
    /// # Errors
    /// Propagates [`crate::Error::LayoutPhase`] outside the collecting phase.
    pub fn new(arena: &mut SegmentArena) -> Result<Self> {
        let root = arena.add_composite()?;
        let tiny = arena.add_composite()?;
        let fat = arena.add_aligned(SegmentKind::Composite(Vec::new()), 4)?;
        let native = arena.add_aligned(SegmentKind::Composite(Vec::new()), 4)?;
        arena.push_child(root, tiny)?;
        arena.push_child(root, fat)?;
        arena.push_child(root, native)?;
        Ok(MethodBodyBuffer {
            root,
            tiny,
            fat,
            native,
        })
    }

    /// The composite holding all bodies, for section assembly.
    #[must_use]
    pub fn root(&self) -> SegmentId {
        self.root
    }

    /// Serialize `body` into the appropriate partition and return its
    /// segment, whose RVA the owning `MethodDef` row references.
    ///
    /// # Errors
    /// Propagates encoding failures and phase violations.
    pub fn add_body(&self, arena: &mut SegmentArena, body: &MethodBody) -> Result<SegmentId> {
        let encoded = body.encode()?;
        let segment = if body.is_tiny() {
            let segment = arena.add(SegmentKind::Raw(encoded))?;
            arena.push_child(self.tiny, segment)?;
            segment
        } else {
            let segment = arena.add_aligned(SegmentKind::Raw(encoded), 4)?;
            arena.push_child(self.fat, segment)?;
            segment
        };
        Ok(segment)
    }

    /// Add a pre-encoded native body blob at the given alignment.
    ///
    /// # Errors
    /// Propagates phase violations.
    pub fn add_native(
        &self,
        arena: &mut SegmentArena,
        data: Vec<u8>,
        alignment: u32,
    ) -> Result<SegmentId> {
        let segment = arena.add_aligned(SegmentKind::Raw(data), alignment)?;
        arena.push_child(self.native, segment)?;
        Ok(segment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ldstr <token>; call <token>; ret
    fn hello_code() -> Vec<u8> {
        vec![
            0x72, 0x01, 0x00, 0x00, 0x70, 0x28, 0x01, 0x00, 0x00, 0x0A, 0x2A,
        ]
    }

    #[test]
    fn tiny_body_encoding() {
        let body = MethodBody::tiny(hello_code());
        assert!(body.is_tiny());

        let encoded = body.encode().unwrap();
        assert_eq!(encoded[0], (11 << 2) | 0x2);
        assert_eq!(encoded.len(), 12);
        assert_eq!(&encoded[1..], hello_code().as_slice());
    }

    #[test]
    fn locals_force_fat() {
        let mut body = MethodBody::tiny(vec![0x2A]);
        body.local_var_sig_token = Token::new(0x1100_0001);
        body.init_locals = true;
        assert!(!body.is_tiny());

        let encoded = body.encode().unwrap();
        assert_eq!(encoded.len(), 13);
        let flags = u16::from_le_bytes([encoded[0], encoded[1]]);
        assert_eq!(flags & 0x3, 0x3);
        assert_ne!(flags & FLAG_INIT_LOCALS, 0);
        assert_eq!(flags >> 12, 3);
    }

    #[test]
    fn long_code_forces_fat() {
        let body = MethodBody::tiny(vec![0x00; 64]);
        assert!(!body.is_tiny());
        assert!(MethodBody::tiny(vec![0x00; 63]).is_tiny());
    }

    #[test]
    fn fat_round_trip_with_handlers() {
        let body = MethodBody {
            code: vec![0x00; 32],
            max_stack: 4,
            local_var_sig_token: Token::new(0x1100_0001),
            init_locals: true,
            exception_handlers: vec![ExceptionHandler {
                flags: 0,
                try_offset: 0,
                try_length: 16,
                handler_offset: 16,
                handler_length: 16,
                class_token_or_filter_offset: 0x0100_0005,
            }],
        };

        let encoded = body.encode().unwrap();
        let decoded = MethodBody::decode(&mut Parser::new(&encoded)).unwrap();

        assert_eq!(decoded.code, body.code);
        assert_eq!(decoded.max_stack, 4);
        assert_eq!(decoded.local_var_sig_token.value(), 0x1100_0001);
        assert!(decoded.init_locals);
        assert_eq!(decoded.exception_handlers, body.exception_handlers);
    }

    #[test]
    fn wide_clause_forces_fat_section() {
        let body = MethodBody {
            code: vec![0x00; 0x400],
            max_stack: 2,
            local_var_sig_token: Token::new(0),
            init_locals: false,
            exception_handlers: vec![ExceptionHandler {
                flags: 2,
                try_offset: 0,
                try_length: 0x300, // exceeds the small form's u8 length
                handler_offset: 0x300,
                handler_length: 0x10,
                class_token_or_filter_offset: 0,
            }],
        };

        let encoded = body.encode().unwrap();
        let section_start = 12 + 0x400;
        assert_eq!(encoded[section_start], SECTION_EHTABLE | SECTION_FAT_FORMAT);

        let decoded = MethodBody::decode(&mut Parser::new(&encoded)).unwrap();
        assert_eq!(decoded.exception_handlers, body.exception_handlers);
    }

    #[test]
    fn tiny_round_trip() {
        let body = MethodBody::tiny(hello_code());
        let encoded = body.encode().unwrap();
        let decoded = MethodBody::decode(&mut Parser::new(&encoded)).unwrap();
        assert_eq!(decoded.code, hello_code());
        assert!(decoded.is_tiny());
    }

    #[test]
    fn buffer_partitions_by_format() {
        let mut arena = SegmentArena::new();
        let buffer = MethodBodyBuffer::new(&mut arena).unwrap();

        let tiny = buffer
            .add_body(&mut arena, &MethodBody::tiny(vec![0x2A]))
            .unwrap();
        let mut fat_body = MethodBody::tiny(vec![0x2A]);
        fat_body.local_var_sig_token = Token::new(0x1100_0001);
        let fat = buffer.add_body(&mut arena, &fat_body).unwrap();

        arena.update_offsets(buffer.root(), 0x200, 0x2000).unwrap();
        // Tiny body first, fat partition 4-byte aligned after the 2-byte
        // tiny partition.
        assert_eq!(arena.rva(tiny).unwrap(), 0x2000);
        assert_eq!(arena.rva(fat).unwrap(), 0x2004);
    }

    #[test]
    fn unknown_format_tag_rejected() {
        // Low bits 0x0 are neither tiny nor fat.
        let data = [0x00, 0x00];
        assert!(MethodBody::decode(&mut Parser::new(&data)).is_err());
    }
}
