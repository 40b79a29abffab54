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

//! The COR20 (CLR) header: the 72-byte structure the CLR data directory
//! points at.
//!
//! The builder side emits it as a patchable segment — the metadata root and
//! resource directory RVAs inside it are deferred references resolved during
//! the layout engine's patch pass. The reader side parses the same structure
//! back.
//!
//! # Reference
//! - [ECMA-335 II.25.3.3](https://ecma-international.org/wp-content/uploads/ECMA-335_6th_edition_june_2012.pdf)

use crate::{
    file::parser::Parser,
    layout::{Patch, Reference, SegmentArena, SegmentId, SegmentKind},
    metadata::token::Token,
    pe::headers::DataDirectory,
    Result,
};

/// Serialized size of the COR20 header.
pub const COR20_HEADER_SIZE: u32 = 72;

bitflags::bitflags! {
    /// COR20 runtime flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Cor20Flags: u32 {
        /// The image contains only IL code.
        const IL_ONLY = 0x0000_0001;
        /// The image requires a 32-bit process.
        const REQUIRES_32BIT = 0x0000_0002;
        /// The image is strong-name signed.
        const STRONG_NAME_SIGNED = 0x0000_0008;
        /// The entry point field holds a native RVA, not a token.
        const NATIVE_ENTRY_POINT = 0x0000_0010;
        /// The runtime should track debug data.
        const TRACK_DEBUG_DATA = 0x0001_0000;
    }
}

fn read_directory(parser: &mut Parser<'_>) -> Result<DataDirectory> {
    Ok(DataDirectory {
        rva: parser.read_le::<u32>()?,
        size: parser.read_le::<u32>()?,
    })
}

/// The parsed COR20 header.
#[derive(Debug, Clone)]
pub struct Cor20Header {
    /// Header size, 72 for well-formed images.
    pub cb: u32,
    /// Minimum runtime major version.
    pub major_runtime_version: u16,
    /// Minimum runtime minor version.
    pub minor_runtime_version: u16,
    /// Location of the metadata root.
    pub metadata: DataDirectory,
    /// Runtime flags.
    pub flags: Cor20Flags,
    /// Managed entry point token, or a native RVA when
    /// [`Cor20Flags::NATIVE_ENTRY_POINT`] is set.
    pub entry_point_token_or_rva: u32,
    /// Embedded managed resources directory.
    pub resources: DataDirectory,
    /// Strong-name signature blob.
    pub strong_name_signature: DataDirectory,
    /// Code manager table, always absent.
    pub code_manager_table: DataDirectory,
    /// VTable fixup directory for mixed-mode images.
    pub vtable_fixups: DataDirectory,
    /// Export address table jumps, always absent.
    pub export_address_table_jumps: DataDirectory,
    /// Managed native header for precompiled images.
    pub managed_native_header: DataDirectory,
}

impl Cor20Header {
    /// Parse a COR20 header at the parser's position.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if `cb` is smaller than the fixed
    /// layout and [`crate::Error::OutOfBounds`] on truncation.
    pub fn read(parser: &mut Parser<'_>) -> Result<Cor20Header> {
        let cb = parser.read_le::<u32>()?;
        if cb < COR20_HEADER_SIZE {
            return Err(malformed_error!("COR20 header size {} is too small", cb));
        }

        Ok(Cor20Header {
            cb,
            major_runtime_version: parser.read_le::<u16>()?,
            minor_runtime_version: parser.read_le::<u16>()?,
            metadata: read_directory(parser)?,
            flags: Cor20Flags::from_bits_retain(parser.read_le::<u32>()?),
            entry_point_token_or_rva: parser.read_le::<u32>()?,
            resources: read_directory(parser)?,
            strong_name_signature: read_directory(parser)?,
            code_manager_table: read_directory(parser)?,
            vtable_fixups: read_directory(parser)?,
            export_address_table_jumps: read_directory(parser)?,
            managed_native_header: read_directory(parser)?,
        })
    }

    /// The managed entry point token, unless the image declares a native
    /// entry point.
    #[must_use]
    pub fn entry_point_token(&self) -> Option<Token> {
        if self.flags.contains(Cor20Flags::NATIVE_ENTRY_POINT) {
            None
        } else {
            Some(Token::new(self.entry_point_token_or_rva))
        }
    }
}

/// Builder for the COR20 header segment.
pub struct Cor20HeaderBuilder {
    /// Runtime flags to emit.
    pub flags: Cor20Flags,
    /// Managed entry point token; null for libraries.
    pub entry_point_token: Token,
    metadata: (SegmentId, u32),
    resources: Option<(SegmentId, u32)>,
    strong_name: Option<(SegmentId, u32)>,
}

impl Cor20HeaderBuilder {
    /// Create a builder pointing at the metadata root segment of `size`
    /// bytes.
    #[must_use]
    pub fn new(metadata: SegmentId, metadata_size: u32) -> Self {
        Cor20HeaderBuilder {
            flags: Cor20Flags::IL_ONLY,
            entry_point_token: Token::new(0),
            metadata: (metadata, metadata_size),
            resources: None,
            strong_name: None,
        }
    }

    /// Point the resources directory at a manifest-resource segment.
    pub fn set_resources(&mut self, segment: SegmentId, size: u32) {
        self.resources = Some((segment, size));
    }

    /// Reserve the strong-name directory against a caller-supplied signature
    /// placeholder segment. Hashing and signing happen outside this crate.
    pub fn set_strong_name(&mut self, segment: SegmentId, size: u32) {
        self.strong_name = Some((segment, size));
        self.flags |= Cor20Flags::STRONG_NAME_SIGNED;
    }

    /// Serialize the header into a patchable segment.
    ///
    /// # Errors
    /// Propagates phase violations.
    pub fn build(self, arena: &mut SegmentArena) -> Result<SegmentId> {
        let mut data = vec![0u8; COR20_HEADER_SIZE as usize];
        let mut patches = Vec::new();

        data[0..4].copy_from_slice(&COR20_HEADER_SIZE.to_le_bytes());
        data[4..6].copy_from_slice(&2u16.to_le_bytes());
        data[6..8].copy_from_slice(&5u16.to_le_bytes());

        patches.push(Patch {
            at: 8,
            reference: Reference::rva(self.metadata.0),
        });
        data[12..16].copy_from_slice(&self.metadata.1.to_le_bytes());

        data[16..20].copy_from_slice(&self.flags.bits().to_le_bytes());
        data[20..24].copy_from_slice(&self.entry_point_token.value().to_le_bytes());

        if let Some((segment, size)) = self.resources {
            patches.push(Patch {
                at: 24,
                reference: Reference::rva(segment),
            });
            data[28..32].copy_from_slice(&size.to_le_bytes());
        }
        if let Some((segment, size)) = self.strong_name {
            patches.push(Patch {
                at: 32,
                reference: Reference::rva(segment),
            });
            data[36..40].copy_from_slice(&size.to_le_bytes());
        }
        // Code manager, vtable fixups, EAT jumps and the managed native
        // header stay zero.

        arena.add_aligned(SegmentKind::Patchable { data, patches }, 4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::writer::Writer;

    #[test]
    fn build_and_read_back() {
        let mut arena = SegmentArena::new();
        let root = arena.add_composite().unwrap();
        let metadata = arena.add(SegmentKind::Raw(vec![0; 0x100])).unwrap();
        let resources = arena.add(SegmentKind::Raw(vec![0; 0x20])).unwrap();

        let mut builder = Cor20HeaderBuilder::new(metadata, 0x100);
        builder.entry_point_token = Token::new(0x0600_0001);
        builder.set_resources(resources, 0x20);
        let header = builder.build(&mut arena).unwrap();

        arena.push_child(root, resources).unwrap();
        arena.push_child(root, metadata).unwrap();
        arena.push_child(root, header).unwrap();
        arena.update_offsets(root, 0x200, 0x2000).unwrap();
        arena.resolve_references(0x40_0000).unwrap();

        let mut writer = Writer::new();
        arena.write(root, &mut writer).unwrap();
        let bytes = writer.into_bytes();

        let header_offset = arena.file_offset(header).unwrap() as usize;
        let mut parser = Parser::new(&bytes[header_offset..]);
        let parsed = Cor20Header::read(&mut parser).unwrap();

        assert_eq!(parsed.cb, COR20_HEADER_SIZE);
        assert_eq!(parsed.major_runtime_version, 2);
        assert_eq!(parsed.minor_runtime_version, 5);
        assert_eq!(parsed.metadata.rva, arena.rva(metadata).unwrap());
        assert_eq!(parsed.metadata.size, 0x100);
        assert_eq!(parsed.resources.rva, arena.rva(resources).unwrap());
        assert_eq!(parsed.resources.size, 0x20);
        assert_eq!(parsed.entry_point_token().unwrap().value(), 0x0600_0001);
        assert!(parsed.flags.contains(Cor20Flags::IL_ONLY));
        assert!(parsed.strong_name_signature.rva == 0);
    }

    #[test]
    fn truncated_header_rejected() {
        let bytes = [0x10, 0x00, 0x00, 0x00];
        assert!(Cor20Header::read(&mut Parser::new(&bytes)).is_err());
    }
}
