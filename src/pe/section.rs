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

//! The section table and its layout state machine.
//!
//! Sections move through three states, each a distinct type so that misuse is
//! unrepresentable at the call site:
//!
//! 1. [`SectionTableBuilder`] — sections are registered with a name, flags and
//!    a content segment. Nothing has an address yet.
//! 2. [`LaidOutSectionTable`] — [`SectionTableBuilder::assign_offsets`] has
//!    walked the sections in order, placed each content segment and fixed
//!    every file offset and RVA.
//! 3. [`SectionTable`] — [`LaidOutSectionTable::resolve`] has patched all
//!    deferred references; headers can be written and addresses translated.
//!
//! Each transition consumes the previous state, so offsets cannot be assigned
//! twice and headers cannot be emitted before references resolve.

use crate::{
    file::{parser::Parser, writer::Writer},
    layout::{align_up, SegmentArena, SegmentId},
    pe::translator::{SectionMap, SectionSpan},
    Result,
};

bitflags::bitflags! {
    /// Section characteristics flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SectionFlags: u32 {
        /// The section contains executable code.
        const CNT_CODE = 0x0000_0020;
        /// The section contains initialized data.
        const CNT_INITIALIZED_DATA = 0x0000_0040;
        /// The section contains uninitialized data.
        const CNT_UNINITIALIZED_DATA = 0x0000_0080;
        /// The section can be discarded after load.
        const MEM_DISCARDABLE = 0x0200_0000;
        /// The section can be executed.
        const MEM_EXECUTE = 0x2000_0000;
        /// The section can be read.
        const MEM_READ = 0x4000_0000;
        /// The section can be written to.
        const MEM_WRITE = 0x8000_0000;
    }
}

/// One 40-byte entry of the section table.
#[derive(Debug, Clone)]
pub struct SectionHeader {
    /// Section name, at most 8 bytes of UTF-8.
    pub name: String,
    /// Size of the section when mapped into memory.
    pub virtual_size: u32,
    /// RVA of the section.
    pub virtual_address: u32,
    /// Size of the raw data on disk, file-alignment padded.
    pub size_of_raw_data: u32,
    /// File offset of the raw data.
    pub pointer_to_raw_data: u32,
    /// Characteristics flags.
    pub characteristics: SectionFlags,
}

impl SectionHeader {
    /// Serialized size of one section header.
    pub const SIZE: u32 = 40;

    /// Read a section header at the parser's position.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] on truncation.
    pub fn read(parser: &mut Parser<'_>) -> Result<SectionHeader> {
        let name_bytes = parser.read_bytes(8)?;
        let name_len = name_bytes.iter().position(|&b| b == 0).unwrap_or(8);
        let name = String::from_utf8_lossy(&name_bytes[..name_len]).into_owned();

        let virtual_size = parser.read_le::<u32>()?;
        let virtual_address = parser.read_le::<u32>()?;
        let size_of_raw_data = parser.read_le::<u32>()?;
        let pointer_to_raw_data = parser.read_le::<u32>()?;
        // Deprecated relocation and line-number fields.
        parser.advance_by(12)?;
        let characteristics = SectionFlags::from_bits_retain(parser.read_le::<u32>()?);

        Ok(SectionHeader {
            name,
            virtual_size,
            virtual_address,
            size_of_raw_data,
            pointer_to_raw_data,
            characteristics,
        })
    }

    /// Write the header at the writer's position.
    pub fn write(&self, writer: &mut Writer) {
        let mut name = [0u8; 8];
        let bytes = self.name.as_bytes();
        let len = bytes.len().min(8);
        name[..len].copy_from_slice(&bytes[..len]);
        writer.write_bytes(&name);

        writer.write_le(self.virtual_size);
        writer.write_le(self.virtual_address);
        writer.write_le(self.size_of_raw_data);
        writer.write_le(self.pointer_to_raw_data);
        writer.write_zeros(12);
        writer.write_le(self.characteristics.bits());
    }

    /// The translator span for this section.
    #[must_use]
    pub fn span(&self) -> SectionSpan {
        SectionSpan {
            name: self.name.clone(),
            virtual_address: self.virtual_address,
            virtual_size: self.virtual_size,
            file_offset: self.pointer_to_raw_data,
            raw_size: self.size_of_raw_data,
        }
    }
}

struct PendingSection {
    name: String,
    flags: SectionFlags,
    content: SegmentId,
}

/// The collecting state: sections registered, no addresses assigned.
pub struct SectionTableBuilder {
    sections: Vec<PendingSection>,
    section_alignment: u32,
    file_alignment: u32,
}

impl SectionTableBuilder {
    /// Create a builder with the image's two alignment granularities.
    #[must_use]
    pub fn new(section_alignment: u32, file_alignment: u32) -> Self {
        debug_assert!(section_alignment.is_power_of_two());
        debug_assert!(file_alignment.is_power_of_two());
        SectionTableBuilder {
            sections: Vec::new(),
            section_alignment,
            file_alignment,
        }
    }

    /// Register a section. Order of registration is the final on-disk and
    /// in-memory order.
    pub fn add_section(&mut self, name: &str, flags: SectionFlags, content: SegmentId) {
        self.sections.push(PendingSection {
            name: name.to_string(),
            flags,
            content,
        });
    }

    /// Number of registered sections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sections.len()
    }

    /// `true` if no sections were registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    /// Walk the sections in order and assign every content segment its file
    /// offset and RVA.
    ///
    /// The first section starts at `size_of_headers` rounded up to the file
    /// alignment on disk and to the section alignment in memory; each
    /// subsequent section continues from the previous one, rounded up again.
    ///
    /// # Errors
    /// Propagates [`crate::Error::LayoutPhase`] if the arena already resolved
    /// its references.
    pub fn assign_offsets(
        self,
        arena: &mut SegmentArena,
        size_of_headers: u32,
    ) -> Result<LaidOutSectionTable> {
        let mut file_cursor = align_up(u64::from(size_of_headers), u64::from(self.file_alignment));
        let mut rva_cursor =
            align_up(u64::from(size_of_headers), u64::from(self.section_alignment)) as u32;

        let mut headers = Vec::with_capacity(self.sections.len());
        for section in self.sections {
            let physical = arena.physical_size(section.content);
            arena.update_offsets(section.content, file_cursor, rva_cursor)?;

            let raw_size = align_up(physical, u64::from(self.file_alignment)) as u32;
            headers.push(SectionHeader {
                name: section.name,
                virtual_size: physical as u32,
                virtual_address: rva_cursor,
                size_of_raw_data: raw_size,
                pointer_to_raw_data: file_cursor as u32,
                characteristics: section.flags,
            });

            file_cursor += u64::from(raw_size);
            rva_cursor = align_up(
                u64::from(rva_cursor) + physical.max(1),
                u64::from(self.section_alignment),
            ) as u32;
        }

        Ok(LaidOutSectionTable {
            headers,
            section_alignment: self.section_alignment,
            next_rva: rva_cursor,
            file_end: file_cursor,
        })
    }
}

/// The placed state: every section has definitive addresses, references are
/// still pending.
pub struct LaidOutSectionTable {
    headers: Vec<SectionHeader>,
    section_alignment: u32,
    next_rva: u32,
    file_end: u64,
}

impl LaidOutSectionTable {
    /// The placed headers, in layout order.
    #[must_use]
    pub fn headers(&self) -> &[SectionHeader] {
        &self.headers
    }

    /// The `SizeOfImage` value: one section alignment past the last section.
    /// When no section exists, one alignment unit covering the headers.
    #[must_use]
    pub fn size_of_image(&self) -> u32 {
        if self.headers.is_empty() {
            self.section_alignment
        } else {
            self.next_rva
        }
    }

    /// File offset one past the last section's raw data.
    #[must_use]
    pub fn file_end(&self) -> u64 {
        self.file_end
    }

    /// Patch all deferred references and freeze into the final table.
    ///
    /// # Errors
    /// Propagates [`crate::Error::UnresolvedReference`] for references to
    /// segments that no section placed.
    pub fn resolve(self, arena: &mut SegmentArena, image_base: u64) -> Result<SectionTable> {
        arena.resolve_references(image_base)?;

        let map = SectionMap::from_spans(self.headers.iter().map(SectionHeader::span).collect());
        Ok(SectionTable {
            headers: self.headers,
            map,
        })
    }
}

/// The final state: addresses fixed, references patched, ready to write.
pub struct SectionTable {
    headers: Vec<SectionHeader>,
    map: SectionMap,
}

impl SectionTable {
    /// The headers, in layout order.
    #[must_use]
    pub fn headers(&self) -> &[SectionHeader] {
        &self.headers
    }

    /// The RVA ⇄ file-offset translator over these sections.
    #[must_use]
    pub fn map(&self) -> &SectionMap {
        &self.map
    }

    /// Write all section headers back to back at the writer's position.
    pub fn write(&self, writer: &mut Writer) {
        for header in &self.headers {
            header.write(writer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::SegmentKind;

    #[test]
    fn header_round_trip() {
        let header = SectionHeader {
            name: ".text".to_string(),
            virtual_size: 0x354,
            virtual_address: 0x2000,
            size_of_raw_data: 0x400,
            pointer_to_raw_data: 0x200,
            characteristics: SectionFlags::CNT_CODE
                | SectionFlags::MEM_EXECUTE
                | SectionFlags::MEM_READ,
        };

        let mut writer = Writer::new();
        header.write(&mut writer);
        assert_eq!(writer.len() as u32, SectionHeader::SIZE);

        let bytes = writer.into_bytes();
        let read = SectionHeader::read(&mut Parser::new(&bytes)).unwrap();
        assert_eq!(read.name, ".text");
        assert_eq!(read.virtual_address, 0x2000);
        assert_eq!(read.size_of_raw_data, 0x400);
        assert!(read.characteristics.contains(SectionFlags::CNT_CODE));
    }

    #[test]
    fn layout_walks_sections_in_order() {
        let mut arena = SegmentArena::new();
        let text = arena.add(SegmentKind::Raw(vec![0x90; 0x354])).unwrap();
        let rsrc = arena.add(SegmentKind::Raw(vec![0x11; 0x80])).unwrap();

        let mut builder = SectionTableBuilder::new(0x2000, 0x200);
        builder.add_section(
            ".text",
            SectionFlags::CNT_CODE | SectionFlags::MEM_EXECUTE | SectionFlags::MEM_READ,
            text,
        );
        builder.add_section(
            ".rsrc",
            SectionFlags::CNT_INITIALIZED_DATA | SectionFlags::MEM_READ,
            rsrc,
        );

        let laid_out = builder.assign_offsets(&mut arena, 0x200).unwrap();
        let headers = laid_out.headers();

        assert_eq!(headers[0].pointer_to_raw_data, 0x200);
        assert_eq!(headers[0].virtual_address, 0x2000);
        assert_eq!(headers[0].size_of_raw_data, 0x400);
        assert_eq!(headers[1].pointer_to_raw_data, 0x600);
        assert_eq!(headers[1].virtual_address, 0x4000);
        assert_eq!(laid_out.size_of_image(), 0x6000);
        assert_eq!(laid_out.file_end(), 0x800);

        // The content segments got the same addresses the headers claim.
        assert_eq!(arena.file_offset(text).unwrap(), 0x200);
        assert_eq!(arena.rva(rsrc).unwrap(), 0x4000);
    }

    #[test]
    fn resolve_builds_translator() {
        let mut arena = SegmentArena::new();
        let text = arena.add(SegmentKind::Raw(vec![0; 0x100])).unwrap();

        let mut builder = SectionTableBuilder::new(0x2000, 0x200);
        builder.add_section(".text", SectionFlags::CNT_CODE, text);

        let table = builder
            .assign_offsets(&mut arena, 0x200)
            .unwrap()
            .resolve(&mut arena, 0x40_0000)
            .unwrap();

        assert_eq!(table.map().rva_to_offset(0x2010).unwrap(), 0x210);
    }

    #[test]
    fn long_names_truncate_to_eight_bytes() {
        let header = SectionHeader {
            name: ".verylongname".to_string(),
            virtual_size: 0,
            virtual_address: 0,
            size_of_raw_data: 0,
            pointer_to_raw_data: 0,
            characteristics: SectionFlags::empty(),
        };
        let mut writer = Writer::new();
        header.write(&mut writer);
        let bytes = writer.into_bytes();
        let read = SectionHeader::read(&mut Parser::new(&bytes)).unwrap();
        assert_eq!(read.name, ".verylon");
    }
}
