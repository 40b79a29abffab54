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

//! Base relocation directory builder.
//!
//! Relocations are grouped into blocks of one 4KB page each: an 8-byte block
//! header (page RVA, block size) followed by 2-byte entries packing a type
//! nibble and a 12-bit offset within the page. Blocks with an odd entry
//! count are padded with an `IMAGE_REL_BASED_ABSOLUTE` no-op entry to keep
//! 4-byte block alignment.
//!
//! Page assignment happens before any address exists: a relocation names its
//! containing section's content root plus the target's cascade offset within
//! it, so the 12-bit page offsets are fixed at build time and only the page
//! RVA cell of each block header is deferred. This requires the section
//! alignment to be a multiple of the 4KB page size, which the builder's
//! defaults guarantee.

use crate::{
    layout::{Patch, Reference, SegmentArena, SegmentId, SegmentKind},
    Error, Result,
};

/// No-op relocation used as block padding.
pub const IMAGE_REL_BASED_ABSOLUTE: u16 = 0;
/// 32-bit relocation applied to the full width of the cell.
pub const IMAGE_REL_BASED_HIGHLOW: u16 = 3;
/// 64-bit relocation.
pub const IMAGE_REL_BASED_DIR64: u16 = 10;

const PAGE_SIZE: u64 = 0x1000;

struct RelocEntry {
    section: SegmentId,
    offset: u64,
    kind: u16,
}

/// Collects base relocations, then serializes the `.reloc` content.
pub struct RelocDirectoryBuffer {
    entries: Vec<RelocEntry>,
}

/// The serialized relocation directory.
pub struct BuiltRelocDirectory {
    /// Composite of all relocation blocks: target of data directory 5.
    pub root: SegmentId,
    /// Total directory size in bytes.
    pub size: u32,
}

impl RelocDirectoryBuffer {
    /// An empty buffer.
    #[must_use]
    pub fn new() -> Self {
        RelocDirectoryBuffer {
            entries: Vec::new(),
        }
    }

    /// Add a relocation of `kind` at `target + delta`, where `target` lives
    /// inside the section content rooted at `section`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Error`] if `target` is not a descendant of
    /// `section`.
    pub fn add(
        &mut self,
        arena: &SegmentArena,
        section: SegmentId,
        target: SegmentId,
        delta: u64,
        kind: u16,
    ) -> Result<()> {
        let Some(offset) = arena.offset_within(section, target) else {
            return Err(Error::Error(format!(
                "Relocation target #{} is not contained in section segment #{}",
                target.index(),
                section.index()
            )));
        };
        self.entries.push(RelocEntry {
            section,
            offset: offset + delta,
            kind,
        });
        Ok(())
    }

    /// `true` if no relocations were added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialize the blocks into segments.
    ///
    /// # Errors
    /// Propagates phase violations.
    pub fn build(mut self, arena: &mut SegmentArena) -> Result<BuiltRelocDirectory> {
        let root = arena.add_aligned(SegmentKind::Composite(Vec::new()), 4)?;

        self.entries
            .sort_by_key(|entry| (entry.section.index(), entry.offset));

        let mut size = 0u32;
        let mut index = 0;
        while index < self.entries.len() {
            let section = self.entries[index].section;
            let page = self.entries[index].offset / PAGE_SIZE * PAGE_SIZE;

            let mut block_entries: Vec<u16> = Vec::new();
            while index < self.entries.len()
                && self.entries[index].section == section
                && self.entries[index].offset / PAGE_SIZE * PAGE_SIZE == page
            {
                let entry = &self.entries[index];
                let offset_in_page = (entry.offset - page) as u16;
                block_entries.push((entry.kind << 12) | offset_in_page);
                index += 1;
            }
            if block_entries.len() % 2 != 0 {
                block_entries.push(IMAGE_REL_BASED_ABSOLUTE << 12);
            }

            let block_size = 8 + block_entries.len() as u32 * 2;
            let mut data = vec![0u8; block_size as usize];
            data[4..8].copy_from_slice(&block_size.to_le_bytes());
            for (position, packed) in block_entries.iter().enumerate() {
                let at = 8 + position * 2;
                data[at..at + 2].copy_from_slice(&packed.to_le_bytes());
            }

            let block = arena.add_aligned(
                SegmentKind::Patchable {
                    data,
                    patches: vec![Patch {
                        at: 0,
                        reference: Reference::rva_offset(section, page as i64),
                    }],
                },
                4,
            )?;
            arena.push_child(root, block)?;
            size += block_size;
        }

        Ok(BuiltRelocDirectory { root, size })
    }
}

impl Default for RelocDirectoryBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::writer::Writer;

    #[test]
    fn single_highlow_block() {
        let mut arena = SegmentArena::new();
        let text = arena.add_composite().unwrap();
        let filler = arena.add(SegmentKind::Raw(vec![0; 0x10])).unwrap();
        let stub = arena.add(SegmentKind::Raw(vec![0xFF, 0x25, 0, 0, 0, 0])).unwrap();
        arena.push_child(text, filler).unwrap();
        arena.push_child(text, stub).unwrap();

        let mut buffer = RelocDirectoryBuffer::new();
        buffer
            .add(&arena, text, stub, 2, IMAGE_REL_BASED_HIGHLOW)
            .unwrap();

        let built = buffer.build(&mut arena).unwrap();
        // 8-byte header + 1 entry + 1 absolute pad.
        assert_eq!(built.size, 12);

        let image = arena.add_composite().unwrap();
        arena.push_child(image, text).unwrap();
        arena.push_child(image, built.root).unwrap();
        arena.update_offsets(image, 0x200, 0x2000).unwrap();
        arena.resolve_references(0x40_0000).unwrap();

        let mut writer = Writer::new();
        arena.write(image, &mut writer).unwrap();
        let bytes = writer.into_bytes();

        let block = arena.file_offset(built.root).unwrap() as usize;
        let page_rva = u32::from_le_bytes(bytes[block..block + 4].try_into().unwrap());
        assert_eq!(page_rva, 0x2000);
        let block_size = u32::from_le_bytes(bytes[block + 4..block + 8].try_into().unwrap());
        assert_eq!(block_size, 12);

        let entry = u16::from_le_bytes(bytes[block + 8..block + 10].try_into().unwrap());
        assert_eq!(entry >> 12, IMAGE_REL_BASED_HIGHLOW);
        assert_eq!(entry & 0xFFF, 0x12); // filler + stub offset 2

        let pad = u16::from_le_bytes(bytes[block + 10..block + 12].try_into().unwrap());
        assert_eq!(pad >> 12, IMAGE_REL_BASED_ABSOLUTE);
    }

    #[test]
    fn entries_split_across_pages() {
        let mut arena = SegmentArena::new();
        let text = arena.add_composite().unwrap();
        let big = arena.add(SegmentKind::Raw(vec![0; 0x1800])).unwrap();
        arena.push_child(text, big).unwrap();

        let mut buffer = RelocDirectoryBuffer::new();
        buffer
            .add(&arena, text, big, 0x10, IMAGE_REL_BASED_HIGHLOW)
            .unwrap();
        buffer
            .add(&arena, text, big, 0x1400, IMAGE_REL_BASED_HIGHLOW)
            .unwrap();

        let built = buffer.build(&mut arena).unwrap();
        // Two blocks, each with one entry plus padding.
        assert_eq!(built.size, 24);
    }

    #[test]
    fn foreign_target_rejected() {
        let mut arena = SegmentArena::new();
        let text = arena.add_composite().unwrap();
        let stray = arena.add(SegmentKind::Raw(vec![0; 4])).unwrap();

        let mut buffer = RelocDirectoryBuffer::new();
        assert!(buffer
            .add(&arena, text, stray, 0, IMAGE_REL_BASED_HIGHLOW)
            .is_err());
    }

    #[test]
    fn empty_buffer_builds_empty_directory() {
        let mut arena = SegmentArena::new();
        let built = RelocDirectoryBuffer::new().build(&mut arena).unwrap();
        assert_eq!(built.size, 0);
        assert_eq!(arena.physical_size(built.root), 0);
    }
}
