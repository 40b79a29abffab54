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

//! Export directory builder: the 40-byte directory header plus the address,
//! name-pointer and ordinal sub-tables and the shared name string table.
//!
//! Named exports are emitted sorted by name — the loader binary-searches the
//! name pointer table. Unnamed exports occupy an address-table slot
//! addressable only by ordinal.

use crate::{
    layout::{Patch, Reference, SegmentArena, SegmentId, SegmentKind},
    Result,
};

const DIRECTORY_HEADER_SIZE: u32 = 40;

struct Export {
    name: Option<String>,
    target: SegmentId,
}

/// Collects exported symbols, then serializes the directory.
pub struct ExportDirectoryBuffer {
    library_name: String,
    ordinal_base: u32,
    exports: Vec<Export>,
}

/// The serialized export directory, ready for section assembly.
pub struct BuiltExportDirectory {
    /// Composite of the header and all sub-tables.
    pub root: SegmentId,
    /// The directory header: target of data directory 0.
    pub directory: SegmentId,
}

impl ExportDirectoryBuffer {
    /// Create a buffer exporting under `library_name` with the usual ordinal
    /// base of 1.
    #[must_use]
    pub fn new(library_name: &str) -> Self {
        ExportDirectoryBuffer {
            library_name: library_name.to_string(),
            ordinal_base: 1,
            exports: Vec::new(),
        }
    }

    /// Override the ordinal base.
    pub fn set_ordinal_base(&mut self, base: u32) {
        self.ordinal_base = base;
    }

    /// Export the segment `target` under `name`, returning the symbol's
    /// ordinal.
    pub fn add_named(&mut self, name: &str, target: SegmentId) -> u32 {
        self.exports.push(Export {
            name: Some(name.to_string()),
            target,
        });
        self.ordinal_base + self.exports.len() as u32 - 1
    }

    /// Export the segment `target` by ordinal only, returning the ordinal.
    pub fn add_by_ordinal(&mut self, target: SegmentId) -> u32 {
        self.exports.push(Export { name: None, target });
        self.ordinal_base + self.exports.len() as u32 - 1
    }

    /// `true` if nothing was exported.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.exports.is_empty()
    }

    /// Serialize the directory into segments.
    ///
    /// # Errors
    /// Propagates phase violations.
    pub fn build(self, arena: &mut SegmentArena) -> Result<BuiltExportDirectory> {
        let root = arena.add_aligned(SegmentKind::Composite(Vec::new()), 4)?;

        // Name pointer and ordinal tables are ordered by name.
        let mut named: Vec<(usize, &str)> = self
            .exports
            .iter()
            .enumerate()
            .filter_map(|(index, export)| {
                export.name.as_deref().map(|name| (index, name))
            })
            .collect();
        named.sort_by(|a, b| a.1.cmp(b.1));

        let library_name = arena.add(SegmentKind::Ascii(self.library_name.clone()))?;
        let name_segments: Vec<SegmentId> = named
            .iter()
            .map(|(_, name)| arena.add(SegmentKind::Ascii((*name).to_string())))
            .collect::<Result<_>>()?;

        let address_data = vec![0u8; self.exports.len() * 4];
        let mut address_patches = Vec::with_capacity(self.exports.len());
        for (index, export) in self.exports.iter().enumerate() {
            address_patches.push(Patch {
                at: index as u32 * 4,
                reference: Reference::rva(export.target),
            });
        }
        let address_table = arena.add_aligned(
            SegmentKind::Patchable {
                data: address_data,
                patches: address_patches,
            },
            4,
        )?;

        let name_patches = name_segments
            .iter()
            .enumerate()
            .map(|(position, segment)| Patch {
                at: position as u32 * 4,
                reference: Reference::rva(*segment),
            })
            .collect();
        let name_pointer_table = arena.add_aligned(
            SegmentKind::Patchable {
                data: vec![0u8; named.len() * 4],
                patches: name_patches,
            },
            4,
        )?;

        let mut ordinal_data = Vec::with_capacity(named.len() * 2);
        for (index, _) in &named {
            ordinal_data.extend_from_slice(&(*index as u16).to_le_bytes());
        }
        let ordinal_table = arena.add_aligned(SegmentKind::Raw(ordinal_data), 2)?;

        let mut header_data = vec![0u8; DIRECTORY_HEADER_SIZE as usize];
        header_data[16..20].copy_from_slice(&self.ordinal_base.to_le_bytes());
        header_data[20..24].copy_from_slice(&(self.exports.len() as u32).to_le_bytes());
        header_data[24..28].copy_from_slice(&(named.len() as u32).to_le_bytes());
        let header_patches = vec![
            Patch {
                at: 12,
                reference: Reference::rva(library_name),
            },
            Patch {
                at: 28,
                reference: Reference::rva(address_table),
            },
            Patch {
                at: 32,
                reference: Reference::rva(name_pointer_table),
            },
            Patch {
                at: 36,
                reference: Reference::rva(ordinal_table),
            },
        ];
        let directory = arena.add_aligned(
            SegmentKind::Patchable {
                data: header_data,
                patches: header_patches,
            },
            4,
        )?;

        arena.push_child(root, directory)?;
        arena.push_child(root, address_table)?;
        arena.push_child(root, name_pointer_table)?;
        arena.push_child(root, ordinal_table)?;
        arena.push_child(root, library_name)?;
        for segment in name_segments {
            arena.push_child(root, segment)?;
        }

        Ok(BuiltExportDirectory { root, directory })
    }
}
