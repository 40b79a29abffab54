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

//! Debug directory builder and reader.
//!
//! The directory is an array of 28-byte entries, each describing one opaque
//! debug data blob (CodeView/PDB records, deterministic markers, ...). The
//! blob contents are a collaborator's concern; this builder wires the RVA
//! and file-offset pointers, which need both coordinate systems and thus one
//! patch of each kind.

use crate::{
    file::parser::Parser,
    layout::{Patch, Reference, RefKind, SegmentArena, SegmentId, SegmentKind},
    Result,
};

/// Serialized size of one debug directory entry.
pub const DEBUG_ENTRY_SIZE: u32 = 28;

/// Debug data type for CodeView records.
pub const DEBUG_TYPE_CODEVIEW: u32 = 2;
/// Debug data type for the deterministic marker (no payload).
pub const DEBUG_TYPE_REPRODUCIBLE: u32 = 16;

/// One parsed debug directory entry.
#[derive(Debug, Clone)]
pub struct DebugEntry {
    /// Reserved characteristics field.
    pub characteristics: u32,
    /// Timestamp of the debug data.
    pub time_date_stamp: u32,
    /// Format major version.
    pub major_version: u16,
    /// Format minor version.
    pub minor_version: u16,
    /// Debug data type.
    pub data_type: u32,
    /// Size of the referenced blob.
    pub size_of_data: u32,
    /// RVA of the blob, 0 if not mapped.
    pub address_of_raw_data: u32,
    /// File offset of the blob.
    pub pointer_to_raw_data: u32,
}

impl DebugEntry {
    /// Read one entry at the parser's position.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] on truncation.
    pub fn read(parser: &mut Parser<'_>) -> Result<DebugEntry> {
        Ok(DebugEntry {
            characteristics: parser.read_le::<u32>()?,
            time_date_stamp: parser.read_le::<u32>()?,
            major_version: parser.read_le::<u16>()?,
            minor_version: parser.read_le::<u16>()?,
            data_type: parser.read_le::<u32>()?,
            size_of_data: parser.read_le::<u32>()?,
            address_of_raw_data: parser.read_le::<u32>()?,
            pointer_to_raw_data: parser.read_le::<u32>()?,
        })
    }
}

struct PendingDebugEntry {
    time_date_stamp: u32,
    data_type: u32,
    blob: Option<SegmentId>,
    blob_size: u32,
}

/// Collects debug entries and their blobs, then serializes the directory.
pub struct DebugDirectoryBuffer {
    entries: Vec<PendingDebugEntry>,
}

/// The serialized debug directory.
pub struct BuiltDebugDirectory {
    /// Composite of the entry table and the blobs.
    pub root: SegmentId,
    /// The entry table: target of data directory 6.
    pub table: SegmentId,
    /// Size of the entry table in bytes.
    pub table_size: u32,
}

impl DebugDirectoryBuffer {
    /// An empty buffer.
    #[must_use]
    pub fn new() -> Self {
        DebugDirectoryBuffer {
            entries: Vec::new(),
        }
    }

    /// Add an entry of `data_type` carrying `data` as its blob.
    ///
    /// # Errors
    /// Propagates phase violations.
    pub fn add_entry(
        &mut self,
        arena: &mut SegmentArena,
        data_type: u32,
        time_date_stamp: u32,
        data: Vec<u8>,
    ) -> Result<()> {
        let blob_size = data.len() as u32;
        let blob = if data.is_empty() {
            None
        } else {
            Some(arena.add_aligned(SegmentKind::Raw(data), 4)?)
        };
        self.entries.push(PendingDebugEntry {
            time_date_stamp,
            data_type,
            blob,
            blob_size,
        });
        Ok(())
    }

    /// `true` if no entries were added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialize the entry table and wire the blobs behind it.
    ///
    /// # Errors
    /// Propagates phase violations.
    pub fn build(self, arena: &mut SegmentArena) -> Result<BuiltDebugDirectory> {
        let root = arena.add_aligned(SegmentKind::Composite(Vec::new()), 4)?;

        let table_size = self.entries.len() as u32 * DEBUG_ENTRY_SIZE;
        let mut data = vec![0u8; table_size as usize];
        let mut patches = Vec::new();

        for (index, entry) in self.entries.iter().enumerate() {
            let base = index * DEBUG_ENTRY_SIZE as usize;
            data[base + 4..base + 8].copy_from_slice(&entry.time_date_stamp.to_le_bytes());
            data[base + 12..base + 16].copy_from_slice(&entry.data_type.to_le_bytes());
            data[base + 16..base + 20].copy_from_slice(&entry.blob_size.to_le_bytes());
            if let Some(blob) = entry.blob {
                patches.push(Patch {
                    at: base as u32 + 20,
                    reference: Reference::rva(blob),
                });
                patches.push(Patch {
                    at: base as u32 + 24,
                    reference: Reference {
                        target: blob,
                        delta: 0,
                        kind: RefKind::FileOffset,
                    },
                });
            }
        }

        let table = arena.add_aligned(SegmentKind::Patchable { data, patches }, 4)?;
        arena.push_child(root, table)?;
        for entry in &self.entries {
            if let Some(blob) = entry.blob {
                arena.push_child(root, blob)?;
            }
        }

        Ok(BuiltDebugDirectory {
            root,
            table,
            table_size,
        })
    }
}

impl Default for DebugDirectoryBuffer {
    fn default() -> Self {
        Self::new()
    }
}
