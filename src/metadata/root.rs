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

//! The metadata root: the `BSJB` header, stream directory and stream layout.
//!
//! On the builder side, [`MetadataBuilder`] owns the four heap buffers and
//! the tables-stream buffer, and [`MetadataBuilder::build`] performs the
//! ordered build protocol: freeze heap sizes, run the tables measure pass,
//! emit rows against the frozen widths, then lay the five streams out behind
//! the root header with 4-byte padding and record each one's offset and size
//! in the stream directory. RVA-valued table columns surface as layout
//! patches inside the emitted tables stream.
//!
//! On the reader side, [`MetadataRoot::read`] parses the same header back
//! into stream name/offset/size triples.
//!
//! # Reference
//! - [ECMA-335 II.24.2](https://ecma-international.org/wp-content/uploads/ECMA-335_6th_edition_june_2012.pdf)

use crate::{
    file::parser::Parser,
    layout::{align_up, SegmentArena, SegmentId, SegmentKind},
    metadata::{
        heaps::{BlobHeapBuffer, GuidHeapBuffer, StringsHeapBuffer, UserStringHeapBuffer},
        tables::buffer::TablesStreamBuffer,
    },
    Result,
};

/// The `BSJB` metadata root signature.
pub const METADATA_SIGNATURE: u32 = 0x424A_5342;

const STREAM_NAMES: [&str; 5] = ["#~", "#Strings", "#US", "#GUID", "#Blob"];

fn padded_name_len(name: &str) -> usize {
    align_up(name.len() as u64 + 1, 4) as usize
}

/// Owns all metadata content buffers and assembles the serialized root.
///
/// The heap and table buffers are public: callers populate them directly
/// (every insertion returns a final offset or token), then call
/// [`MetadataBuilder::build`] exactly once.
pub struct MetadataBuilder {
    /// The `#Strings` heap.
    pub strings: StringsHeapBuffer,
    /// The `#US` heap.
    pub user_strings: UserStringHeapBuffer,
    /// The `#GUID` heap.
    pub guids: GuidHeapBuffer,
    /// The `#Blob` heap.
    pub blobs: BlobHeapBuffer,
    /// The `#~` tables stream.
    pub tables: TablesStreamBuffer,
    version: String,
}

impl MetadataBuilder {
    /// Create a builder emitting `version` as the runtime version string
    /// (for example `"v4.0.30319"`).
    #[must_use]
    pub fn new(version: &str) -> Self {
        MetadataBuilder {
            strings: StringsHeapBuffer::new(),
            user_strings: UserStringHeapBuffer::new(),
            guids: GuidHeapBuffer::new(),
            blobs: BlobHeapBuffer::new(),
            tables: TablesStreamBuffer::new(),
            version: version.to_string(),
        }
    }

    /// Assemble the root header and the five streams into a segment tree and
    /// return the root segment.
    ///
    /// Heap sizes and row counts are frozen here; the tables stream is
    /// emitted against the frozen snapshot and its RVA-column patches are
    /// carried into the returned segment for the layout engine to resolve.
    ///
    /// # Errors
    /// Propagates serialization failures and phase violations.
    pub fn build(self, arena: &mut SegmentArena) -> Result<SegmentId> {
        let sizes = self.tables.measure(
            self.strings.size(),
            self.guids.count(),
            self.blobs.size(),
        );
        let (tables_bytes, patches) = self.tables.emit(&sizes)?;

        let stream_bodies = [
            tables_bytes,
            self.strings.into_bytes(),
            self.user_strings.into_bytes(),
            self.guids.into_bytes(),
            self.blobs.into_bytes(),
        ];
        let mut streams: Vec<(&str, Vec<u8>)> =
            STREAM_NAMES.into_iter().zip(stream_bodies).collect();
        for (_, data) in &mut streams {
            while data.len() % 4 != 0 {
                data.push(0);
            }
        }

        // Root header: fixed fields, padded version, flags, stream count,
        // then the stream directory.
        let version_len = align_up(self.version.len() as u64 + 1, 4) as usize;
        let directory_len: usize = streams
            .iter()
            .map(|(name, _)| 8 + padded_name_len(name))
            .sum();
        let header_len = 16 + version_len + 4 + directory_len;

        let mut header = Vec::with_capacity(header_len);
        header.extend_from_slice(&METADATA_SIGNATURE.to_le_bytes());
        header.extend_from_slice(&1u16.to_le_bytes());
        header.extend_from_slice(&1u16.to_le_bytes());
        header.extend_from_slice(&0u32.to_le_bytes());
        header.extend_from_slice(&(version_len as u32).to_le_bytes());
        header.extend_from_slice(self.version.as_bytes());
        header.resize(16 + version_len, 0);
        header.extend_from_slice(&0u16.to_le_bytes());
        header.extend_from_slice(&(streams.len() as u16).to_le_bytes());

        let mut offset = header_len as u32;
        for (name, data) in &streams {
            header.extend_from_slice(&offset.to_le_bytes());
            header.extend_from_slice(&(data.len() as u32).to_le_bytes());
            let mut name_bytes = name.as_bytes().to_vec();
            name_bytes.resize(padded_name_len(name), 0);
            header.extend_from_slice(&name_bytes);
            offset += data.len() as u32;
        }
        debug_assert_eq!(header.len(), header_len);

        let root = arena.add_aligned(SegmentKind::Composite(Vec::new()), 4)?;
        let header_segment = arena.add(SegmentKind::Raw(header))?;
        arena.push_child(root, header_segment)?;
        for (name, data) in streams {
            let segment = if name == "#~" {
                arena.add(SegmentKind::Patchable {
                    data,
                    patches: patches.clone(),
                })?
            } else {
                arena.add(SegmentKind::Raw(data))?
            };
            arena.push_child(root, segment)?;
        }

        Ok(root)
    }
}

/// One entry of the stream directory.
#[derive(Debug, Clone)]
pub struct StreamHeader {
    /// Stream name (`#~`, `#Strings`, ...).
    pub name: String,
    /// Offset of the stream from the start of the metadata root.
    pub offset: u32,
    /// Stream size in bytes.
    pub size: u32,
}

/// The parsed metadata root header.
#[derive(Debug, Clone)]
pub struct MetadataRoot {
    /// The runtime version string, trailing NULs stripped.
    pub version: String,
    /// The stream directory, in file order.
    pub streams: Vec<StreamHeader>,
}

impl MetadataRoot {
    /// Parse a metadata root at the parser's position.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] on a bad signature or directory
    /// and [`crate::Error::OutOfBounds`] on truncation.
    pub fn read(parser: &mut Parser<'_>) -> Result<MetadataRoot> {
        let signature = parser.read_le::<u32>()?;
        if signature != METADATA_SIGNATURE {
            return Err(malformed_error!(
                "Invalid metadata signature - {:#010x}",
                signature
            ));
        }

        parser.advance_by(8)?; // version numbers, reserved
        let version_len = parser.read_le::<u32>()? as usize;
        let version_bytes = parser.read_bytes(version_len)?;
        let nul = version_bytes
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(version_len);
        let version = String::from_utf8_lossy(&version_bytes[..nul]).into_owned();

        parser.advance_by(2)?; // flags
        let stream_count = parser.read_le::<u16>()?;

        let mut streams = Vec::with_capacity(usize::from(stream_count));
        for _ in 0..stream_count {
            let offset = parser.read_le::<u32>()?;
            let size = parser.read_le::<u32>()?;
            let name = parser.read_string_utf8()?.to_string();
            parser.align(4)?;
            streams.push(StreamHeader { name, offset, size });
        }

        Ok(MetadataRoot { version, streams })
    }

    /// The directory entry named `name`, if present.
    #[must_use]
    pub fn stream(&self, name: &str) -> Option<&StreamHeader> {
        self.streams.iter().find(|header| header.name == name)
    }
}
