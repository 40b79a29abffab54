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

//! Address translation between the file and in-memory views of an image.
//!
//! A PE image has two coordinate systems: file offsets (where bytes sit on
//! disk) and RVAs (where the loader maps them relative to the image base).
//! [`SectionMap`] performs the conversion in both directions from the section
//! table, treating every out-of-range address as an explicit error rather
//! than clamping.

use crate::{Error, Result};

/// The placement of one section in both coordinate systems.
#[derive(Debug, Clone)]
pub struct SectionSpan {
    /// Section name, for diagnostics.
    pub name: String,
    /// RVA where the section is mapped.
    pub virtual_address: u32,
    /// Size of the mapped section in memory.
    pub virtual_size: u32,
    /// File offset of the section's raw data.
    pub file_offset: u32,
    /// Size of the raw data on disk, file-alignment padded.
    pub raw_size: u32,
}

impl SectionSpan {
    /// Extent of the section in memory. Falls back to the raw size for the
    /// occasional image whose `virtual_size` field is zero.
    fn virtual_extent(&self) -> u32 {
        if self.virtual_size != 0 {
            self.virtual_size
        } else {
            self.raw_size
        }
    }
}

/// Bidirectional RVA ⇄ file-offset translator built from the section table.
///
/// Addresses inside a section's loader-zeroed virtual tail (mapped in memory
/// but absent on disk) have no file representation and translate to
/// [`crate::Error::UnmappedRva`]; so do addresses outside every section. The
/// header region before the first section is not covered either — headers are
/// identity mapped by the loader and never looked up through here.
pub struct SectionMap {
    /// Spans ordered by virtual address.
    spans: Vec<SectionSpan>,
}

impl SectionMap {
    /// Build a map from section spans, in any order.
    #[must_use]
    pub fn from_spans(mut spans: Vec<SectionSpan>) -> Self {
        spans.sort_by_key(|span| span.virtual_address);
        SectionMap { spans }
    }

    /// The spans, ordered by virtual address.
    #[must_use]
    pub fn spans(&self) -> &[SectionSpan] {
        &self.spans
    }

    /// The span containing `rva`, if any.
    #[must_use]
    pub fn span_of_rva(&self, rva: u32) -> Option<&SectionSpan> {
        self.spans.iter().find(|span| {
            rva >= span.virtual_address
                && u64::from(rva) < u64::from(span.virtual_address) + u64::from(span.virtual_extent())
        })
    }

    /// Translate an RVA to the file offset holding its bytes.
    ///
    /// # Errors
    /// Returns [`crate::Error::UnmappedRva`] if `rva` lies outside every
    /// section or inside a section's zero-filled virtual tail.
    pub fn rva_to_offset(&self, rva: u32) -> Result<u64> {
        let Some(span) = self.span_of_rva(rva) else {
            return Err(Error::UnmappedRva(rva));
        };

        let delta = rva - span.virtual_address;
        if delta >= span.raw_size {
            // Mapped in memory, zeroed by the loader, not present on disk.
            return Err(Error::UnmappedRva(rva));
        }
        Ok(u64::from(span.file_offset) + u64::from(delta))
    }

    /// Translate a file offset back to the RVA it will be mapped at.
    ///
    /// # Errors
    /// Returns [`crate::Error::UnmappedOffset`] if `offset` falls outside
    /// every section's raw data range.
    pub fn offset_to_rva(&self, offset: u64) -> Result<u32> {
        for span in &self.spans {
            let start = u64::from(span.file_offset);
            let end = start + u64::from(span.raw_size);
            if offset >= start && offset < end {
                return Ok(span.virtual_address + (offset - start) as u32);
            }
        }
        Err(Error::UnmappedOffset(offset))
    }
}
