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

//! Field initial-value data and embedded manifest resource buffers.
//!
//! Two more pieces of out-of-stream data the metadata tables point into:
//! `FieldRva` rows reference a field's initial value by RVA (patched back
//! after layout, like method bodies), while `ManifestResource` rows store an
//! offset relative to the start of the resources directory, which is known
//! the moment the resource is appended.

use crate::{
    layout::{SegmentArena, SegmentId, SegmentKind},
    Result,
};

/// Collects field initial-value blobs referenced by `FieldRva` rows.
///
/// Each blob is its own segment so the owning row can reference its RVA; the
/// buffer's root composite slots into the section assembly like any other
/// sub-table.
pub struct FieldDataBuffer {
    root: SegmentId,
}

impl FieldDataBuffer {
    /// Create the buffer's composite inside `arena`.
    ///
    /// # Errors
    /// Propagates [`crate::Error::LayoutPhase`] outside the collecting phase.
    pub fn new(arena: &mut SegmentArena) -> Result<Self> {
        Ok(FieldDataBuffer {
            root: arena.add_composite()?,
        })
    }

    /// The composite holding all field data, for section assembly.
    #[must_use]
    pub fn root(&self) -> SegmentId {
        self.root
    }

    /// Append one field's initial value and return the segment its `FieldRva`
    /// row references.
    ///
    /// `alignment` is the field type's required alignment, typically its pack
    /// size.
    ///
    /// # Errors
    /// Propagates phase violations.
    pub fn add(
        &self,
        arena: &mut SegmentArena,
        data: Vec<u8>,
        alignment: u32,
    ) -> Result<SegmentId> {
        let segment = arena.add_aligned(SegmentKind::Raw(data), alignment)?;
        arena.push_child(self.root, segment)?;
        Ok(segment)
    }
}

/// Collects embedded managed resources for the COR20 resources directory.
///
/// Each entry is a 4-byte length prefix followed by the payload, entries
/// aligned to 4 bytes. Offsets are relative to the directory start and final
/// as soon as the entry is added — `ManifestResource` rows can store them
/// directly, no patch-back needed.
pub struct ManifestResourceBuffer {
    data: Vec<u8>,
}

impl ManifestResourceBuffer {
    /// An empty buffer.
    #[must_use]
    pub fn new() -> Self {
        ManifestResourceBuffer { data: Vec::new() }
    }

    /// Append one resource payload and return its directory-relative offset.
    pub fn add(&mut self, payload: &[u8]) -> u32 {
        while self.data.len() % 4 != 0 {
            self.data.push(0);
        }
        let offset = self.data.len() as u32;
        self.data
            .extend_from_slice(&(payload.len() as u32).to_le_bytes());
        self.data.extend_from_slice(payload);
        offset
    }

    /// `true` if no resources were added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Total directory size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    /// Consume the buffer into a segment, or `None` when empty so the caller
    /// can omit the directory entirely instead of wiring a phantom
    /// zero-length child into the cascade.
    ///
    /// # Errors
    /// Propagates phase violations.
    pub fn into_segment(self, arena: &mut SegmentArena) -> Result<Option<SegmentId>> {
        if self.data.is_empty() {
            return Ok(None);
        }
        Ok(Some(arena.add_aligned(SegmentKind::Raw(self.data), 4)?))
    }
}

impl Default for ManifestResourceBuffer {
    fn default() -> Self {
        Self::new()
    }
}
