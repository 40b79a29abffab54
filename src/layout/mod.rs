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

//! The segment graph: layout units, deferred references and the phase passes.
//!
//! Everything the builder emits is a **segment**: a node in an arena with a
//! measurable physical size, an assigned file offset and RVA, and the ability
//! to write its bytes. Segments form a tree — composites own an ordered list
//! of children whose offsets cascade — and reference each other through
//! [`Reference`]s that are only resolvable once the offset-assignment pass has
//! run.
//!
//! The graph moves through exactly three phases:
//!
//! 1. **Collecting** — nodes are created and wired into composites.
//! 2. **`OffsetsAssigned`** — [`SegmentArena::update_offsets`] has cascaded
//!    file offsets and RVAs through one or more roots. Idempotent; placement
//!    only, byte contents never change here.
//! 3. **`ReferencesResolved`** — [`SegmentArena::resolve_references`] has
//!    patched every deferred reference back into its already-serialized cell.
//!
//! Transitions are one-directional. Mutating children after phase 1 or
//! resolving before phase 2 is a defect in the calling code and fails loudly
//! with [`crate::Error::LayoutPhase`].

use crate::{file::writer::Writer, Error, Result};

/// Round `value` up to the next multiple of `boundary`.
///
/// `boundary` must be a power of two. Idempotent: aligning an already aligned
/// value returns it unchanged.
#[must_use]
pub fn align_up(value: u64, boundary: u64) -> u64 {
    debug_assert!(boundary.is_power_of_two());
    (value + boundary - 1) & !(boundary - 1)
}

/// The phase marker of a [`SegmentArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LayoutPhase {
    /// Nodes may be created and composite child lists mutated.
    Collecting,
    /// Offsets and RVAs have been assigned; the graph shape is frozen.
    OffsetsAssigned,
    /// Deferred references have been patched; the graph is ready to write.
    ReferencesResolved,
}

/// Stable handle to a segment inside a [`SegmentArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SegmentId(pub(crate) u32);

impl SegmentId {
    /// The raw arena index.
    #[must_use]
    pub fn index(self) -> u32 {
        self.0
    }
}

/// Which coordinate a [`Reference`] resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKind {
    /// The target's file offset.
    FileOffset,
    /// The target's relative virtual address.
    Rva,
    /// The target's absolute virtual address (image base + RVA). Used by the
    /// native bootstrap stub, which embeds an absolute pointer into the IAT.
    Va,
}

/// A deferred, non-owning pointer to another segment.
///
/// Resolves to the target's file offset, RVA or VA plus a constant delta, and
/// only after the target has been placed by the offset pass.
#[derive(Debug, Clone, Copy)]
pub struct Reference {
    /// The segment whose address is being referenced.
    pub target: SegmentId,
    /// Constant added to the resolved address.
    pub delta: i64,
    /// Which coordinate system to resolve in.
    pub kind: RefKind,
}

impl Reference {
    /// An RVA reference to `target` with no delta.
    #[must_use]
    pub fn rva(target: SegmentId) -> Self {
        Reference {
            target,
            delta: 0,
            kind: RefKind::Rva,
        }
    }

    /// An RVA reference to `target` plus `delta` bytes.
    #[must_use]
    pub fn rva_offset(target: SegmentId, delta: i64) -> Self {
        Reference {
            target,
            delta,
            kind: RefKind::Rva,
        }
    }

    /// A virtual-address reference to `target` (image base applied at
    /// resolution time).
    #[must_use]
    pub fn va(target: SegmentId) -> Self {
        Reference {
            target,
            delta: 0,
            kind: RefKind::Va,
        }
    }
}

/// A pending in-place rewrite of a 4-byte little-endian cell inside a
/// [`SegmentKind::Patchable`] buffer.
///
/// The cell is serialized with a placeholder during the build phase and
/// receives its final value during reference resolution.
#[derive(Debug, Clone, Copy)]
pub struct Patch {
    /// Byte offset of the cell within the owning buffer.
    pub at: u32,
    /// The reference whose resolved value lands in the cell.
    pub reference: Reference,
}

/// The closed set of segment variants.
///
/// Leaves carry bytes (or compute them from a small value); `Patchable` is a
/// leaf whose buffer contains deferred-reference cells; `Composite` owns an
/// ordered child list whose offsets cascade.
pub enum SegmentKind {
    /// Raw bytes, emitted verbatim.
    Raw(Vec<u8>),
    /// A NUL-terminated UTF-8 string.
    Ascii(String),
    /// UTF-16 code units, emitted little-endian without a terminator.
    Utf16(Vec<u16>),
    /// A run of zero bytes of the given length.
    Zero(u32),
    /// A byte buffer with pending reference patches.
    Patchable {
        /// The serialized bytes, with placeholder cells at each patch site.
        data: Vec<u8>,
        /// The cells to rewrite during reference resolution.
        patches: Vec<Patch>,
    },
    /// An ordered list of child segments laid out back to back, each child
    /// aligned to its own boundary.
    Composite(Vec<SegmentId>),
}

struct SegmentNode {
    kind: SegmentKind,
    alignment: u32,
    file_offset: u64,
    rva: u32,
    placed: bool,
}

/// Arena of all segments of one build operation, plus the phase marker.
///
/// Handles are stable integer indices; composites reference children by
/// handle, so shared non-owning references (the same name segment used from
/// several tables) are just repeated handles.
pub struct SegmentArena {
    nodes: Vec<SegmentNode>,
    phase: LayoutPhase,
}

impl SegmentArena {
    /// An empty arena in the Collecting phase.
    #[must_use]
    pub fn new() -> Self {
        SegmentArena {
            nodes: Vec::new(),
            phase: LayoutPhase::Collecting,
        }
    }

    /// The current phase marker.
    #[must_use]
    pub fn phase(&self) -> LayoutPhase {
        self.phase
    }

    fn require_phase(&self, required: LayoutPhase) -> Result<()> {
        if self.phase == required {
            Ok(())
        } else {
            Err(Error::LayoutPhase {
                required,
                current: self.phase,
            })
        }
    }

    /// Create a segment with 1-byte alignment.
    ///
    /// # Errors
    /// Returns [`crate::Error::LayoutPhase`] outside the Collecting phase.
    pub fn add(&mut self, kind: SegmentKind) -> Result<SegmentId> {
        self.add_aligned(kind, 1)
    }

    /// Create a segment aligned to `alignment` within its parent's cascade.
    ///
    /// # Errors
    /// Returns [`crate::Error::LayoutPhase`] outside the Collecting phase.
    pub fn add_aligned(&mut self, kind: SegmentKind, alignment: u32) -> Result<SegmentId> {
        self.require_phase(LayoutPhase::Collecting)?;
        debug_assert!(alignment.is_power_of_two());

        let id = SegmentId(self.nodes.len() as u32);
        self.nodes.push(SegmentNode {
            kind,
            alignment,
            file_offset: 0,
            rva: 0,
            placed: false,
        });
        Ok(id)
    }

    /// Create an empty composite.
    ///
    /// # Errors
    /// Returns [`crate::Error::LayoutPhase`] outside the Collecting phase.
    pub fn add_composite(&mut self) -> Result<SegmentId> {
        self.add(SegmentKind::Composite(Vec::new()))
    }

    /// Append `child` to `parent`'s child list.
    ///
    /// # Errors
    /// Returns [`crate::Error::LayoutPhase`] outside the Collecting phase, or
    /// [`crate::Error::Error`] if `parent` is not a composite.
    pub fn push_child(&mut self, parent: SegmentId, child: SegmentId) -> Result<()> {
        self.require_phase(LayoutPhase::Collecting)?;
        match &mut self.nodes[parent.0 as usize].kind {
            SegmentKind::Composite(children) => {
                children.push(child);
                Ok(())
            }
            _ => Err(Error::Error(format!(
                "Segment #{} is not a composite",
                parent.0
            ))),
        }
    }

    /// Remove `child` from `parent`'s child list.
    ///
    /// Conditionally omitted sub-segments (an empty embedded-resource table,
    /// say) must be removed from the same list the offset cascade walks,
    /// before the cascade runs.
    ///
    /// # Errors
    /// Returns [`crate::Error::LayoutPhase`] outside the Collecting phase, or
    /// [`crate::Error::Error`] if `parent` is not a composite.
    pub fn remove_child(&mut self, parent: SegmentId, child: SegmentId) -> Result<()> {
        self.require_phase(LayoutPhase::Collecting)?;
        match &mut self.nodes[parent.0 as usize].kind {
            SegmentKind::Composite(children) => {
                children.retain(|c| *c != child);
                Ok(())
            }
            _ => Err(Error::Error(format!(
                "Segment #{} is not a composite",
                parent.0
            ))),
        }
    }

    /// Number of children of a composite, 0 for leaves.
    #[must_use]
    pub fn child_count(&self, id: SegmentId) -> usize {
        match &self.nodes[id.0 as usize].kind {
            SegmentKind::Composite(children) => children.len(),
            _ => 0,
        }
    }

    /// The physical (on-disk) size of a segment in bytes.
    ///
    /// Recomputed on demand; composites cascade their children with per-child
    /// alignment, so the result is exact as long as the composite's own base
    /// ends up at least as aligned as its most demanding child (sections are
    /// file-aligned, which dominates the 4-byte alignments used inside).
    #[must_use]
    pub fn physical_size(&self, id: SegmentId) -> u64 {
        let node = &self.nodes[id.0 as usize];
        match &node.kind {
            SegmentKind::Raw(data) => data.len() as u64,
            SegmentKind::Ascii(text) => text.len() as u64 + 1,
            SegmentKind::Utf16(units) => units.len() as u64 * 2,
            SegmentKind::Zero(len) => u64::from(*len),
            SegmentKind::Patchable { data, .. } => data.len() as u64,
            SegmentKind::Composite(children) => {
                let mut cursor = 0u64;
                for child in children {
                    let alignment = u64::from(self.nodes[child.0 as usize].alignment);
                    cursor = align_up(cursor, alignment);
                    cursor += self.physical_size(*child);
                }
                cursor
            }
        }
    }

    /// The offset of `descendant` relative to `ancestor`'s start, following
    /// the same cascade rules as placement.
    ///
    /// Pure with respect to phase: usable while still collecting, since
    /// relative offsets are a function of sizes and alignments alone. This is
    /// what lets the relocation builder compute page-relative offsets before
    /// any address exists. Returns the first occurrence for shared handles,
    /// `None` if `descendant` is not reachable from `ancestor`.
    #[must_use]
    pub fn offset_within(&self, ancestor: SegmentId, descendant: SegmentId) -> Option<u64> {
        if ancestor == descendant {
            return Some(0);
        }

        let SegmentKind::Composite(children) = &self.nodes[ancestor.0 as usize].kind else {
            return None;
        };

        let mut cursor = 0u64;
        for child in children {
            let alignment = u64::from(self.nodes[child.0 as usize].alignment);
            cursor = align_up(cursor, alignment);
            if let Some(sub) = self.offset_within(*child, descendant) {
                return Some(cursor + sub);
            }
            cursor += self.physical_size(*child);
        }
        None
    }

    /// Assign `root` (and recursively its children) a file offset and RVA.
    ///
    /// Pure with respect to byte contents: only placement changes. Idempotent;
    /// calling again with different bases simply re-places the subtree. The
    /// first call moves the arena out of the Collecting phase.
    ///
    /// # Errors
    /// Returns [`crate::Error::LayoutPhase`] if references were already resolved.
    pub fn update_offsets(&mut self, root: SegmentId, file_offset: u64, rva: u32) -> Result<()> {
        if self.phase == LayoutPhase::ReferencesResolved {
            return Err(Error::LayoutPhase {
                required: LayoutPhase::OffsetsAssigned,
                current: self.phase,
            });
        }
        self.phase = LayoutPhase::OffsetsAssigned;
        self.place(root, file_offset, rva);
        Ok(())
    }

    fn place(&mut self, id: SegmentId, file_offset: u64, rva: u32) {
        {
            let node = &mut self.nodes[id.0 as usize];
            node.file_offset = file_offset;
            node.rva = rva;
            node.placed = true;
        }

        let children = match &self.nodes[id.0 as usize].kind {
            SegmentKind::Composite(children) => children.clone(),
            _ => return,
        };

        let mut cursor = 0u64;
        for child in children {
            let alignment = u64::from(self.nodes[child.0 as usize].alignment);
            cursor = align_up(cursor, alignment);
            self.place(child, file_offset + cursor, rva + cursor as u32);
            cursor += self.physical_size(child);
        }
    }

    /// The assigned file offset of a segment.
    ///
    /// # Errors
    /// Returns [`crate::Error::UnresolvedReference`] if the segment was never placed.
    pub fn file_offset(&self, id: SegmentId) -> Result<u64> {
        let node = &self.nodes[id.0 as usize];
        if !node.placed {
            return Err(Error::UnresolvedReference(id.0));
        }
        Ok(node.file_offset)
    }

    /// The assigned RVA of a segment.
    ///
    /// # Errors
    /// Returns [`crate::Error::UnresolvedReference`] if the segment was never placed.
    pub fn rva(&self, id: SegmentId) -> Result<u32> {
        let node = &self.nodes[id.0 as usize];
        if !node.placed {
            return Err(Error::UnresolvedReference(id.0));
        }
        Ok(node.rva)
    }

    /// Resolve a reference to its numeric value.
    ///
    /// # Errors
    /// Returns [`crate::Error::UnresolvedReference`] if the target was never placed.
    pub fn resolve(&self, reference: &Reference, image_base: u64) -> Result<u64> {
        let node = &self.nodes[reference.target.0 as usize];
        if !node.placed {
            return Err(Error::UnresolvedReference(reference.target.0));
        }

        let base = match reference.kind {
            RefKind::FileOffset => node.file_offset,
            RefKind::Rva => u64::from(node.rva),
            RefKind::Va => image_base + u64::from(node.rva),
        };

        let resolved = base as i64 + reference.delta;
        if resolved < 0 {
            return Err(Error::Error(format!(
                "Reference to segment #{} resolved to a negative address",
                reference.target.0
            )));
        }
        Ok(resolved as u64)
    }

    /// Patch every deferred reference cell in every patchable segment.
    ///
    /// Moves the arena into the `ReferencesResolved` phase.
    ///
    /// # Errors
    /// Returns [`crate::Error::LayoutPhase`] unless offsets were assigned first,
    /// or [`crate::Error::UnresolvedReference`] for a patch whose target was
    /// never placed.
    pub fn resolve_references(&mut self, image_base: u64) -> Result<()> {
        self.require_phase(LayoutPhase::OffsetsAssigned)?;

        let mut resolved: Vec<(usize, u32, u32)> = Vec::new();
        for (index, node) in self.nodes.iter().enumerate() {
            if let SegmentKind::Patchable { patches, .. } = &node.kind {
                for patch in patches {
                    let value = self.resolve(&patch.reference, image_base)?;
                    resolved.push((index, patch.at, value as u32));
                }
            }
        }

        for (index, at, value) in resolved {
            if let SegmentKind::Patchable { data, .. } = &mut self.nodes[index].kind {
                let at = at as usize;
                if at + 4 > data.len() {
                    return Err(Error::OutOfBounds);
                }
                data[at..at + 4].copy_from_slice(&value.to_le_bytes());
            }
        }

        self.phase = LayoutPhase::ReferencesResolved;
        Ok(())
    }

    /// Write a segment tree to the sink at its assigned file offsets.
    ///
    /// Gaps introduced by child alignment come out as explicit zero padding.
    ///
    /// # Errors
    /// Returns [`crate::Error::LayoutPhase`] unless references were resolved first.
    pub fn write(&self, root: SegmentId, writer: &mut Writer) -> Result<()> {
        self.require_phase(LayoutPhase::ReferencesResolved)?;
        self.write_node(root, writer);
        Ok(())
    }

    fn write_node(&self, id: SegmentId, writer: &mut Writer) {
        let node = &self.nodes[id.0 as usize];
        writer.pad_to(node.file_offset as usize);

        match &node.kind {
            SegmentKind::Raw(data) => writer.write_bytes(data),
            SegmentKind::Ascii(text) => {
                writer.write_bytes(text.as_bytes());
                writer.write_le(0u8);
            }
            SegmentKind::Utf16(units) => {
                for unit in units {
                    writer.write_le(*unit);
                }
            }
            SegmentKind::Zero(len) => writer.write_zeros(*len as usize),
            SegmentKind::Patchable { data, .. } => writer.write_bytes(data),
            SegmentKind::Composite(children) => {
                for child in children {
                    self.write_node(*child, writer);
                }
            }
        }
    }
}

impl Default for SegmentArena {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_idempotent() {
        for boundary in [1u64, 2, 4, 0x200, 0x2000] {
            for value in [0u64, 1, 3, 511, 512, 513, 8191] {
                let once = align_up(value, boundary);
                assert_eq!(align_up(once, boundary), once);
                assert!(once >= value);
                assert_eq!(once % boundary, 0);
            }
        }
    }

    #[test]
    fn cascade_with_alignment() {
        let mut arena = SegmentArena::new();
        let root = arena.add_composite().unwrap();
        let a = arena.add(SegmentKind::Raw(vec![0xAA; 3])).unwrap();
        let b = arena
            .add_aligned(SegmentKind::Raw(vec![0xBB; 2]), 4)
            .unwrap();
        arena.push_child(root, a).unwrap();
        arena.push_child(root, b).unwrap();

        assert_eq!(arena.physical_size(root), 6);

        arena.update_offsets(root, 0x200, 0x2000).unwrap();
        assert_eq!(arena.file_offset(a).unwrap(), 0x200);
        assert_eq!(arena.file_offset(b).unwrap(), 0x204);
        assert_eq!(arena.rva(b).unwrap(), 0x2004);
    }

    #[test]
    fn update_offsets_is_idempotent() {
        let mut arena = SegmentArena::new();
        let root = arena.add_composite().unwrap();
        let a = arena.add(SegmentKind::Raw(vec![0; 8])).unwrap();
        arena.push_child(root, a).unwrap();

        arena.update_offsets(root, 0x200, 0x1000).unwrap();
        arena.update_offsets(root, 0x400, 0x3000).unwrap();
        assert_eq!(arena.file_offset(a).unwrap(), 0x400);
        assert_eq!(arena.rva(a).unwrap(), 0x3000);
    }

    #[test]
    fn empty_composite_is_zero_sized() {
        let mut arena = SegmentArena::new();
        let root = arena.add_composite().unwrap();
        assert_eq!(arena.physical_size(root), 0);
    }

    #[test]
    fn patch_back() {
        let mut arena = SegmentArena::new();
        let root = arena.add_composite().unwrap();
        let target = arena.add(SegmentKind::Raw(vec![0xCC; 16])).unwrap();
        let patchable = arena
            .add(SegmentKind::Patchable {
                data: vec![0u8; 8],
                patches: vec![Patch {
                    at: 4,
                    reference: Reference::rva_offset(target, 2),
                }],
            })
            .unwrap();
        arena.push_child(root, target).unwrap();
        arena.push_child(root, patchable).unwrap();

        arena.update_offsets(root, 0x200, 0x1000).unwrap();
        arena.resolve_references(0x40_0000).unwrap();

        let mut writer = Writer::new();
        arena.write(root, &mut writer).unwrap();
        let bytes = writer.into_bytes();
        // Patchable starts at file offset 0x210; its cell at +4 holds rva(target)+2.
        let cell = &bytes[0x214..0x218];
        assert_eq!(cell, &0x1002u32.to_le_bytes());
    }

    #[test]
    fn phase_violations_fail_loudly() {
        let mut arena = SegmentArena::new();
        let root = arena.add_composite().unwrap();
        let a = arena.add(SegmentKind::Raw(vec![1])).unwrap();
        arena.push_child(root, a).unwrap();

        // Resolving before placement is a defect.
        assert!(matches!(
            arena.resolve_references(0),
            Err(Error::LayoutPhase { .. })
        ));

        arena.update_offsets(root, 0, 0).unwrap();

        // Adding a child after offsets were assigned is a defect.
        let late = arena.add(SegmentKind::Raw(vec![2]));
        assert!(matches!(late, Err(Error::LayoutPhase { .. })));

        // Writing before resolution is a defect.
        let mut writer = Writer::new();
        assert!(matches!(
            arena.write(root, &mut writer),
            Err(Error::LayoutPhase { .. })
        ));
    }

    #[test]
    fn offset_within_matches_placement() {
        let mut arena = SegmentArena::new();
        let root = arena.add_composite().unwrap();
        let inner = arena
            .add_aligned(SegmentKind::Composite(Vec::new()), 4)
            .unwrap();
        let a = arena.add(SegmentKind::Raw(vec![0; 5])).unwrap();
        let b = arena.add(SegmentKind::Raw(vec![0; 2])).unwrap();
        arena.push_child(root, a).unwrap();
        arena.push_child(root, inner).unwrap();
        arena.push_child(inner, b).unwrap();

        // Computed while still collecting.
        assert_eq!(arena.offset_within(root, b), Some(8));
        assert_eq!(arena.offset_within(inner, a), None);

        arena.update_offsets(root, 0x200, 0x2000).unwrap();
        assert_eq!(arena.rva(b).unwrap(), 0x2008);
    }

    #[test]
    fn unresolved_target_is_an_error() {
        let mut arena = SegmentArena::new();
        let root = arena.add_composite().unwrap();
        let orphan = arena.add(SegmentKind::Raw(vec![0; 4])).unwrap();
        let patchable = arena
            .add(SegmentKind::Patchable {
                data: vec![0u8; 4],
                patches: vec![Patch {
                    at: 0,
                    reference: Reference::rva(orphan),
                }],
            })
            .unwrap();
        // orphan is deliberately not wired into the tree.
        arena.push_child(root, patchable).unwrap();

        arena.update_offsets(root, 0, 0).unwrap();
        assert!(matches!(
            arena.resolve_references(0),
            Err(Error::UnresolvedReference(_))
        ));
    }
}
