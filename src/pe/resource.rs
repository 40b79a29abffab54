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

//! Win32 resource directory (`.rsrc`) builder and reader.
//!
//! The directory is a tree, conventionally three levels deep (type, name,
//! language). Serialization is level-grouped the way linkers emit it: all
//! directory tables first in breadth-first order, then the 16-byte data
//! entries, then the UTF-16 name strings, then the data blobs. Every offset
//! inside the table region is relative to the section start with bit 31
//! distinguishing subdirectory entries from data entries; only the data
//! entries' RVA cells need deferred references.
//!
//! Reading is tolerant: malformed entries are routed through the caller's
//! [`ErrorSink`] and skipped, and recursion is bounded so an adversarial
//! self-referencing tree degrades into a reported
//! [`crate::Error::RecursionLimit`] instead of unbounded descent.

use widestring::U16String;

use crate::{
    diagnostics::ErrorSink,
    file::parser::Parser,
    layout::{Patch, Reference, SegmentArena, SegmentId, SegmentKind},
    Error, Result,
};

/// Maximum directory nesting the reader follows.
pub const MAX_RESOURCE_DEPTH: usize = 8;

const SUBDIR_FLAG: u32 = 0x8000_0000;

/// Identifier of a resource directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceId {
    /// A numeric identifier (resource type, ID or language).
    Id(u32),
    /// A UTF-16 name.
    Name(String),
}

/// One leaf resource payload.
#[derive(Debug, Clone)]
pub struct ResourceData {
    /// Code page of the payload, usually 0.
    pub codepage: u32,
    /// The raw payload bytes.
    pub data: Vec<u8>,
}

enum NodeContent {
    Dir(DirNode),
    Data(ResourceData),
}

#[derive(Default)]
struct DirNode {
    entries: Vec<(ResourceId, NodeContent)>,
}

impl DirNode {
    fn child_dir(&mut self, id: &ResourceId) -> Result<&mut DirNode> {
        let position = self.entries.iter().position(|(existing, _)| existing == id);
        let index = match position {
            Some(index) => index,
            None => {
                self.entries
                    .push((id.clone(), NodeContent::Dir(DirNode::default())));
                self.entries.len() - 1
            }
        };
        match &mut self.entries[index].1 {
            NodeContent::Dir(dir) => Ok(dir),
            NodeContent::Data(_) => Err(Error::Error(format!(
                "Resource path component {id:?} already holds data"
            ))),
        }
    }
}

/// Collects a resource tree, then serializes the `.rsrc` content.
pub struct ResourceDirectoryBuffer {
    root: DirNode,
}

/// The serialized resource directory.
pub struct BuiltResourceDirectory {
    /// Composite of the table region and the data blobs: the `.rsrc` section
    /// content.
    pub root: SegmentId,
    /// The table region: target of data directory 2.
    pub table: SegmentId,
    /// Size of the table region in bytes (directories, data entries, names).
    pub table_size: u32,
}

impl ResourceDirectoryBuffer {
    /// An empty tree.
    #[must_use]
    pub fn new() -> Self {
        ResourceDirectoryBuffer {
            root: DirNode::default(),
        }
    }

    /// Insert a payload at `path` (for example `[Id(type), Name(name),
    /// Id(language)]`), creating intermediate directories.
    ///
    /// # Errors
    /// Returns [`crate::Error::Error`] for an empty path, a path through an
    /// existing leaf, or a duplicate leaf.
    pub fn add_data(&mut self, path: &[ResourceId], data: ResourceData) -> Result<()> {
        let Some((leaf, dirs)) = path.split_last() else {
            return Err(Error::Error("Empty resource path".to_string()));
        };

        let mut node = &mut self.root;
        for id in dirs {
            node = node.child_dir(id)?;
        }

        if node.entries.iter().any(|(existing, _)| existing == leaf) {
            return Err(Error::Error(format!(
                "Duplicate resource entry {leaf:?}"
            )));
        }
        node.entries.push((leaf.clone(), NodeContent::Data(data)));
        Ok(())
    }

    /// `true` if no resources were added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.root.entries.is_empty()
    }

    /// Serialize the tree into segments.
    ///
    /// # Errors
    /// Propagates phase violations.
    pub fn build(mut self, arena: &mut SegmentArena) -> Result<BuiltResourceDirectory> {
        sort_entries(&mut self.root);

        // Breadth-first directory list; each element borrows nothing, we walk
        // by index paths instead to keep ownership simple.
        let dirs = collect_dirs(&self.root);

        // Measure: directory table offsets, then data entries, then names.
        let mut dir_offsets = Vec::with_capacity(dirs.len());
        let mut cursor = 0u32;
        for dir in &dirs {
            dir_offsets.push(cursor);
            cursor += 16 + dir.entry_count * 8;
        }

        let data_entries_start = cursor;
        cursor += count_leaves(&self.root) * 16;

        // Entries sharing a name share one name-table string.
        let mut name_offsets: Vec<(String, u32)> = Vec::new();
        for dir in &dirs {
            for name in &dir.names {
                if name_offsets.iter().any(|(existing, _)| existing == name) {
                    continue;
                }
                name_offsets.push((name.clone(), cursor));
                cursor += 2 + name.encode_utf16().count() as u32 * 2;
            }
        }
        let table_size = cursor;

        // Emit.
        let mut data = vec![0u8; table_size as usize];
        let mut patches = Vec::new();
        let root_segment = arena.add_aligned(SegmentKind::Composite(Vec::new()), 4)?;
        let blobs = arena.add_aligned(SegmentKind::Composite(Vec::new()), 4)?;

        emit_tables(
            &self.root,
            &mut data,
            &mut patches,
            &dir_offsets,
            &name_offsets,
            data_entries_start,
            arena,
            blobs,
        )?;

        for (name, offset) in &name_offsets {
            let units = U16String::from_str(name);
            let mut at = *offset as usize;
            data[at..at + 2].copy_from_slice(&(units.len() as u16).to_le_bytes());
            at += 2;
            for unit in units.as_slice() {
                data[at..at + 2].copy_from_slice(&unit.to_le_bytes());
                at += 2;
            }
        }

        let table = arena.add_aligned(SegmentKind::Patchable { data, patches }, 4)?;
        arena.push_child(root_segment, table)?;
        arena.push_child(root_segment, blobs)?;

        Ok(BuiltResourceDirectory {
            root: root_segment,
            table,
            table_size,
        })
    }
}

impl Default for ResourceDirectoryBuffer {
    fn default() -> Self {
        Self::new()
    }
}

// Named entries first sorted by name, then IDs ascending, as the format
// requires; recursively.
fn sort_entries(node: &mut DirNode) {
    node.entries.sort_by(|a, b| match (&a.0, &b.0) {
        (ResourceId::Name(x), ResourceId::Name(y)) => x.cmp(y),
        (ResourceId::Name(_), ResourceId::Id(_)) => std::cmp::Ordering::Less,
        (ResourceId::Id(_), ResourceId::Name(_)) => std::cmp::Ordering::Greater,
        (ResourceId::Id(x), ResourceId::Id(y)) => x.cmp(y),
    });
    for (_, content) in &mut node.entries {
        if let NodeContent::Dir(dir) = content {
            sort_entries(dir);
        }
    }
}

struct DirInfo {
    entry_count: u32,
    names: Vec<String>,
}

fn collect_dirs(root: &DirNode) -> Vec<DirInfo> {
    let mut dirs = Vec::new();
    let mut queue: std::collections::VecDeque<&DirNode> = std::collections::VecDeque::new();
    queue.push_back(root);
    while let Some(node) = queue.pop_front() {
        let names = node
            .entries
            .iter()
            .filter_map(|(id, _)| match id {
                ResourceId::Name(name) => Some(name.clone()),
                ResourceId::Id(_) => None,
            })
            .collect();
        dirs.push(DirInfo {
            entry_count: node.entries.len() as u32,
            names,
        });
        for (_, content) in &node.entries {
            if let NodeContent::Dir(dir) = content {
                queue.push_back(dir);
            }
        }
    }
    dirs
}

fn count_leaves(node: &DirNode) -> u32 {
    node.entries
        .iter()
        .map(|(_, content)| match content {
            NodeContent::Dir(dir) => count_leaves(dir),
            NodeContent::Data(_) => 1,
        })
        .sum()
}

// Emits all directory tables in the same breadth-first order
// `collect_dirs` assigned offsets in, allocating data entries and blob
// segments as leaves are encountered.
#[allow(clippy::too_many_arguments)]
fn emit_tables(
    root: &DirNode,
    data: &mut [u8],
    patches: &mut Vec<Patch>,
    dir_offsets: &[u32],
    name_offsets: &[(String, u32)],
    data_entries_start: u32,
    arena: &mut SegmentArena,
    blobs: SegmentId,
) -> Result<()> {
    let mut queue: std::collections::VecDeque<&DirNode> = std::collections::VecDeque::new();
    queue.push_back(root);

    let mut dir_index = 0;
    let mut next_subdir_slot = 1;
    let mut next_data_entry = data_entries_start;

    while let Some(node) = queue.pop_front() {
        let base = dir_offsets[dir_index] as usize;
        dir_index += 1;

        let named_count = node
            .entries
            .iter()
            .filter(|(id, _)| matches!(id, ResourceId::Name(_)))
            .count() as u16;
        let id_count = node.entries.len() as u16 - named_count;
        data[base + 12..base + 14].copy_from_slice(&named_count.to_le_bytes());
        data[base + 14..base + 16].copy_from_slice(&id_count.to_le_bytes());

        let mut entry_at = base + 16;
        for (id, content) in &node.entries {
            let id_cell: u32 = match id {
                ResourceId::Name(name) => {
                    let offset = name_offsets
                        .iter()
                        .find(|(existing, _)| existing == name)
                        .map(|(_, offset)| *offset)
                        .unwrap_or(0);
                    SUBDIR_FLAG | offset
                }
                ResourceId::Id(value) => *value,
            };
            data[entry_at..entry_at + 4].copy_from_slice(&id_cell.to_le_bytes());

            let content_cell: u32 = match content {
                NodeContent::Dir(dir) => {
                    let offset = dir_offsets[next_subdir_slot];
                    next_subdir_slot += 1;
                    queue.push_back(dir);
                    SUBDIR_FLAG | offset
                }
                NodeContent::Data(payload) => {
                    let entry_offset = next_data_entry;
                    next_data_entry += 16;

                    let blob = arena.add_aligned(SegmentKind::Raw(payload.data.clone()), 4)?;
                    arena.push_child(blobs, blob)?;

                    let at = entry_offset as usize;
                    patches.push(Patch {
                        at: entry_offset,
                        reference: Reference::rva(blob),
                    });
                    data[at + 4..at + 8]
                        .copy_from_slice(&(payload.data.len() as u32).to_le_bytes());
                    data[at + 8..at + 12].copy_from_slice(&payload.codepage.to_le_bytes());
                    entry_offset
                }
            };
            data[entry_at + 4..entry_at + 8].copy_from_slice(&content_cell.to_le_bytes());
            entry_at += 8;
        }
    }
    Ok(())
}

/// A parsed resource tree node.
#[derive(Debug, Default)]
pub struct ParsedResourceDirectory {
    /// The node's entries, in table order.
    pub entries: Vec<ParsedResourceEntry>,
}

/// One parsed directory entry.
#[derive(Debug)]
pub struct ParsedResourceEntry {
    /// The entry's identifier.
    pub id: ResourceId,
    /// Subdirectory or leaf payload description.
    pub content: ParsedResourceContent,
}

/// Content of a parsed entry.
#[derive(Debug)]
pub enum ParsedResourceContent {
    /// A nested directory.
    Directory(ParsedResourceDirectory),
    /// A leaf data entry. The payload is addressed by image RVA.
    Data {
        /// RVA of the payload.
        rva: u32,
        /// Payload size in bytes.
        size: u32,
        /// Payload code page.
        codepage: u32,
    },
}

/// Parse the resource tree from the raw table region (`data` starts at the
/// section/table base all internal offsets are relative to).
///
/// # Errors
/// Propagates errors the sink escalates; with a tolerant sink, malformed
/// subtrees come back empty and the issues land in the sink.
pub fn read_resource_directory<S: ErrorSink>(
    data: &[u8],
    sink: &mut S,
) -> Result<ParsedResourceDirectory> {
    read_dir_at(data, 0, 0, sink)
}

fn read_dir_at<S: ErrorSink>(
    data: &[u8],
    offset: u32,
    depth: usize,
    sink: &mut S,
) -> Result<ParsedResourceDirectory> {
    if depth > MAX_RESOURCE_DEPTH {
        sink.report(Error::RecursionLimit(MAX_RESOURCE_DEPTH))?;
        return Ok(ParsedResourceDirectory::default());
    }

    let mut parser = Parser::new(data);
    let mut directory = ParsedResourceDirectory::default();

    let header = (|| -> Result<(u16, u16)> {
        parser.seek(offset as usize)?;
        parser.advance_by(12)?;
        Ok((parser.read_le::<u16>()?, parser.read_le::<u16>()?))
    })();
    let Some((named, ids)) = sink.absorb(header)? else {
        return Ok(directory);
    };

    let total = u32::from(named) + u32::from(ids);
    for _ in 0..total {
        let entry = read_entry(data, &mut parser, depth, sink)?;
        if let Some(entry) = entry {
            directory.entries.push(entry);
        }
    }

    Ok(directory)
}

fn read_entry<S: ErrorSink>(
    data: &[u8],
    parser: &mut Parser<'_>,
    depth: usize,
    sink: &mut S,
) -> Result<Option<ParsedResourceEntry>> {
    let cells = (|| -> Result<(u32, u32)> {
        Ok((parser.read_le::<u32>()?, parser.read_le::<u32>()?))
    })();
    let Some((id_cell, content_cell)) = sink.absorb(cells)? else {
        return Ok(None);
    };

    let id = if id_cell & SUBDIR_FLAG != 0 {
        match sink.absorb(read_name(data, id_cell & !SUBDIR_FLAG))? {
            Some(name) => ResourceId::Name(name),
            None => return Ok(None),
        }
    } else {
        ResourceId::Id(id_cell)
    };

    let content = if content_cell & SUBDIR_FLAG != 0 {
        let subdir = read_dir_at(data, content_cell & !SUBDIR_FLAG, depth + 1, sink)?;
        ParsedResourceContent::Directory(subdir)
    } else {
        let leaf = (|| -> Result<ParsedResourceContent> {
            let mut leaf_parser = Parser::new(data);
            leaf_parser.seek(content_cell as usize)?;
            Ok(ParsedResourceContent::Data {
                rva: leaf_parser.read_le::<u32>()?,
                size: leaf_parser.read_le::<u32>()?,
                codepage: leaf_parser.read_le::<u32>()?,
            })
        })();
        match sink.absorb(leaf)? {
            Some(content) => content,
            None => return Ok(None),
        }
    };

    Ok(Some(ParsedResourceEntry { id, content }))
}

fn read_name(data: &[u8], offset: u32) -> Result<String> {
    let mut parser = Parser::new(data);
    parser.seek(offset as usize)?;
    let len = parser.read_le::<u16>()?;
    let mut units = Vec::with_capacity(usize::from(len));
    for _ in 0..len {
        units.push(parser.read_le::<u16>()?);
    }
    Ok(U16String::from_vec(units).to_string_lossy())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::{FailFast, IssueCollector};
    use crate::file::writer::Writer;

    fn build_tree() -> (SegmentArena, BuiltResourceDirectory, Vec<u8>) {
        let mut arena = SegmentArena::new();
        let mut buffer = ResourceDirectoryBuffer::new();

        // RT_RCDATA (10) / "CONFIG" / language 0.
        buffer
            .add_data(
                &[
                    ResourceId::Id(10),
                    ResourceId::Name("CONFIG".to_string()),
                    ResourceId::Id(0),
                ],
                ResourceData {
                    codepage: 0,
                    data: vec![0xDE, 0xAD, 0xBE, 0xEF],
                },
            )
            .unwrap();

        let built = buffer.build(&mut arena).unwrap();
        arena.update_offsets(built.root, 0, 0).unwrap();
        arena.resolve_references(0).unwrap();

        let mut writer = Writer::new();
        arena.write(built.root, &mut writer).unwrap();
        (arena, built, writer.into_bytes())
    }

    #[test]
    fn round_trip_three_levels() {
        let (_, _, bytes) = build_tree();

        let mut sink = FailFast;
        let root = read_resource_directory(&bytes, &mut sink).unwrap();
        assert_eq!(root.entries.len(), 1);
        assert_eq!(root.entries[0].id, ResourceId::Id(10));

        let ParsedResourceContent::Directory(level2) = &root.entries[0].content else {
            panic!("expected a subdirectory");
        };
        assert_eq!(level2.entries[0].id, ResourceId::Name("CONFIG".to_string()));

        let ParsedResourceContent::Directory(level3) = &level2.entries[0].content else {
            panic!("expected a subdirectory");
        };
        let ParsedResourceContent::Data { rva, size, .. } = &level3.entries[0].content else {
            panic!("expected a data entry");
        };
        assert_eq!(*size, 4);
        // Flat layout at base 0: RVA doubles as an offset into our buffer.
        let payload = &bytes[*rva as usize..(*rva + *size) as usize];
        assert_eq!(payload, &[0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn subdirectory_entries_carry_the_high_bit() {
        let (_, built, bytes) = build_tree();
        assert!(built.table_size > 0);

        // Root directory's single entry: ID 10, subdirectory offset.
        let content_cell = u32::from_le_bytes(bytes[20..24].try_into().unwrap());
        assert_ne!(content_cell & SUBDIR_FLAG, 0);
    }

    #[test]
    fn path_through_leaf_is_rejected() {
        let mut buffer = ResourceDirectoryBuffer::new();
        buffer
            .add_data(
                &[ResourceId::Id(10), ResourceId::Id(1)],
                ResourceData {
                    codepage: 0,
                    data: vec![1],
                },
            )
            .unwrap();
        // ...Id(1) is a leaf now, descending through it must fail.
        assert!(buffer
            .add_data(
                &[ResourceId::Id(10), ResourceId::Id(1), ResourceId::Id(0)],
                ResourceData {
                    codepage: 0,
                    data: vec![2],
                },
            )
            .is_err());
    }

    #[test]
    fn repeated_names_share_one_name_table_string() {
        let mut arena = SegmentArena::new();
        let mut buffer = ResourceDirectoryBuffer::new();
        for type_id in [3u32, 4] {
            buffer
                .add_data(
                    &[
                        ResourceId::Id(type_id),
                        ResourceId::Name("SHARED".to_string()),
                        ResourceId::Id(1033),
                    ],
                    ResourceData {
                        codepage: 0,
                        data: vec![type_id as u8],
                    },
                )
                .unwrap();
        }

        let built = buffer.build(&mut arena).unwrap();
        // 5 directories, 6 entries, 2 data entries, one 14-byte name.
        assert_eq!(built.table_size, 5 * 16 + 6 * 8 + 2 * 16 + 14);

        arena.update_offsets(built.root, 0, 0).unwrap();
        arena.resolve_references(0).unwrap();
        let mut writer = Writer::new();
        arena.write(built.root, &mut writer).unwrap();
        let bytes = writer.into_bytes();

        // The UTF-16 string sits in the table exactly once.
        let mut pattern = vec![6u8, 0];
        for unit in "SHARED".encode_utf16() {
            pattern.extend_from_slice(&unit.to_le_bytes());
        }
        let occurrences = bytes
            .windows(pattern.len())
            .filter(|window| *window == pattern.as_slice())
            .count();
        assert_eq!(occurrences, 1);

        // Both type subdirectories still resolve the shared name.
        let mut sink = FailFast;
        let root = read_resource_directory(&bytes, &mut sink).unwrap();
        assert_eq!(root.entries.len(), 2);
        for entry in &root.entries {
            let ParsedResourceContent::Directory(dir) = &entry.content else {
                panic!("expected a subdirectory");
            };
            assert_eq!(dir.entries[0].id, ResourceId::Name("SHARED".to_string()));
        }
    }

    #[test]
    fn cyclic_tree_hits_the_recursion_limit() {
        // A directory whose sole entry points back at itself.
        let mut data = vec![0u8; 24];
        data[14] = 1; // one ID entry
        data[16..20].copy_from_slice(&7u32.to_le_bytes());
        data[20..24].copy_from_slice(&SUBDIR_FLAG.to_le_bytes()); // subdir at 0

        let mut sink = IssueCollector::new();
        let root = read_resource_directory(&data, &mut sink).unwrap();
        assert!(!root.entries.is_empty());
        assert!(sink
            .issues()
            .iter()
            .any(|issue| matches!(issue, Error::RecursionLimit(_))));
    }

    #[test]
    fn truncated_directory_is_collected_not_fatal() {
        let data = vec![0u8; 4]; // far too short for a directory header
        let mut sink = IssueCollector::new();
        let root = read_resource_directory(&data, &mut sink).unwrap();
        assert!(root.entries.is_empty());
        assert_eq!(sink.len(), 1);
    }
}
