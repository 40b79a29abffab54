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

//! Import directory builder: descriptor table, lookup/address tables,
//! hint/name entries and module names.
//!
//! The directory follows the two-tier shape all PE directories share: a
//! fixed-format descriptor table (one 20-byte row per module plus a
//! mandatory all-zero sentinel row) pointing into variable-length
//! sub-tables. Per module the lookup table and the address table are
//! structurally identical at build time — the loader overwrites the address
//! table in memory — and each is terminated by a null thunk. Hint/name
//! entries are 2-byte aligned and deduplicated by (hint, name); a symbol
//! imported by two modules shares one entry.
//!
//! The address tables form a separate composite so the image builder can
//! place the IAT at the front of `.text` and point data directory 12 at it.

use std::collections::HashMap;

use crate::{
    layout::{Patch, Reference, SegmentArena, SegmentId, SegmentKind},
    Result,
};

const DESCRIPTOR_SIZE: u32 = 20;

/// One imported symbol.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ImportedSymbol {
    /// Import by hint and name.
    Name {
        /// Export name table hint.
        hint: u16,
        /// Symbol name.
        name: String,
    },
    /// Import by ordinal.
    Ordinal(u16),
}

struct ModuleImports {
    name: String,
    symbols: Vec<ImportedSymbol>,
}

/// Collects imported modules and symbols, then serializes the directory.
pub struct ImportDirectoryBuffer {
    modules: Vec<ModuleImports>,
    is_pe64: bool,
}

/// Handle to one imported module within an [`ImportDirectoryBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleHandle(usize);

/// The serialized import directory, ready for section assembly.
pub struct BuiltImportDirectory {
    /// Composite of all per-module import address tables.
    pub iat_root: SegmentId,
    /// Composite of the descriptor table, lookup tables, hint/name entries
    /// and module names.
    pub directory_root: SegmentId,
    /// The descriptor table itself: target of data directory 1.
    pub descriptor_table: SegmentId,
    /// Per-module address table segments, in registration order.
    pub address_tables: Vec<SegmentId>,
    /// Size of the descriptor table in bytes, sentinel included.
    pub directory_size: u32,
    /// Total size of the import address tables.
    pub iat_size: u32,
    /// Thunk width in bytes (4 for PE32, 8 for PE32+).
    pub thunk_size: u32,
}

impl ImportDirectoryBuffer {
    /// Create a buffer; `is_pe64` selects 8-byte thunks.
    #[must_use]
    pub fn new(is_pe64: bool) -> Self {
        ImportDirectoryBuffer {
            modules: Vec::new(),
            is_pe64,
        }
    }

    /// Register an imported module by name.
    pub fn add_module(&mut self, name: &str) -> ModuleHandle {
        self.modules.push(ModuleImports {
            name: name.to_string(),
            symbols: Vec::new(),
        });
        ModuleHandle(self.modules.len() - 1)
    }

    /// Register one imported symbol of `module`. Returns the slot index of
    /// the symbol within the module's address table.
    pub fn add_symbol(&mut self, module: ModuleHandle, symbol: ImportedSymbol) -> usize {
        let symbols = &mut self.modules[module.0].symbols;
        symbols.push(symbol);
        symbols.len() - 1
    }

    /// `true` if no modules were registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    fn thunk_size(&self) -> u32 {
        if self.is_pe64 {
            8
        } else {
            4
        }
    }

    // A lookup or address table: one thunk per symbol plus the null
    // terminator. Name thunks are patched to the hint/name entry's RVA.
    fn build_thunk_table(
        &self,
        arena: &mut SegmentArena,
        symbols: &[ImportedSymbol],
        hint_names: &HashMap<(u16, String), SegmentId>,
    ) -> Result<SegmentId> {
        let thunk_size = self.thunk_size() as usize;
        let mut data = vec![0u8; (symbols.len() + 1) * thunk_size];
        let mut patches = Vec::new();

        for (slot, symbol) in symbols.iter().enumerate() {
            let at = slot * thunk_size;
            match symbol {
                ImportedSymbol::Name { hint, name } => {
                    patches.push(Patch {
                        at: at as u32,
                        reference: Reference::rva(hint_names[&(*hint, name.clone())]),
                    });
                }
                ImportedSymbol::Ordinal(ordinal) => {
                    if self.is_pe64 {
                        let thunk = 0x8000_0000_0000_0000u64 | u64::from(*ordinal);
                        data[at..at + 8].copy_from_slice(&thunk.to_le_bytes());
                    } else {
                        let thunk = 0x8000_0000u32 | u32::from(*ordinal);
                        data[at..at + 4].copy_from_slice(&thunk.to_le_bytes());
                    }
                }
            }
        }

        arena.add_aligned(SegmentKind::Patchable { data, patches }, 4)
    }

    /// Serialize the directory into segments.
    ///
    /// The sentinel descriptor row is always appended, including for an
    /// empty module list.
    ///
    /// # Errors
    /// Propagates phase violations.
    pub fn build(self, arena: &mut SegmentArena) -> Result<BuiltImportDirectory> {
        let iat_root = arena.add_aligned(SegmentKind::Composite(Vec::new()), 4)?;
        let directory_root = arena.add_aligned(SegmentKind::Composite(Vec::new()), 4)?;

        // Deduplicate hint/name entries across all modules. The side list
        // keeps first-insertion order so layout stays deterministic.
        let mut hint_names: HashMap<(u16, String), SegmentId> = HashMap::new();
        let mut hint_name_order: Vec<SegmentId> = Vec::new();
        for module in &self.modules {
            for symbol in &module.symbols {
                if let ImportedSymbol::Name { hint, name } = symbol {
                    let key = (*hint, name.clone());
                    if !hint_names.contains_key(&key) {
                        let mut entry = hint.to_le_bytes().to_vec();
                        entry.extend_from_slice(name.as_bytes());
                        entry.push(0);
                        let segment = arena.add_aligned(SegmentKind::Raw(entry), 2)?;
                        hint_names.insert(key, segment);
                        hint_name_order.push(segment);
                    }
                }
            }
        }

        // Descriptor table with sentinel, patched against the sub-tables.
        let descriptor_len = (self.modules.len() as u32 + 1) * DESCRIPTOR_SIZE;
        let descriptor_data = vec![0u8; descriptor_len as usize];
        let mut descriptor_patches = Vec::new();

        let mut address_tables = Vec::with_capacity(self.modules.len());
        let mut lookup_tables = Vec::with_capacity(self.modules.len());
        let mut name_segments = Vec::with_capacity(self.modules.len());
        let mut iat_size = 0u32;

        for module in &self.modules {
            let lookup = self.build_thunk_table(arena, &module.symbols, &hint_names)?;
            let address = self.build_thunk_table(arena, &module.symbols, &hint_names)?;
            let name = arena.add(SegmentKind::Ascii(module.name.clone()))?;

            iat_size += (module.symbols.len() as u32 + 1) * self.thunk_size();
            lookup_tables.push(lookup);
            address_tables.push(address);
            name_segments.push(name);
        }

        for (index, _) in self.modules.iter().enumerate() {
            let base = index as u32 * DESCRIPTOR_SIZE;
            descriptor_patches.push(Patch {
                at: base,
                reference: Reference::rva(lookup_tables[index]),
            });
            descriptor_patches.push(Patch {
                at: base + 12,
                reference: Reference::rva(name_segments[index]),
            });
            descriptor_patches.push(Patch {
                at: base + 16,
                reference: Reference::rva(address_tables[index]),
            });
        }

        let descriptor_table = arena.add_aligned(
            SegmentKind::Patchable {
                data: descriptor_data,
                patches: descriptor_patches,
            },
            4,
        )?;

        for address in &address_tables {
            arena.push_child(iat_root, *address)?;
        }
        arena.push_child(directory_root, descriptor_table)?;
        for lookup in lookup_tables {
            arena.push_child(directory_root, lookup)?;
        }
        for segment in hint_name_order {
            arena.push_child(directory_root, segment)?;
        }
        for name in name_segments {
            arena.push_child(directory_root, name)?;
        }

        Ok(BuiltImportDirectory {
            iat_root,
            directory_root,
            descriptor_table,
            address_tables,
            directory_size: descriptor_len,
            iat_size,
            thunk_size: self.thunk_size(),
        })
    }
}
