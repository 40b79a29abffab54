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

//! Metadata table schemas, index widths and the tables-stream buffer.
//!
//! The `#~` stream holds up to 45 row-oriented tables whose column widths are
//! not fixed: heap-offset columns are 2 or 4 bytes depending on the final heap
//! sizes, and table/coded-index columns are 2 or 4 bytes depending on the
//! final row counts of the tables they can reference. The layout of every
//! table is therefore expressed once, as data ([`schema`]), and interpreted
//! against a [`TableSizes`] snapshot — the builder uses it to serialize rows
//! after its measure pass, the reader uses the same schema to decode them.
//!
//! # Reference
//! - [ECMA-335 II.22, II.24.2.6](https://ecma-international.org/wp-content/uploads/ECMA-335_6th_edition_june_2012.pdf)

pub mod buffer;

use crate::{metadata::token::Token, Result};
use strum::IntoEnumIterator;

/// Number of table slots addressed by the valid/sorted bitmasks.
pub const TABLE_COUNT: usize = 0x2D;

/// Identifier of one metadata table.
///
/// Discriminants are the ECMA-335 table numbers, which double as the high
/// byte of tokens into that table. Edit-and-continue and pointer-indirection
/// tables are not part of the supported set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, strum::EnumIter)]
#[repr(u8)]
pub enum TableId {
    /// Module definition (0x00)
    Module = 0x00,
    /// Type references (0x01)
    TypeRef = 0x01,
    /// Type definitions (0x02)
    TypeDef = 0x02,
    /// Field definitions (0x04)
    Field = 0x04,
    /// Method definitions (0x06)
    MethodDef = 0x06,
    /// Parameter definitions (0x08)
    Param = 0x08,
    /// Interface implementations (0x09)
    InterfaceImpl = 0x09,
    /// Member references (0x0A)
    MemberRef = 0x0A,
    /// Constant values (0x0B)
    Constant = 0x0B,
    /// Custom attributes (0x0C)
    CustomAttribute = 0x0C,
    /// Field marshalling information (0x0D)
    FieldMarshal = 0x0D,
    /// Security declarations (0x0E)
    DeclSecurity = 0x0E,
    /// Class layout information (0x0F)
    ClassLayout = 0x0F,
    /// Field layout information (0x10)
    FieldLayout = 0x10,
    /// Standalone signatures (0x11)
    StandAloneSig = 0x11,
    /// Event map (0x12)
    EventMap = 0x12,
    /// Event definitions (0x14)
    Event = 0x14,
    /// Property map (0x15)
    PropertyMap = 0x15,
    /// Property definitions (0x17)
    Property = 0x17,
    /// Method semantics (0x18)
    MethodSemantics = 0x18,
    /// Method implementations (0x19)
    MethodImpl = 0x19,
    /// Module references (0x1A)
    ModuleRef = 0x1A,
    /// Type specifications (0x1B)
    TypeSpec = 0x1B,
    /// P/Invoke implementation map (0x1C)
    ImplMap = 0x1C,
    /// Field RVA information (0x1D)
    FieldRva = 0x1D,
    /// Assembly definition (0x20)
    Assembly = 0x20,
    /// Assembly processor information (0x21)
    AssemblyProcessor = 0x21,
    /// Assembly OS information (0x22)
    AssemblyOs = 0x22,
    /// Assembly references (0x23)
    AssemblyRef = 0x23,
    /// Assembly reference processor information (0x24)
    AssemblyRefProcessor = 0x24,
    /// Assembly reference OS information (0x25)
    AssemblyRefOs = 0x25,
    /// File references (0x26)
    File = 0x26,
    /// Exported types (0x27)
    ExportedType = 0x27,
    /// Manifest resources (0x28)
    ManifestResource = 0x28,
    /// Nested classes (0x29)
    NestedClass = 0x29,
    /// Generic parameters (0x2A)
    GenericParam = 0x2A,
    /// Method specifications (0x2B)
    MethodSpec = 0x2B,
    /// Generic parameter constraints (0x2C)
    GenericParamConstraint = 0x2C,
}

impl TableId {
    /// Map an ECMA table number to its identifier.
    #[must_use]
    pub fn from_byte(value: u8) -> Option<TableId> {
        TableId::iter().find(|id| *id as u8 == value)
    }
}

/// The coded-index groups: tagged unions of table references packed into the
/// smallest integer that can address the largest referenced table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodedIndexKind {
    /// `TypeDef`, `TypeRef` or `TypeSpec`
    TypeDefOrRef,
    /// `Field`, `Param` or `Property`
    HasConstant,
    /// Any table a custom attribute can decorate
    HasCustomAttribute,
    /// `Field` or `Param`
    HasFieldMarshal,
    /// `TypeDef`, `MethodDef` or `Assembly`
    HasDeclSecurity,
    /// Parent of a `MemberRef`
    MemberRefParent,
    /// `Event` or `Property`
    HasSemantics,
    /// `MethodDef` or `MemberRef`
    MethodDefOrRef,
    /// `Field` or `MethodDef`
    MemberForwarded,
    /// `File`, `AssemblyRef` or `ExportedType`
    Implementation,
    /// Constructor of a custom attribute
    CustomAttributeType,
    /// Scope a `TypeRef` resolves in
    ResolutionScope,
    /// `TypeDef` or `MethodDef`
    TypeOrMethodDef,
}

impl CodedIndexKind {
    /// The tag-ordered table list. `None` marks a reserved tag.
    #[must_use]
    pub fn tables(self) -> &'static [Option<TableId>] {
        use TableId as T;
        match self {
            CodedIndexKind::TypeDefOrRef => {
                &[Some(T::TypeDef), Some(T::TypeRef), Some(T::TypeSpec)]
            }
            CodedIndexKind::HasConstant => &[Some(T::Field), Some(T::Param), Some(T::Property)],
            CodedIndexKind::HasCustomAttribute => &[
                Some(T::MethodDef),
                Some(T::Field),
                Some(T::TypeRef),
                Some(T::TypeDef),
                Some(T::Param),
                Some(T::InterfaceImpl),
                Some(T::MemberRef),
                Some(T::Module),
                Some(T::DeclSecurity),
                Some(T::Property),
                Some(T::Event),
                Some(T::StandAloneSig),
                Some(T::ModuleRef),
                Some(T::TypeSpec),
                Some(T::Assembly),
                Some(T::AssemblyRef),
                Some(T::File),
                Some(T::ExportedType),
                Some(T::ManifestResource),
                Some(T::GenericParam),
                Some(T::GenericParamConstraint),
                Some(T::MethodSpec),
            ],
            CodedIndexKind::HasFieldMarshal => &[Some(T::Field), Some(T::Param)],
            CodedIndexKind::HasDeclSecurity => {
                &[Some(T::TypeDef), Some(T::MethodDef), Some(T::Assembly)]
            }
            CodedIndexKind::MemberRefParent => &[
                Some(T::TypeDef),
                Some(T::TypeRef),
                Some(T::ModuleRef),
                Some(T::MethodDef),
                Some(T::TypeSpec),
            ],
            CodedIndexKind::HasSemantics => &[Some(T::Event), Some(T::Property)],
            CodedIndexKind::MethodDefOrRef => &[Some(T::MethodDef), Some(T::MemberRef)],
            CodedIndexKind::MemberForwarded => &[Some(T::Field), Some(T::MethodDef)],
            CodedIndexKind::Implementation => {
                &[Some(T::File), Some(T::AssemblyRef), Some(T::ExportedType)]
            }
            CodedIndexKind::CustomAttributeType => {
                &[None, None, Some(T::MethodDef), Some(T::MemberRef), None]
            }
            CodedIndexKind::ResolutionScope => &[
                Some(T::Module),
                Some(T::ModuleRef),
                Some(T::AssemblyRef),
                Some(T::TypeRef),
            ],
            CodedIndexKind::TypeOrMethodDef => &[Some(T::TypeDef), Some(T::MethodDef)],
        }
    }

    /// Number of tag bits: enough to enumerate the table list.
    #[must_use]
    pub fn tag_bits(self) -> u32 {
        let len = self.tables().len() as u32;
        32 - (len - 1).leading_zeros()
    }
}

/// The layout of one column of a metadata table row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    /// A fixed-width little-endian integer of 1, 2, 4 or 8 bytes.
    Fixed(u8),
    /// An offset into the `#Strings` heap, 2 or 4 bytes.
    StringIndex,
    /// A 1-based index into the `#GUID` heap, 2 or 4 bytes.
    GuidIndex,
    /// An offset into the `#Blob` heap, 2 or 4 bytes.
    BlobIndex,
    /// A 1-based row index into a single table, 2 or 4 bytes.
    TableIndex(TableId),
    /// A tagged union of row indices, 2 or 4 bytes.
    CodedIndex(CodedIndexKind),
}

/// The column layout of `table`, in ECMA-335 declaration order.
#[must_use]
pub fn schema(table: TableId) -> &'static [ColumnKind] {
    use CodedIndexKind as C;
    use ColumnKind::*;
    use TableId as T;
    match table {
        T::Module => &[Fixed(2), StringIndex, GuidIndex, GuidIndex, GuidIndex],
        T::TypeRef => &[CodedIndex(C::ResolutionScope), StringIndex, StringIndex],
        T::TypeDef => &[
            Fixed(4),
            StringIndex,
            StringIndex,
            CodedIndex(C::TypeDefOrRef),
            TableIndex(T::Field),
            TableIndex(T::MethodDef),
        ],
        T::Field => &[Fixed(2), StringIndex, BlobIndex],
        T::MethodDef => &[
            Fixed(4),
            Fixed(2),
            Fixed(2),
            StringIndex,
            BlobIndex,
            TableIndex(T::Param),
        ],
        T::Param => &[Fixed(2), Fixed(2), StringIndex],
        T::InterfaceImpl => &[TableIndex(T::TypeDef), CodedIndex(C::TypeDefOrRef)],
        T::MemberRef => &[CodedIndex(C::MemberRefParent), StringIndex, BlobIndex],
        T::Constant => &[Fixed(1), Fixed(1), CodedIndex(C::HasConstant), BlobIndex],
        T::CustomAttribute => &[
            CodedIndex(C::HasCustomAttribute),
            CodedIndex(C::CustomAttributeType),
            BlobIndex,
        ],
        T::FieldMarshal => &[CodedIndex(C::HasFieldMarshal), BlobIndex],
        T::DeclSecurity => &[Fixed(2), CodedIndex(C::HasDeclSecurity), BlobIndex],
        T::ClassLayout => &[Fixed(2), Fixed(4), TableIndex(T::TypeDef)],
        T::FieldLayout => &[Fixed(4), TableIndex(T::Field)],
        T::StandAloneSig => &[BlobIndex],
        T::EventMap => &[TableIndex(T::TypeDef), TableIndex(T::Event)],
        T::Event => &[Fixed(2), StringIndex, CodedIndex(C::TypeDefOrRef)],
        T::PropertyMap => &[TableIndex(T::TypeDef), TableIndex(T::Property)],
        T::Property => &[Fixed(2), StringIndex, BlobIndex],
        T::MethodSemantics => &[
            Fixed(2),
            TableIndex(T::MethodDef),
            CodedIndex(C::HasSemantics),
        ],
        T::MethodImpl => &[
            TableIndex(T::TypeDef),
            CodedIndex(C::MethodDefOrRef),
            CodedIndex(C::MethodDefOrRef),
        ],
        T::ModuleRef => &[StringIndex],
        T::TypeSpec => &[BlobIndex],
        T::ImplMap => &[
            Fixed(2),
            CodedIndex(C::MemberForwarded),
            StringIndex,
            TableIndex(T::ModuleRef),
        ],
        T::FieldRva => &[Fixed(4), TableIndex(T::Field)],
        T::Assembly => &[
            Fixed(4),
            Fixed(2),
            Fixed(2),
            Fixed(2),
            Fixed(2),
            Fixed(4),
            BlobIndex,
            StringIndex,
            StringIndex,
        ],
        T::AssemblyProcessor => &[Fixed(4)],
        T::AssemblyOs => &[Fixed(4), Fixed(4), Fixed(4)],
        T::AssemblyRef => &[
            Fixed(2),
            Fixed(2),
            Fixed(2),
            Fixed(2),
            Fixed(4),
            BlobIndex,
            StringIndex,
            StringIndex,
            BlobIndex,
        ],
        T::AssemblyRefProcessor => &[Fixed(4), TableIndex(T::AssemblyRef)],
        T::AssemblyRefOs => &[Fixed(4), Fixed(4), Fixed(4), TableIndex(T::AssemblyRef)],
        T::File => &[Fixed(4), StringIndex, BlobIndex],
        T::ExportedType => &[
            Fixed(4),
            Fixed(4),
            StringIndex,
            StringIndex,
            CodedIndex(C::Implementation),
        ],
        T::ManifestResource => &[
            Fixed(4),
            Fixed(4),
            StringIndex,
            CodedIndex(C::Implementation),
        ],
        T::NestedClass => &[TableIndex(T::TypeDef), TableIndex(T::TypeDef)],
        T::GenericParam => &[
            Fixed(2),
            Fixed(2),
            CodedIndex(C::TypeOrMethodDef),
            StringIndex,
        ],
        T::MethodSpec => &[CodedIndex(C::MethodDefOrRef), BlobIndex],
        T::GenericParamConstraint => &[
            TableIndex(T::GenericParam),
            CodedIndex(C::TypeDefOrRef),
        ],
    }
}

/// The size snapshot all width decisions derive from: final row counts plus
/// the three heap-width flags.
///
/// Produced by the builder's measure pass or decoded from a tables-stream
/// header on read. Immutable once constructed; widths must not drift between
/// measurement and emission.
#[derive(Debug, Clone)]
pub struct TableSizes {
    row_counts: [u32; TABLE_COUNT],
    wide_strings: bool,
    wide_guid: bool,
    wide_blob: bool,
}

impl TableSizes {
    /// Build a snapshot from row counts and the heap-size flags byte
    /// (bit 0 = wide strings, bit 1 = wide GUID, bit 2 = wide blob).
    #[must_use]
    pub fn new(row_counts: [u32; TABLE_COUNT], heap_flags: u8) -> Self {
        TableSizes {
            row_counts,
            wide_strings: heap_flags & 0x01 != 0,
            wide_guid: heap_flags & 0x02 != 0,
            wide_blob: heap_flags & 0x04 != 0,
        }
    }

    /// Build a snapshot from row counts and the final heap byte sizes.
    #[must_use]
    pub fn from_heap_sizes(
        row_counts: [u32; TABLE_COUNT],
        strings_size: u64,
        guid_count: u64,
        blob_size: u64,
    ) -> Self {
        TableSizes {
            row_counts,
            wide_strings: strings_size > 0xFFFF,
            wide_guid: guid_count > 0xFFFF,
            wide_blob: blob_size > 0xFFFF,
        }
    }

    /// The heap-size flags byte for the tables stream header.
    #[must_use]
    pub fn heap_flags(&self) -> u8 {
        let mut flags = 0;
        if self.wide_strings {
            flags |= 0x01;
        }
        if self.wide_guid {
            flags |= 0x02;
        }
        if self.wide_blob {
            flags |= 0x04;
        }
        flags
    }

    /// Final row count of `table`.
    #[must_use]
    pub fn row_count(&self, table: TableId) -> u32 {
        self.row_counts[table as usize]
    }

    /// The `Valid` bitmask: one bit per table with at least one row.
    #[must_use]
    pub fn valid_mask(&self) -> u64 {
        let mut mask = 0u64;
        for id in TableId::iter() {
            if self.row_count(id) != 0 {
                mask |= 1u64 << (id as u8);
            }
        }
        mask
    }

    /// Width in bytes of a plain row index into `table`.
    #[must_use]
    pub fn table_index_width(&self, table: TableId) -> u8 {
        if self.row_count(table) > 0xFFFF {
            4
        } else {
            2
        }
    }

    /// Width in bytes of a coded index of `kind`.
    ///
    /// Wide when the largest referenced table's row count no longer fits in
    /// the 16-minus-tag-bits RID field of a 2-byte encoding.
    #[must_use]
    pub fn coded_index_width(&self, kind: CodedIndexKind) -> u8 {
        let max_rows = kind
            .tables()
            .iter()
            .flatten()
            .map(|table| self.row_count(*table))
            .max()
            .unwrap_or(0);

        if u64::from(max_rows) >= 1u64 << (16 - kind.tag_bits()) {
            4
        } else {
            2
        }
    }

    /// Width in bytes of one column.
    #[must_use]
    pub fn column_width(&self, column: &ColumnKind) -> u8 {
        match column {
            ColumnKind::Fixed(width) => *width,
            ColumnKind::StringIndex => {
                if self.wide_strings {
                    4
                } else {
                    2
                }
            }
            ColumnKind::GuidIndex => {
                if self.wide_guid {
                    4
                } else {
                    2
                }
            }
            ColumnKind::BlobIndex => {
                if self.wide_blob {
                    4
                } else {
                    2
                }
            }
            ColumnKind::TableIndex(table) => self.table_index_width(*table),
            ColumnKind::CodedIndex(kind) => self.coded_index_width(*kind),
        }
    }

    /// Serialized size of one row of `table`.
    #[must_use]
    pub fn row_size(&self, table: TableId) -> u32 {
        schema(table)
            .iter()
            .map(|column| u32::from(self.column_width(column)))
            .sum()
    }

    /// Pack a token into a coded index value.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the token's table is not a
    /// member of `kind`.
    pub fn encode_coded_index(&self, kind: CodedIndexKind, token: Token) -> Result<u32> {
        if token.is_null() {
            return Ok(0);
        }
        let tables = kind.tables();
        let Some(tag) = tables
            .iter()
            .position(|entry| *entry == TableId::from_byte(token.table()))
        else {
            return Err(malformed_error!(
                "Token {} is not encodable as a {:?} coded index",
                token,
                kind
            ));
        };

        Ok((token.rid() << kind.tag_bits()) | tag as u32)
    }

    /// Unpack a coded index value into a token.
    ///
    /// A value of zero decodes as the null token of the tag-0 table.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] on a reserved tag or a RID past
    /// the referenced table's row count.
    pub fn decode_coded_index(&self, kind: CodedIndexKind, value: u32) -> Result<Token> {
        let tables = kind.tables();
        let tag = (value & ((1 << kind.tag_bits()) - 1)) as usize;
        let rid = value >> kind.tag_bits();

        let Some(Some(table)) = tables.get(tag) else {
            return Err(malformed_error!(
                "Reserved tag {} in {:?} coded index value {:#x}",
                tag,
                kind,
                value
            ));
        };

        if rid > self.row_count(*table) {
            return Err(malformed_error!(
                "Coded index RID {} exceeds {:?} row count {}",
                rid,
                table,
                self.row_count(*table)
            ));
        }

        Ok(Token::from_parts(*table as u8, rid))
    }
}
