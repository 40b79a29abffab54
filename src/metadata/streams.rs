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

//! Read-side views over the physical metadata streams.
//!
//! Each view borrows the raw stream bytes out of a metadata root and decodes
//! entries on demand. Nothing is materialized up front: `#Strings`, `#US`,
//! `#GUID` and `#Blob` lookups walk straight into the heap bytes, and
//! [`TablesView`] decodes rows against the [`schema`] of their table using
//! the index widths recovered from the stream header.

use std::collections::HashMap;

use uguid::Guid;
use widestring::U16String;

use crate::{
    file::parser::Parser,
    metadata::{
        tables::{schema, ColumnKind, TableId, TableSizes, TABLE_COUNT},
        token::Token,
    },
    Result,
};

/// View over the `#Strings` heap: NUL-terminated UTF-8 at byte offsets.
pub struct StringsView<'a> {
    data: &'a [u8],
}

impl<'a> StringsView<'a> {
    /// Wrap the raw heap bytes.
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        StringsView { data }
    }

    /// The string starting at `offset`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if `offset` is past the heap and
    /// [`crate::Error::Malformed`] on invalid UTF-8.
    pub fn get(&self, offset: u32) -> Result<&'a str> {
        let mut parser = Parser::new(self.data);
        parser.seek(offset as usize)?;
        parser.read_string_utf8()
    }
}

/// View over the `#US` heap: length-prefixed UTF-16 user strings.
pub struct UserStringsView<'a> {
    data: &'a [u8],
}

impl<'a> UserStringsView<'a> {
    /// Wrap the raw heap bytes.
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        UserStringsView { data }
    }

    /// The user string starting at `offset`, as referenced by an `ldstr`
    /// token's RID part.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] on truncation and
    /// [`crate::Error::Malformed`] on a length that is not `2n + 1`.
    pub fn get(&self, offset: u32) -> Result<String> {
        let mut parser = Parser::new(self.data);
        parser.seek(offset as usize)?;
        let byte_len = parser.read_compressed_uint()? as usize;
        if byte_len == 0 {
            return Ok(String::new());
        }
        if byte_len % 2 == 0 {
            return Err(malformed_error!(
                "User string at offset {} has even byte length {}",
                offset,
                byte_len
            ));
        }
        // The trailing byte is the special-character flag, not code units.
        let units = (byte_len - 1) / 2;
        let raw = parser.read_bytes(units * 2)?;
        let mut code_units = Vec::with_capacity(units);
        for pair in raw.chunks_exact(2) {
            code_units.push(u16::from_le_bytes([pair[0], pair[1]]));
        }
        Ok(U16String::from_vec(code_units).to_string_lossy())
    }
}

/// View over the `#GUID` heap: 16-byte entries addressed by 1-based index.
pub struct GuidView<'a> {
    data: &'a [u8],
}

impl<'a> GuidView<'a> {
    /// Wrap the raw heap bytes.
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        GuidView { data }
    }

    /// Number of GUIDs in the heap.
    #[must_use]
    pub fn count(&self) -> u32 {
        (self.data.len() / 16) as u32
    }

    /// The GUID at the 1-based `index`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] for index 0 or past the heap.
    pub fn get(&self, index: u32) -> Result<Guid> {
        if index == 0 || index > self.count() {
            return Err(malformed_error!(
                "GUID index {} out of range (heap holds {})",
                index,
                self.count()
            ));
        }
        let start = (index as usize - 1) * 16;
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&self.data[start..start + 16]);
        Ok(Guid::from_bytes(bytes))
    }
}

/// View over the `#Blob` heap: compressed-length-prefixed byte runs.
pub struct BlobView<'a> {
    data: &'a [u8],
}

impl<'a> BlobView<'a> {
    /// Wrap the raw heap bytes.
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        BlobView { data }
    }

    /// The blob starting at `offset`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the declared length runs past
    /// the heap.
    pub fn get(&self, offset: u32) -> Result<&'a [u8]> {
        let mut parser = Parser::new(self.data);
        parser.seek(offset as usize)?;
        let length = parser.read_compressed_uint()? as usize;
        parser.read_bytes(length)
    }
}

/// One decoded table cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cell {
    /// Fixed-width numeric column.
    Value(u64),
    /// Offset into `#Strings`.
    String(u32),
    /// 1-based index into `#GUID`.
    Guid(u32),
    /// Offset into `#Blob`.
    Blob(u32),
    /// Plain table index or decoded coded index.
    Token(Token),
}

impl Cell {
    /// The cell as a raw numeric, regardless of variant.
    #[must_use]
    pub fn raw(self) -> u64 {
        match self {
            Cell::Value(value) => value,
            Cell::String(value) | Cell::Guid(value) | Cell::Blob(value) => u64::from(value),
            Cell::Token(token) => u64::from(token.value()),
        }
    }
}

/// View over the `#~` tables stream.
pub struct TablesView<'a> {
    data: &'a [u8],
    sizes: TableSizes,
    sorted: u64,
    /// Byte offset of each present table's first row within `data`.
    table_offsets: HashMap<TableId, usize>,
    major_version: u8,
    minor_version: u8,
}

impl<'a> TablesView<'a> {
    /// Parse the tables stream header and index the row regions.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] for unknown valid bits and
    /// [`crate::Error::OutOfBounds`] on truncation.
    pub fn parse(data: &'a [u8]) -> Result<TablesView<'a>> {
        let mut parser = Parser::new(data);
        parser.advance_by(4)?; // reserved
        let major_version = parser.read_le::<u8>()?;
        let minor_version = parser.read_le::<u8>()?;
        let heap_flags = parser.read_le::<u8>()?;
        parser.advance_by(1)?; // reserved
        let valid = parser.read_le::<u64>()?;
        let sorted = parser.read_le::<u64>()?;

        let mut row_counts = [0u32; TABLE_COUNT];
        for bit in 0..64 {
            if valid & (1u64 << bit) == 0 {
                continue;
            }
            let Some(table) = TableId::from_byte(bit) else {
                return Err(malformed_error!(
                    "Tables stream declares unsupported table {:#04x}",
                    bit
                ));
            };
            row_counts[table as usize] = parser.read_le::<u32>()?;
        }

        let sizes = TableSizes::new(row_counts, heap_flags);

        let mut table_offsets = HashMap::new();
        let mut cursor = parser.pos();
        for bit in 0..TABLE_COUNT as u8 {
            let Some(table) = TableId::from_byte(bit) else {
                continue;
            };
            let rows = sizes.row_count(table);
            if rows == 0 {
                continue;
            }
            table_offsets.insert(table, cursor);
            cursor += rows as usize * sizes.row_size(table) as usize;
        }
        if cursor > data.len() {
            return Err(malformed_error!(
                "Tables stream rows extend to {} but the stream holds {} bytes",
                cursor,
                data.len()
            ));
        }

        Ok(TablesView {
            data,
            sizes,
            sorted,
            table_offsets,
            major_version,
            minor_version,
        })
    }

    /// Index widths and row counts recovered from the header.
    #[must_use]
    pub fn sizes(&self) -> &TableSizes {
        &self.sizes
    }

    /// The declared sorted-table bit mask.
    #[must_use]
    pub fn sorted_mask(&self) -> u64 {
        self.sorted
    }

    /// Tables stream schema version.
    #[must_use]
    pub fn version(&self) -> (u8, u8) {
        (self.major_version, self.minor_version)
    }

    /// Number of rows in `table`.
    #[must_use]
    pub fn row_count(&self, table: TableId) -> u32 {
        self.sizes.row_count(table)
    }

    /// Decode the 1-based row `rid` of `table` into its cells.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] for a RID out of range or a coded
    /// index naming a reserved tag.
    pub fn row(&self, table: TableId, rid: u32) -> Result<Vec<Cell>> {
        if rid == 0 || rid > self.row_count(table) {
            return Err(malformed_error!(
                "{:?} row {} out of range (table holds {})",
                table,
                rid,
                self.row_count(table)
            ));
        }
        let offset = self.table_offsets[&table]
            + (rid as usize - 1) * self.sizes.row_size(table) as usize;
        let mut parser = Parser::new(self.data);
        parser.seek(offset)?;

        let columns = schema(table);
        let mut cells = Vec::with_capacity(columns.len());
        for column in columns {
            let width = self.sizes.column_width(column);
            let raw = match width {
                1 => u32::from(parser.read_le::<u8>()?),
                2 => u32::from(parser.read_le::<u16>()?),
                4 => parser.read_le::<u32>()?,
                8 => {
                    cells.push(Cell::Value(parser.read_le::<u64>()?));
                    continue;
                }
                _ => {
                    return Err(malformed_error!(
                        "Unsupported column width {} in {:?}",
                        width,
                        table
                    ))
                }
            };
            cells.push(match column {
                ColumnKind::Fixed(_) => Cell::Value(u64::from(raw)),
                ColumnKind::StringIndex => Cell::String(raw),
                ColumnKind::GuidIndex => Cell::Guid(raw),
                ColumnKind::BlobIndex => Cell::Blob(raw),
                ColumnKind::TableIndex(target) => {
                    Cell::Token(Token::from_parts(*target as u8, raw))
                }
                ColumnKind::CodedIndex(kind) => {
                    Cell::Token(self.sizes.decode_coded_index(*kind, raw)?)
                }
            });
        }
        Ok(cells)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{
        heaps::{
            BlobHeapBuffer, GuidHeapBuffer, StringsHeapBuffer, UserStringHeapBuffer,
        },
        tables::buffer::{RowValue, TablesStreamBuffer},
    };

    #[test]
    fn strings_view_reads_back_offsets() {
        let mut buffer = StringsHeapBuffer::new();
        let hello = buffer.get_or_add("Hello").unwrap();
        let world = buffer.get_or_add("World").unwrap();
        let bytes = buffer.into_bytes();

        let view = StringsView::new(&bytes);
        assert_eq!(view.get(hello).unwrap(), "Hello");
        assert_eq!(view.get(world).unwrap(), "World");
        assert_eq!(view.get(0).unwrap(), "");
    }

    #[test]
    fn user_strings_round_trip_including_flag_byte() {
        let mut buffer = UserStringHeapBuffer::new();
        let plain = buffer.get_or_add("Hello, World!").unwrap();
        let flagged = buffer.get_or_add("tab\there").unwrap();
        let bytes = buffer.into_bytes();

        let view = UserStringsView::new(&bytes);
        assert_eq!(view.get(plain).unwrap(), "Hello, World!");
        assert_eq!(view.get(flagged).unwrap(), "tab\there");
    }

    #[test]
    fn guid_view_is_one_based() {
        let mut buffer = GuidHeapBuffer::new();
        let guid = Guid::from_bytes([7u8; 16]);
        let index = buffer.get_or_add(guid);
        assert_eq!(index, 1);
        let bytes = buffer.into_bytes();

        let view = GuidView::new(&bytes);
        assert_eq!(view.get(1).unwrap(), guid);
        assert!(view.get(0).is_err());
        assert!(view.get(2).is_err());
    }

    #[test]
    fn blob_view_honors_length_prefix() {
        let mut buffer = BlobHeapBuffer::new();
        let offset = buffer.get_or_add(&[1, 2, 3, 4]).unwrap();
        let bytes = buffer.into_bytes();

        let view = BlobView::new(&bytes);
        assert_eq!(view.get(offset).unwrap(), &[1, 2, 3, 4]);
        assert_eq!(view.get(0).unwrap(), &[] as &[u8]);
    }

    #[test]
    fn tables_view_decodes_emitted_rows() {
        let mut buffer = TablesStreamBuffer::new();
        buffer
            .add_row(
                TableId::Module,
                vec![
                    RowValue::Fixed(0),
                    RowValue::StringOffset(0x15),
                    RowValue::GuidIndex(1),
                    RowValue::GuidIndex(0),
                    RowValue::GuidIndex(0),
                ],
            )
            .unwrap();
        let typedef = buffer
            .add_row(
                TableId::TypeDef,
                vec![
                    RowValue::Fixed(0x0010_0001),
                    RowValue::StringOffset(0x20),
                    RowValue::StringOffset(0x30),
                    RowValue::Coded(Token::new(0)),
                    RowValue::RowIndex(1),
                    RowValue::RowIndex(1),
                ],
            )
            .unwrap();
        assert_eq!(typedef.value(), 0x0200_0001);

        let sizes = buffer.measure(0x40, 1, 0);
        let (bytes, patches) = buffer.emit(&sizes).unwrap();
        assert!(patches.is_empty());

        let view = TablesView::parse(&bytes).unwrap();
        assert_eq!(view.row_count(TableId::Module), 1);
        assert_eq!(view.row_count(TableId::TypeDef), 1);
        assert_eq!(view.version(), (2, 0));

        let module = view.row(TableId::Module, 1).unwrap();
        assert_eq!(module[1], Cell::String(0x15));
        assert_eq!(module[2], Cell::Guid(1));

        let row = view.row(TableId::TypeDef, 1).unwrap();
        assert_eq!(row[0], Cell::Value(0x0010_0001));
        assert_eq!(row[1], Cell::String(0x20));
        match row[3] {
            Cell::Token(token) => assert!(token.is_null()),
            other => panic!("expected token cell, got {other:?}"),
        }

        assert!(view.row(TableId::TypeDef, 2).is_err());
        assert!(view.row(TableId::MethodDef, 1).is_err());
    }

    #[test]
    fn unknown_valid_bit_is_rejected() {
        // Header declaring table 0x03 (a pointer table) as present.
        let mut data = vec![0u8; 24];
        data[4] = 2; // major
        data[7] = 1; // reserved byte
        data[8..16].copy_from_slice(&(1u64 << 0x03).to_le_bytes());
        data.extend_from_slice(&1u32.to_le_bytes());

        assert!(TablesView::parse(&data).is_err());
    }
}
