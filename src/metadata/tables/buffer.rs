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

//! Builder-side buffer for the `#~` tables stream.
//!
//! Rows are collected with logical column values (heap offsets, tokens,
//! segment references) and serialized in two strictly separated sub-passes:
//! a **measure** pass that freezes row counts and heap sizes into a
//! [`TableSizes`] snapshot, then an **emit** pass that serializes the stream
//! header and every row against that snapshot. Measurement and emission are
//! never interleaved; the snapshot taken by the caller is the one emission
//! must receive.
//!
//! RVA-valued columns (a method's body address, a field's initial-data
//! address) cannot be known until the whole image is laid out. They are
//! recorded as segment references and come back from [`TablesStreamBuffer::emit`]
//! as patches against the serialized bytes, to be applied by the layout
//! engine's reference-resolution pass.

use crate::{
    layout::{Patch, Reference, SegmentId},
    metadata::{
        tables::{schema, ColumnKind, TableId, TableSizes, TABLE_COUNT},
        token::Token,
    },
    Error, Result,
};
use strum::IntoEnumIterator;

/// Bitmask of the tables this builder emits in sorted order, written to the
/// stream header's `Sorted` field.
pub const SORTED_TABLES: u64 = 0x0000_1600_3301_FA00;

/// Major version of the tables stream.
pub const STREAM_MAJOR_VERSION: u8 = 2;
/// Minor version of the tables stream.
pub const STREAM_MINOR_VERSION: u8 = 0;

/// A logical column value, resolved to bytes during the emit pass.
#[derive(Debug, Clone, Copy)]
pub enum RowValue {
    /// A fixed-width integer, written as-is.
    Fixed(u64),
    /// An offset into the `#Strings` heap.
    StringOffset(u32),
    /// A 1-based `#GUID` heap index.
    GuidIndex(u32),
    /// An offset into the `#Blob` heap.
    BlobOffset(u32),
    /// A 1-based row index into another table.
    RowIndex(u32),
    /// A token packed into the column's coded-index group at emit time.
    Coded(Token),
    /// The RVA of a segment, patched back after layout. Only valid in 4-byte
    /// fixed columns.
    SegmentRva(SegmentId),
}

struct PendingRow {
    table: TableId,
    values: Vec<RowValue>,
}

/// Accumulates rows for every metadata table and serializes the `#~` stream.
///
/// Tokens are assigned at insertion and never change: a row's RID is its
/// 1-based position among rows of the same table, in insertion order. Rows of
/// tables in [`SORTED_TABLES`] must be inserted in their required sort order;
/// the buffer does not reorder.
pub struct TablesStreamBuffer {
    rows: Vec<PendingRow>,
    row_counts: [u32; TABLE_COUNT],
}

impl TablesStreamBuffer {
    /// An empty buffer.
    #[must_use]
    pub fn new() -> Self {
        TablesStreamBuffer {
            rows: Vec::new(),
            row_counts: [0; TABLE_COUNT],
        }
    }

    /// Append a row to `table` and return its permanent token.
    ///
    /// # Errors
    /// Returns [`crate::Error::Error`] if the value count does not match the
    /// table's schema.
    pub fn add_row(&mut self, table: TableId, values: Vec<RowValue>) -> Result<Token> {
        if values.len() != schema(table).len() {
            return Err(Error::Error(format!(
                "{:?} row has {} values, schema requires {}",
                table,
                values.len(),
                schema(table).len()
            )));
        }

        self.row_counts[table as usize] += 1;
        let rid = self.row_counts[table as usize];
        self.rows.push(PendingRow { table, values });
        Ok(Token::from_parts(table as u8, rid))
    }

    /// Current row count of `table`.
    #[must_use]
    pub fn row_count(&self, table: TableId) -> u32 {
        self.row_counts[table as usize]
    }

    /// `true` if no rows were added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// The measure pass: freeze row counts and heap sizes into the snapshot
    /// that both row serialization and the reader's width decisions use.
    #[must_use]
    pub fn measure(&self, strings_size: u64, guid_count: u64, blob_size: u64) -> TableSizes {
        TableSizes::from_heap_sizes(self.row_counts, strings_size, guid_count, blob_size)
    }

    /// Serialized size of the stream under `sizes`, without trailing padding.
    #[must_use]
    pub fn stream_size(&self, sizes: &TableSizes) -> u64 {
        let present = TableId::iter().filter(|id| self.row_count(*id) != 0).count() as u64;
        let header = 24 + present * 4;

        let rows: u64 = TableId::iter()
            .map(|id| u64::from(self.row_count(id)) * u64::from(sizes.row_size(id)))
            .sum();

        header + rows
    }

    /// The emit pass: serialize the stream header and every row.
    ///
    /// Rows are emitted grouped by table in ascending table order, as the
    /// format requires, regardless of interleaved insertion. Returns the
    /// stream bytes plus the patches for RVA-valued columns, with offsets
    /// relative to the start of the stream.
    ///
    /// # Errors
    /// Returns [`crate::Error::Error`] if a value's kind contradicts its
    /// column, or [`crate::Error::Malformed`] if a token cannot be packed
    /// into its coded-index group.
    pub fn emit(&self, sizes: &TableSizes) -> Result<(Vec<u8>, Vec<Patch>)> {
        let mut data = Vec::with_capacity(self.stream_size(sizes) as usize);
        let mut patches = Vec::new();

        // Stream header: reserved, version, heap flags, reserved, masks.
        data.extend_from_slice(&0u32.to_le_bytes());
        data.push(STREAM_MAJOR_VERSION);
        data.push(STREAM_MINOR_VERSION);
        data.push(sizes.heap_flags());
        data.push(1);
        data.extend_from_slice(&sizes.valid_mask().to_le_bytes());
        data.extend_from_slice(&SORTED_TABLES.to_le_bytes());

        for id in TableId::iter() {
            let count = self.row_count(id);
            if count != 0 {
                data.extend_from_slice(&count.to_le_bytes());
            }
        }

        for id in TableId::iter() {
            for row in self.rows.iter().filter(|row| row.table == id) {
                self.emit_row(row, sizes, &mut data, &mut patches)?;
            }
        }

        Ok((data, patches))
    }

    fn emit_row(
        &self,
        row: &PendingRow,
        sizes: &TableSizes,
        data: &mut Vec<u8>,
        patches: &mut Vec<Patch>,
    ) -> Result<()> {
        for (column, value) in schema(row.table).iter().zip(&row.values) {
            let width = sizes.column_width(column);
            let numeric = match (column, value) {
                (ColumnKind::Fixed(_), RowValue::Fixed(raw)) => *raw,
                (ColumnKind::Fixed(4), RowValue::SegmentRva(segment)) => {
                    patches.push(Patch {
                        at: data.len() as u32,
                        reference: Reference::rva(*segment),
                    });
                    0
                }
                (ColumnKind::StringIndex, RowValue::StringOffset(offset)) => u64::from(*offset),
                (ColumnKind::GuidIndex, RowValue::GuidIndex(index)) => u64::from(*index),
                (ColumnKind::BlobIndex, RowValue::BlobOffset(offset)) => u64::from(*offset),
                (ColumnKind::TableIndex(_), RowValue::RowIndex(rid)) => u64::from(*rid),
                (ColumnKind::CodedIndex(kind), RowValue::Coded(token)) => {
                    u64::from(sizes.encode_coded_index(*kind, *token)?)
                }
                _ => {
                    return Err(Error::Error(format!(
                        "{:?} column {:?} received incompatible value {:?}",
                        row.table, column, value
                    )))
                }
            };

            data.extend_from_slice(&numeric.to_le_bytes()[..width as usize]);
        }
        Ok(())
    }
}

impl Default for TablesStreamBuffer {
    fn default() -> Self {
        Self::new()
    }
}
