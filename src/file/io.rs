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

//! Bounds-checked little-endian primitive reading and writing.
//!
//! Every multi-byte quantity in PE/COFF and ECMA-335 metadata is little-endian,
//! so this module only carries the little-endian paths. All accesses are
//! validated against the buffer length before touching memory; an out-of-range
//! access is a recoverable [`crate::Error::OutOfBounds`], never a panic.
//!
//! The `*_dyn` variants read or write either a 2-byte or a 4-byte quantity
//! depending on a caller-supplied flag. Metadata table cells use them for heap
//! offsets and table indices whose width is only known once all row counts and
//! heap sizes have been measured.

use crate::{Error::OutOfBounds, Result};

/// Conversion between a primitive value and its little-endian byte array.
///
/// Implemented for the unsigned and signed integers used by PE and metadata
/// structures. The associated `Bytes` type is the fixed-size array matching
/// the primitive (`[u8; 4]` for `u32` and so on).
pub trait LeBytes: Sized {
    /// The fixed-size byte array backing this type.
    type Bytes: Sized + for<'a> TryFrom<&'a [u8]> + AsRef<[u8]>;

    /// Decode from little-endian bytes.
    fn from_le_bytes(bytes: Self::Bytes) -> Self;
    /// Encode into little-endian bytes.
    fn to_le_bytes(self) -> Self::Bytes;
}

macro_rules! impl_le_bytes {
    ($($ty:ty),*) => {
        $(
            impl LeBytes for $ty {
                type Bytes = [u8; std::mem::size_of::<$ty>()];

                fn from_le_bytes(bytes: Self::Bytes) -> Self {
                    <$ty>::from_le_bytes(bytes)
                }

                fn to_le_bytes(self) -> Self::Bytes {
                    <$ty>::to_le_bytes(self)
                }
            }
        )*
    };
}

impl_le_bytes!(u8, i8, u16, i16, u32, i32, u64, i64);

/// Read a value of type `T` from the start of `data`.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if `data` is too short.
pub fn read_le<T: LeBytes>(data: &[u8]) -> Result<T> {
    let mut offset = 0_usize;
    read_le_at(data, &mut offset)
}

/// Read a value of type `T` at `offset`, advancing the offset past it.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if fewer than `size_of::<T>()` bytes
/// remain at `offset`.
pub fn read_le_at<T: LeBytes>(data: &[u8], offset: &mut usize) -> Result<T> {
    let type_len = std::mem::size_of::<T>();
    let Some(end) = offset.checked_add(type_len) else {
        return Err(OutOfBounds);
    };
    if end > data.len() {
        return Err(OutOfBounds);
    }

    let Ok(read) = data[*offset..end].try_into() else {
        return Err(OutOfBounds);
    };

    *offset = end;

    Ok(T::from_le_bytes(read))
}

/// Read either a 2-byte or 4-byte unsigned value at `offset`.
///
/// When `is_large` is `false` the 2-byte value is widened to `u32`.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if insufficient bytes remain.
pub fn read_le_at_dyn(data: &[u8], offset: &mut usize, is_large: bool) -> Result<u32> {
    let res = if is_large {
        read_le_at::<u32>(data, offset)?
    } else {
        u32::from(read_le_at::<u16>(data, offset)?)
    };

    Ok(res)
}

/// Write `value` at `offset`, advancing the offset past it.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if the buffer is too short.
pub fn write_le_at<T: LeBytes>(data: &mut [u8], offset: &mut usize, value: T) -> Result<()> {
    let type_len = std::mem::size_of::<T>();
    let Some(end) = offset.checked_add(type_len) else {
        return Err(OutOfBounds);
    };
    if end > data.len() {
        return Err(OutOfBounds);
    }

    data[*offset..end].copy_from_slice(value.to_le_bytes().as_ref());
    *offset = end;

    Ok(())
}

/// Write either a 2-byte or 4-byte unsigned value at `offset`.
///
/// When `is_large` is `false` the value is truncated to `u16` before writing;
/// callers are expected to have sized the cell so that truncation is lossless.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if the buffer is too short.
pub fn write_le_at_dyn(
    data: &mut [u8],
    offset: &mut usize,
    value: u32,
    is_large: bool,
) -> Result<()> {
    if is_large {
        write_le_at::<u32>(data, offset, value)?;
    } else {
        write_le_at::<u16>(data, offset, value as u16)?;
    }

    Ok(())
}
