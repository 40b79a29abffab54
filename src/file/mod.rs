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

//! Input abstraction and low-level byte access.
//!
//! [`File`] owns the raw bytes of an image being read, either as a
//! memory-mapped file or an in-memory buffer, and hands out slices to the
//! parsing layers. All higher-level readers borrow from it; nothing in the
//! crate copies the input wholesale.

pub mod io;
pub mod parser;
pub mod writer;

use std::path::Path;

use crate::Result;

/// Backing storage for an image being read.
enum Backing {
    /// A memory mapped file
    Mmap(memmap2::Mmap),
    /// An owned, in-memory buffer
    Memory(Vec<u8>),
}

/// The raw bytes of a PE image.
///
/// Construct with [`File::from_file`] (memory mapped, no upfront read) or
/// [`File::from_mem`] (caller-provided buffer). The whole reader pipeline
/// borrows slices out of this object.
pub struct File {
    backing: Backing,
}

impl File {
    /// Map `path` into memory.
    ///
    /// # Errors
    /// Returns [`crate::Error::FileError`] if the file cannot be opened or
    /// mapped, or [`crate::Error::Empty`] for a zero-length file.
    pub fn from_file(path: &Path) -> Result<File> {
        let file = std::fs::File::open(path)?;

        let mmap = unsafe { memmap2::Mmap::map(&file)? };
        if mmap.is_empty() {
            return Err(crate::Error::Empty);
        }

        Ok(File {
            backing: Backing::Mmap(mmap),
        })
    }

    /// Wrap an in-memory buffer.
    ///
    /// # Errors
    /// Returns [`crate::Error::Empty`] if `data` is empty.
    pub fn from_mem(data: Vec<u8>) -> Result<File> {
        if data.is_empty() {
            return Err(crate::Error::Empty);
        }

        Ok(File {
            backing: Backing::Memory(data),
        })
    }

    /// The full byte contents.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        match &self.backing {
            Backing::Mmap(mmap) => mmap,
            Backing::Memory(buffer) => buffer,
        }
    }

    /// Total length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data().len()
    }

    /// `true` if the backing buffer is empty. Never the case for a
    /// successfully constructed `File`.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data().is_empty()
    }

    /// A bounds-checked slice of the contents.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the range exceeds the data.
    pub fn slice(&self, offset: usize, len: usize) -> Result<&[u8]> {
        let data = self.data();
        let Some(end) = offset.checked_add(len) else {
            return Err(crate::Error::OutOfBounds);
        };
        if end > data.len() {
            return Err(crate::Error::OutOfBounds);
        }
        Ok(&data[offset..end])
    }
}
