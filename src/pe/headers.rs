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

//! PE/COFF file headers: DOS stub, COFF header, optional header, data
//! directories.
//!
//! These are the fixed-format records at the front of every image. Reading and
//! writing live side by side here so the two stay field-for-field symmetric.
//!
//! # Reference
//! - [PE Format](https://learn.microsoft.com/windows/win32/debug/pe-format)

use crate::{file::parser::Parser, file::writer::Writer, Result};

/// Machine type for 32-bit x86 images.
pub const MACHINE_I386: u16 = 0x014C;
/// Machine type for x86-64 images.
pub const MACHINE_AMD64: u16 = 0x8664;

/// Optional header magic for PE32 images.
pub const MAGIC_PE32: u16 = 0x010B;
/// Optional header magic for PE32+ images.
pub const MAGIC_PE64: u16 = 0x020B;

/// Number of data directory slots emitted by this crate and expected on read.
pub const DATA_DIRECTORY_COUNT: usize = 16;

/// Well-known data directory slot indices.
pub mod directory_index {
    /// Export directory.
    pub const EXPORT: usize = 0;
    /// Import directory.
    pub const IMPORT: usize = 1;
    /// Win32 resource directory.
    pub const RESOURCE: usize = 2;
    /// Exception directory (unused by managed images).
    pub const EXCEPTION: usize = 3;
    /// Certificate/security directory (unused here).
    pub const SECURITY: usize = 4;
    /// Base relocation directory.
    pub const BASE_RELOCATION: usize = 5;
    /// Debug directory.
    pub const DEBUG: usize = 6;
    /// Import address table.
    pub const IAT: usize = 12;
    /// CLR (.NET) header directory.
    pub const CLR: usize = 14;
}

bitflags::bitflags! {
    /// COFF file header characteristics.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FileCharacteristics: u16 {
        /// Relocation information stripped.
        const RELOCS_STRIPPED = 0x0001;
        /// The image is valid and can be run.
        const EXECUTABLE_IMAGE = 0x0002;
        /// Application can handle addresses beyond 2GB.
        const LARGE_ADDRESS_AWARE = 0x0020;
        /// Machine is based on a 32-bit word architecture.
        const MACHINE_32BIT = 0x0100;
        /// The image is a DLL.
        const DLL = 0x2000;
    }
}

/// The canonical 128-byte DOS header + stub emitted for built images.
///
/// `e_lfanew` at offset 0x3C points at 0x80, immediately after the stub.
#[rustfmt::skip]
pub const DOS_STUB: [u8; 0x80] = [
    0x4D, 0x5A, 0x90, 0x00, 0x03, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00, 0xFF, 0xFF, 0x00, 0x00,
    0xB8, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x40, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x80, 0x00, 0x00, 0x00,
    0x0E, 0x1F, 0xBA, 0x0E, 0x00, 0xB4, 0x09, 0xCD, 0x21, 0xB8, 0x01, 0x4C, 0xCD, 0x21, 0x54, 0x68,
    0x69, 0x73, 0x20, 0x70, 0x72, 0x6F, 0x67, 0x72, 0x61, 0x6D, 0x20, 0x63, 0x61, 0x6E, 0x6E, 0x6F,
    0x74, 0x20, 0x62, 0x65, 0x20, 0x72, 0x75, 0x6E, 0x20, 0x69, 0x6E, 0x20, 0x44, 0x4F, 0x53, 0x20,
    0x6D, 0x6F, 0x64, 0x65, 0x2E, 0x0D, 0x0D, 0x0A, 0x24, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

/// One (RVA, size) pair in the optional header's data directory table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DataDirectory {
    /// RVA of the structure the slot points to, 0 if absent.
    pub rva: u32,
    /// Size of the structure in bytes, 0 if absent.
    pub size: u32,
}

impl DataDirectory {
    /// `true` if this slot points at something.
    #[must_use]
    pub fn is_present(&self) -> bool {
        self.rva != 0 && self.size != 0
    }
}

/// The 20-byte COFF file header following the `PE\0\0` signature.
#[derive(Debug, Clone)]
pub struct CoffFileHeader {
    /// Target machine type.
    pub machine: u16,
    /// Number of entries in the section table.
    pub number_of_sections: u16,
    /// Link time, seconds since the Unix epoch.
    pub time_date_stamp: u32,
    /// Deprecated COFF symbol table pointer, 0 for images.
    pub pointer_to_symbol_table: u32,
    /// Deprecated COFF symbol count, 0 for images.
    pub number_of_symbols: u32,
    /// Size of the optional header that follows.
    pub size_of_optional_header: u16,
    /// Image characteristics flags.
    pub characteristics: FileCharacteristics,
}

impl CoffFileHeader {
    /// Read a COFF header at the parser's position.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] on truncation.
    pub fn read(parser: &mut Parser<'_>) -> Result<CoffFileHeader> {
        Ok(CoffFileHeader {
            machine: parser.read_le::<u16>()?,
            number_of_sections: parser.read_le::<u16>()?,
            time_date_stamp: parser.read_le::<u32>()?,
            pointer_to_symbol_table: parser.read_le::<u32>()?,
            number_of_symbols: parser.read_le::<u32>()?,
            size_of_optional_header: parser.read_le::<u16>()?,
            characteristics: FileCharacteristics::from_bits_retain(parser.read_le::<u16>()?),
        })
    }

    /// Write the header at the writer's position.
    pub fn write(&self, writer: &mut Writer) {
        writer.write_le(self.machine);
        writer.write_le(self.number_of_sections);
        writer.write_le(self.time_date_stamp);
        writer.write_le(self.pointer_to_symbol_table);
        writer.write_le(self.number_of_symbols);
        writer.write_le(self.size_of_optional_header);
        writer.write_le(self.characteristics.bits());
    }
}

/// The optional header, covering both the PE32 and PE32+ layouts.
///
/// Width-dependent fields (`image_base`, stack/heap sizes) are stored as
/// `u64` and narrowed on write for PE32.
#[derive(Debug, Clone)]
pub struct OptionalHeader {
    /// `MAGIC_PE32` or `MAGIC_PE64`.
    pub magic: u16,
    /// Linker major version.
    pub major_linker_version: u8,
    /// Linker minor version.
    pub minor_linker_version: u8,
    /// Total size of code sections.
    pub size_of_code: u32,
    /// Total size of initialized-data sections.
    pub size_of_initialized_data: u32,
    /// Total size of uninitialized-data sections.
    pub size_of_uninitialized_data: u32,
    /// Entry point RVA, 0 when the loader dispatches through the CLR.
    pub address_of_entry_point: u32,
    /// RVA of the first code section.
    pub base_of_code: u32,
    /// RVA of the first data section (PE32 only; unused in PE32+).
    pub base_of_data: u32,
    /// Preferred load address.
    pub image_base: u64,
    /// In-memory section alignment.
    pub section_alignment: u32,
    /// On-disk section alignment.
    pub file_alignment: u32,
    /// Required OS major version.
    pub major_operating_system_version: u16,
    /// Required OS minor version.
    pub minor_operating_system_version: u16,
    /// Image major version.
    pub major_image_version: u16,
    /// Image minor version.
    pub minor_image_version: u16,
    /// Subsystem major version.
    pub major_subsystem_version: u16,
    /// Subsystem minor version.
    pub minor_subsystem_version: u16,
    /// Reserved, 0.
    pub win32_version_value: u32,
    /// Size of the loaded image, multiple of `section_alignment`.
    pub size_of_image: u32,
    /// Size of headers rounded to `file_alignment`.
    pub size_of_headers: u32,
    /// Image checksum, 0 unless signed.
    pub checksum: u32,
    /// Windows subsystem (3 = console, 2 = GUI).
    pub subsystem: u16,
    /// DLL characteristics flags.
    pub dll_characteristics: u16,
    /// Stack reservation size.
    pub size_of_stack_reserve: u64,
    /// Stack commit size.
    pub size_of_stack_commit: u64,
    /// Heap reservation size.
    pub size_of_heap_reserve: u64,
    /// Heap commit size.
    pub size_of_heap_commit: u64,
    /// Reserved, 0.
    pub loader_flags: u32,
    /// Number of data directory slots that follow.
    pub number_of_rva_and_sizes: u32,
    /// The data directory table.
    pub data_directories: [DataDirectory; DATA_DIRECTORY_COUNT],
}

impl OptionalHeader {
    /// `true` for PE32+ images.
    #[must_use]
    pub fn is_pe64(&self) -> bool {
        self.magic == MAGIC_PE64
    }

    /// Size of the serialized optional header, including 16 directories.
    #[must_use]
    pub fn size(&self) -> u16 {
        if self.is_pe64() {
            240
        } else {
            224
        }
    }

    /// Read an optional header at the parser's position.
    ///
    /// Tolerates images declaring fewer than 16 directories; missing slots
    /// read as absent.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] on an unknown magic and
    /// [`crate::Error::OutOfBounds`] on truncation.
    pub fn read(parser: &mut Parser<'_>) -> Result<OptionalHeader> {
        let magic = parser.read_le::<u16>()?;
        if magic != MAGIC_PE32 && magic != MAGIC_PE64 {
            return Err(malformed_error!(
                "Unknown optional header magic - {:#06x}",
                magic
            ));
        }
        let is_pe64 = magic == MAGIC_PE64;

        let major_linker_version = parser.read_le::<u8>()?;
        let minor_linker_version = parser.read_le::<u8>()?;
        let size_of_code = parser.read_le::<u32>()?;
        let size_of_initialized_data = parser.read_le::<u32>()?;
        let size_of_uninitialized_data = parser.read_le::<u32>()?;
        let address_of_entry_point = parser.read_le::<u32>()?;
        let base_of_code = parser.read_le::<u32>()?;

        let (base_of_data, image_base) = if is_pe64 {
            (0, parser.read_le::<u64>()?)
        } else {
            (
                parser.read_le::<u32>()?,
                u64::from(parser.read_le::<u32>()?),
            )
        };

        let section_alignment = parser.read_le::<u32>()?;
        let file_alignment = parser.read_le::<u32>()?;
        let major_operating_system_version = parser.read_le::<u16>()?;
        let minor_operating_system_version = parser.read_le::<u16>()?;
        let major_image_version = parser.read_le::<u16>()?;
        let minor_image_version = parser.read_le::<u16>()?;
        let major_subsystem_version = parser.read_le::<u16>()?;
        let minor_subsystem_version = parser.read_le::<u16>()?;
        let win32_version_value = parser.read_le::<u32>()?;
        let size_of_image = parser.read_le::<u32>()?;
        let size_of_headers = parser.read_le::<u32>()?;
        let checksum = parser.read_le::<u32>()?;
        let subsystem = parser.read_le::<u16>()?;
        let dll_characteristics = parser.read_le::<u16>()?;

        let (size_of_stack_reserve, size_of_stack_commit, size_of_heap_reserve, size_of_heap_commit) =
            if is_pe64 {
                (
                    parser.read_le::<u64>()?,
                    parser.read_le::<u64>()?,
                    parser.read_le::<u64>()?,
                    parser.read_le::<u64>()?,
                )
            } else {
                (
                    u64::from(parser.read_le::<u32>()?),
                    u64::from(parser.read_le::<u32>()?),
                    u64::from(parser.read_le::<u32>()?),
                    u64::from(parser.read_le::<u32>()?),
                )
            };

        let loader_flags = parser.read_le::<u32>()?;
        let number_of_rva_and_sizes = parser.read_le::<u32>()?;

        let mut data_directories = [DataDirectory::default(); DATA_DIRECTORY_COUNT];
        let present = (number_of_rva_and_sizes as usize).min(DATA_DIRECTORY_COUNT);
        for directory in data_directories.iter_mut().take(present) {
            directory.rva = parser.read_le::<u32>()?;
            directory.size = parser.read_le::<u32>()?;
        }
        // Slots beyond 16 exist in some malformed files; skip them.
        for _ in DATA_DIRECTORY_COUNT..number_of_rva_and_sizes as usize {
            parser.advance_by(8)?;
        }

        Ok(OptionalHeader {
            magic,
            major_linker_version,
            minor_linker_version,
            size_of_code,
            size_of_initialized_data,
            size_of_uninitialized_data,
            address_of_entry_point,
            base_of_code,
            base_of_data,
            image_base,
            section_alignment,
            file_alignment,
            major_operating_system_version,
            minor_operating_system_version,
            major_image_version,
            minor_image_version,
            major_subsystem_version,
            minor_subsystem_version,
            win32_version_value,
            size_of_image,
            size_of_headers,
            checksum,
            subsystem,
            dll_characteristics,
            size_of_stack_reserve,
            size_of_stack_commit,
            size_of_heap_reserve,
            size_of_heap_commit,
            loader_flags,
            number_of_rva_and_sizes,
            data_directories,
        })
    }

    /// Write the header at the writer's position.
    pub fn write(&self, writer: &mut Writer) {
        writer.write_le(self.magic);
        writer.write_le(self.major_linker_version);
        writer.write_le(self.minor_linker_version);
        writer.write_le(self.size_of_code);
        writer.write_le(self.size_of_initialized_data);
        writer.write_le(self.size_of_uninitialized_data);
        writer.write_le(self.address_of_entry_point);
        writer.write_le(self.base_of_code);

        if self.is_pe64() {
            writer.write_le(self.image_base);
        } else {
            writer.write_le(self.base_of_data);
            writer.write_le(self.image_base as u32);
        }

        writer.write_le(self.section_alignment);
        writer.write_le(self.file_alignment);
        writer.write_le(self.major_operating_system_version);
        writer.write_le(self.minor_operating_system_version);
        writer.write_le(self.major_image_version);
        writer.write_le(self.minor_image_version);
        writer.write_le(self.major_subsystem_version);
        writer.write_le(self.minor_subsystem_version);
        writer.write_le(self.win32_version_value);
        writer.write_le(self.size_of_image);
        writer.write_le(self.size_of_headers);
        writer.write_le(self.checksum);
        writer.write_le(self.subsystem);
        writer.write_le(self.dll_characteristics);

        if self.is_pe64() {
            writer.write_le(self.size_of_stack_reserve);
            writer.write_le(self.size_of_stack_commit);
            writer.write_le(self.size_of_heap_reserve);
            writer.write_le(self.size_of_heap_commit);
        } else {
            writer.write_le(self.size_of_stack_reserve as u32);
            writer.write_le(self.size_of_stack_commit as u32);
            writer.write_le(self.size_of_heap_reserve as u32);
            writer.write_le(self.size_of_heap_commit as u32);
        }

        writer.write_le(self.loader_flags);
        writer.write_le(self.number_of_rva_and_sizes);

        for directory in &self.data_directories {
            writer.write_le(directory.rva);
            writer.write_le(directory.size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_optional(magic: u16) -> OptionalHeader {
        OptionalHeader {
            magic,
            major_linker_version: 0x30,
            minor_linker_version: 0,
            size_of_code: 0x400,
            size_of_initialized_data: 0x200,
            size_of_uninitialized_data: 0,
            address_of_entry_point: 0x2352,
            base_of_code: 0x2000,
            base_of_data: 0x4000,
            image_base: 0x40_0000,
            section_alignment: 0x2000,
            file_alignment: 0x200,
            major_operating_system_version: 4,
            minor_operating_system_version: 0,
            major_image_version: 0,
            minor_image_version: 0,
            major_subsystem_version: 4,
            minor_subsystem_version: 0,
            win32_version_value: 0,
            size_of_image: 0x8000,
            size_of_headers: 0x200,
            checksum: 0,
            subsystem: 3,
            dll_characteristics: 0x8540,
            size_of_stack_reserve: 0x10_0000,
            size_of_stack_commit: 0x1000,
            size_of_heap_reserve: 0x10_0000,
            size_of_heap_commit: 0x1000,
            loader_flags: 0,
            number_of_rva_and_sizes: DATA_DIRECTORY_COUNT as u32,
            data_directories: [DataDirectory::default(); DATA_DIRECTORY_COUNT],
        }
    }

    #[test]
    fn optional_header_round_trip_pe32() {
        let header = sample_optional(MAGIC_PE32);
        let mut writer = Writer::new();
        header.write(&mut writer);
        assert_eq!(writer.len(), 224);

        let bytes = writer.into_bytes();
        let read = OptionalHeader::read(&mut Parser::new(&bytes)).unwrap();
        assert_eq!(read.magic, MAGIC_PE32);
        assert_eq!(read.image_base, 0x40_0000);
        assert_eq!(read.base_of_data, 0x4000);
        assert_eq!(read.address_of_entry_point, 0x2352);
    }

    #[test]
    fn optional_header_round_trip_pe64() {
        let mut header = sample_optional(MAGIC_PE64);
        header.image_base = 0x1_4000_0000;
        let mut writer = Writer::new();
        header.write(&mut writer);
        assert_eq!(writer.len(), 240);

        let bytes = writer.into_bytes();
        let read = OptionalHeader::read(&mut Parser::new(&bytes)).unwrap();
        assert!(read.is_pe64());
        assert_eq!(read.image_base, 0x1_4000_0000);
    }

    #[test]
    fn coff_round_trip() {
        let header = CoffFileHeader {
            machine: MACHINE_I386,
            number_of_sections: 3,
            time_date_stamp: 0x5F00_0000,
            pointer_to_symbol_table: 0,
            number_of_symbols: 0,
            size_of_optional_header: 224,
            characteristics: FileCharacteristics::EXECUTABLE_IMAGE
                | FileCharacteristics::MACHINE_32BIT,
        };
        let mut writer = Writer::new();
        header.write(&mut writer);
        assert_eq!(writer.len(), 20);

        let bytes = writer.into_bytes();
        let read = CoffFileHeader::read(&mut Parser::new(&bytes)).unwrap();
        assert_eq!(read.machine, MACHINE_I386);
        assert_eq!(read.number_of_sections, 3);
        assert!(read
            .characteristics
            .contains(FileCharacteristics::EXECUTABLE_IMAGE));
    }

    #[test]
    fn invalid_magic_rejected() {
        let bytes = [0xCC, 0xCC];
        assert!(OptionalHeader::read(&mut Parser::new(&bytes)).is_err());
    }
}
