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

//! Lazy PE image reader.
//!
//! [`PeImage::parse`] validates only the header chain: DOS stub, `PE\0\0`
//! signature, COFF header, optional header, section table. Everything hanging
//! off a data directory is decoded on first access and memoized, and decoding
//! is tolerant: damage inside a directory is recorded as an issue and yields
//! an absent or partial result instead of failing the whole image.

use std::path::Path;
use std::sync::OnceLock;

use crate::{
    diagnostics::{ErrorSink, IssueCollector},
    file::{parser::Parser, File},
    metadata::{cor20::Cor20Header, root::MetadataRoot},
    pe::{
        debug::{DebugEntry, DEBUG_ENTRY_SIZE},
        headers::{directory_index, CoffFileHeader, OptionalHeader},
        import::ImportedSymbol,
        resource::{read_resource_directory, ParsedResourceDirectory},
        section::SectionHeader,
        translator::SectionMap,
    },
    Error, Result,
};

/// One module of the parsed import directory.
#[derive(Debug)]
pub struct ParsedImportModule {
    /// Name of the imported library.
    pub library: String,
    /// Symbols in import address table order.
    pub symbols: Vec<ImportedSymbol>,
}

/// One slot of the parsed export address table.
#[derive(Debug)]
pub struct ParsedExport {
    /// Export name; `None` for ordinal-only exports.
    pub name: Option<String>,
    /// The symbol's ordinal.
    pub ordinal: u32,
    /// RVA of the exported code or data.
    pub rva: u32,
}

/// The parsed export directory.
#[derive(Debug)]
pub struct ParsedExportDirectory {
    /// Name the library exports under.
    pub library: String,
    /// Exports in address table order.
    pub exports: Vec<ParsedExport>,
}

/// One base relocation block covering a 4KB page.
#[derive(Debug)]
pub struct RelocBlock {
    /// RVA of the page the block relocates.
    pub page_rva: u32,
    /// `(type, offset-in-page)` entries, absolute padding stripped.
    pub entries: Vec<(u16, u16)>,
}

/// The parsed CLR anchor: COR20 header plus the metadata root directory.
#[derive(Debug)]
pub struct ParsedClr {
    /// The COR20 header from data directory 14.
    pub header: Cor20Header,
    /// The metadata root, when the header's metadata directory resolves.
    pub root: Option<MetadataRoot>,
    metadata_offset: u64,
}

type Lazy<T> = OnceLock<(T, Vec<Error>)>;

/// A parsed PE image over an open file.
pub struct PeImage {
    file: File,
    coff: CoffFileHeader,
    optional: OptionalHeader,
    sections: Vec<SectionHeader>,
    map: SectionMap,
    imports: Lazy<Vec<ParsedImportModule>>,
    exports: Lazy<Option<ParsedExportDirectory>>,
    resources: Lazy<Option<ParsedResourceDirectory>>,
    relocations: Lazy<Vec<RelocBlock>>,
    debug_entries: Lazy<Vec<DebugEntry>>,
    clr: Lazy<Option<ParsedClr>>,
}

impl PeImage {
    /// Map and parse the image at `path`.
    ///
    /// # Errors
    /// Fails on I/O errors or a damaged header chain.
    pub fn from_file(path: &Path) -> Result<PeImage> {
        Self::parse(File::from_file(path)?)
    }

    /// Parse an in-memory image.
    ///
    /// # Errors
    /// Fails on a damaged header chain.
    pub fn from_mem(data: Vec<u8>) -> Result<PeImage> {
        Self::parse(File::from_mem(data)?)
    }

    /// Parse the header chain of `file`.
    ///
    /// # Errors
    /// Returns [`Error::Malformed`] on bad signatures and
    /// [`Error::OutOfBounds`] on truncation. Directory contents are not
    /// touched here.
    pub fn parse(file: File) -> Result<PeImage> {
        let mut parser = Parser::new(file.data());
        if parser.read_le::<u16>()? != 0x5A4D {
            return Err(malformed_error!("Missing MZ signature"));
        }
        parser.seek(0x3C)?;
        let e_lfanew = parser.read_le::<u32>()? as usize;
        parser.seek(e_lfanew)?;
        if parser.read_le::<u32>()? != 0x0000_4550 {
            return Err(malformed_error!(
                "Missing PE signature at {:#x}",
                e_lfanew
            ));
        }

        let coff = CoffFileHeader::read(&mut parser)?;
        let optional_start = parser.pos();
        let optional = OptionalHeader::read(&mut parser)?;
        // The section table starts after the declared optional header size,
        // which linkers may pad beyond the structure we parse.
        parser.seek(optional_start + usize::from(coff.size_of_optional_header))?;

        let mut sections = Vec::with_capacity(usize::from(coff.number_of_sections));
        for _ in 0..coff.number_of_sections {
            sections.push(SectionHeader::read(&mut parser)?);
        }
        let map = SectionMap::from_spans(sections.iter().map(SectionHeader::span).collect());

        Ok(PeImage {
            file,
            coff,
            optional,
            sections,
            map,
            imports: OnceLock::new(),
            exports: OnceLock::new(),
            resources: OnceLock::new(),
            relocations: OnceLock::new(),
            debug_entries: OnceLock::new(),
            clr: OnceLock::new(),
        })
    }

    /// The COFF file header.
    #[must_use]
    pub fn coff(&self) -> &CoffFileHeader {
        &self.coff
    }

    /// The optional header.
    #[must_use]
    pub fn optional_header(&self) -> &OptionalHeader {
        &self.optional
    }

    /// Section headers in file order.
    #[must_use]
    pub fn sections(&self) -> &[SectionHeader] {
        &self.sections
    }

    /// The RVA to file offset translator over the section table.
    #[must_use]
    pub fn section_map(&self) -> &SectionMap {
        &self.map
    }

    /// The raw bytes of the underlying file.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        self.file.data()
    }

    /// The bytes a directory entry points at, clamped to the file.
    ///
    /// Returns `Ok(None)` for an absent directory; an RVA outside every
    /// section is an error for the caller's sink.
    fn directory_data(&self, index: usize) -> Result<Option<&[u8]>> {
        let directory = &self.optional.data_directories[index];
        if !directory.is_present() {
            return Ok(None);
        }
        let offset = self.map.rva_to_offset(directory.rva)? as usize;
        let available = self
            .file
            .len()
            .saturating_sub(offset)
            .min(directory.size as usize);
        Some(self.file.slice(offset, available)).transpose()
    }

    fn string_at_rva(&self, rva: u32) -> Result<String> {
        let offset = self.map.rva_to_offset(rva)? as usize;
        let mut parser = Parser::new(self.file.data());
        parser.seek(offset)?;
        Ok(parser.read_string_utf8()?.to_string())
    }

    /// The import directory, parsed on first access.
    pub fn imports(&self) -> &[ParsedImportModule] {
        &self
            .imports
            .get_or_init(|| {
                let mut sink = IssueCollector::new();
                let modules = self.parse_imports(&mut sink).unwrap_or_default();
                (modules, sink.into_issues())
            })
            .0
    }

    /// The export directory, parsed on first access.
    pub fn exports(&self) -> Option<&ParsedExportDirectory> {
        self.exports
            .get_or_init(|| {
                let mut sink = IssueCollector::new();
                let directory = match self.parse_exports() {
                    Ok(directory) => directory,
                    Err(error) => {
                        let _ = sink.report(error);
                        None
                    }
                };
                (directory, sink.into_issues())
            })
            .0
            .as_ref()
    }

    /// The Win32 resource tree, parsed on first access.
    pub fn resources(&self) -> Option<&ParsedResourceDirectory> {
        self.resources
            .get_or_init(|| {
                let mut sink = IssueCollector::new();
                let tree = match self.directory_data(directory_index::RESOURCE) {
                    Ok(Some(data)) => read_resource_directory(data, &mut sink).ok(),
                    Ok(None) => None,
                    Err(error) => {
                        let _ = sink.report(error);
                        None
                    }
                };
                (tree, sink.into_issues())
            })
            .0
            .as_ref()
    }

    /// The base relocation blocks, parsed on first access.
    pub fn relocations(&self) -> &[RelocBlock] {
        &self
            .relocations
            .get_or_init(|| {
                let mut sink = IssueCollector::new();
                let blocks = self.parse_relocations(&mut sink).unwrap_or_default();
                (blocks, sink.into_issues())
            })
            .0
    }

    /// The debug directory entries, parsed on first access.
    pub fn debug_entries(&self) -> &[DebugEntry] {
        &self
            .debug_entries
            .get_or_init(|| {
                let mut sink = IssueCollector::new();
                let entries = self.parse_debug(&mut sink).unwrap_or_default();
                (entries, sink.into_issues())
            })
            .0
    }

    /// The CLR header and metadata root, parsed on first access.
    ///
    /// `None` when data directory 14 is absent or unmappable.
    pub fn clr(&self) -> Option<&ParsedClr> {
        self.clr
            .get_or_init(|| {
                let mut sink = IssueCollector::new();
                let clr = match self.parse_clr(&mut sink) {
                    Ok(clr) => clr,
                    Err(error) => {
                        let _ = sink.report(error);
                        None
                    }
                };
                (clr, sink.into_issues())
            })
            .0
            .as_ref()
    }

    /// The raw bytes of the metadata stream named `name`, when the image has
    /// a metadata root declaring it.
    pub fn metadata_stream(&self, name: &str) -> Option<&[u8]> {
        let clr = self.clr()?;
        let root = clr.root.as_ref()?;
        let header = root.stream(name)?;
        let start = clr.metadata_offset as usize + header.offset as usize;
        self.file.slice(start, header.size as usize).ok()
    }

    /// All issues recorded by the directory parsers run so far.
    pub fn issues(&self) -> Vec<&Error> {
        let mut issues: Vec<&Error> = Vec::new();
        if let Some((_, cell)) = self.imports.get() {
            issues.extend(cell);
        }
        if let Some((_, cell)) = self.exports.get() {
            issues.extend(cell);
        }
        if let Some((_, cell)) = self.resources.get() {
            issues.extend(cell);
        }
        if let Some((_, cell)) = self.relocations.get() {
            issues.extend(cell);
        }
        if let Some((_, cell)) = self.debug_entries.get() {
            issues.extend(cell);
        }
        if let Some((_, cell)) = self.clr.get() {
            issues.extend(cell);
        }
        issues
    }

    fn parse_imports(&self, sink: &mut IssueCollector) -> Result<Vec<ParsedImportModule>> {
        let Some(data) = sink.absorb(self.directory_data(directory_index::IMPORT))? else {
            return Ok(Vec::new());
        };
        let Some(data) = data else {
            return Ok(Vec::new());
        };

        let thunk_size = if self.optional.is_pe64() { 8 } else { 4 };
        let mut modules = Vec::new();
        let mut parser = Parser::new(data);

        loop {
            if parser.len() - parser.pos() < 20 {
                let _ = sink.report(malformed_error!(
                    "Import descriptor table is missing its null terminator"
                ));
                break;
            }
            let original_first_thunk = parser.read_le::<u32>()?;
            parser.advance_by(8)?; // timestamp, forwarder chain
            let name_rva = parser.read_le::<u32>()?;
            let first_thunk = parser.read_le::<u32>()?;
            if original_first_thunk == 0
                && name_rva == 0
                && first_thunk == 0
            {
                break;
            }

            let Some(library) = sink.absorb(self.string_at_rva(name_rva))? else {
                continue;
            };

            let lookup_rva = if original_first_thunk != 0 {
                original_first_thunk
            } else {
                first_thunk
            };
            let symbols = match sink.absorb(self.parse_thunks(lookup_rva, thunk_size))? {
                Some(symbols) => symbols,
                None => Vec::new(),
            };
            modules.push(ParsedImportModule { library, symbols });
        }

        Ok(modules)
    }

    fn parse_thunks(&self, rva: u32, thunk_size: usize) -> Result<Vec<ImportedSymbol>> {
        let offset = self.map.rva_to_offset(rva)? as usize;
        let mut parser = Parser::new(self.file.data());
        parser.seek(offset)?;

        let mut symbols = Vec::new();
        loop {
            let raw = if thunk_size == 8 {
                parser.read_le::<u64>()?
            } else {
                u64::from(parser.read_le::<u32>()?)
            };
            if raw == 0 {
                break;
            }
            let ordinal_flag = 1u64 << (thunk_size * 8 - 1);
            if raw & ordinal_flag != 0 {
                symbols.push(ImportedSymbol::Ordinal(raw as u16));
            } else {
                let entry_offset = self.map.rva_to_offset(raw as u32)? as usize;
                let mut entry = Parser::new(self.file.data());
                entry.seek(entry_offset)?;
                let hint = entry.read_le::<u16>()?;
                let name = entry.read_string_utf8()?.to_string();
                symbols.push(ImportedSymbol::Name { hint, name });
            }
        }
        Ok(symbols)
    }

    fn parse_exports(&self) -> Result<Option<ParsedExportDirectory>> {
        let Some(data) = self.directory_data(directory_index::EXPORT)? else {
            return Ok(None);
        };

        let mut parser = Parser::new(data);
        parser.advance_by(12)?; // characteristics, timestamp, version
        let name_rva = parser.read_le::<u32>()?;
        let ordinal_base = parser.read_le::<u32>()?;
        let function_count = parser.read_le::<u32>()?;
        let name_count = parser.read_le::<u32>()?;
        let address_table_rva = parser.read_le::<u32>()?;
        let name_pointer_rva = parser.read_le::<u32>()?;
        let ordinal_table_rva = parser.read_le::<u32>()?;

        let library = self.string_at_rva(name_rva)?;

        let address_offset = self.map.rva_to_offset(address_table_rva)? as usize;
        let mut addresses = Parser::new(self.file.data());
        addresses.seek(address_offset)?;
        let mut exports: Vec<ParsedExport> = (0..function_count)
            .map(|slot| {
                Ok(ParsedExport {
                    name: None,
                    ordinal: ordinal_base + slot,
                    rva: addresses.read_le::<u32>()?,
                })
            })
            .collect::<Result<_>>()?;

        let mut names = Parser::new(self.file.data());
        names.seek(self.map.rva_to_offset(name_pointer_rva)? as usize)?;
        let mut ordinals = Parser::new(self.file.data());
        ordinals.seek(self.map.rva_to_offset(ordinal_table_rva)? as usize)?;
        for _ in 0..name_count {
            let name = self.string_at_rva(names.read_le::<u32>()?)?;
            let slot = usize::from(ordinals.read_le::<u16>()?);
            if slot >= exports.len() {
                return Err(malformed_error!(
                    "Export ordinal table names slot {} of {}",
                    slot,
                    exports.len()
                ));
            }
            exports[slot].name = Some(name);
        }

        Ok(Some(ParsedExportDirectory { library, exports }))
    }

    fn parse_relocations(&self, sink: &mut IssueCollector) -> Result<Vec<RelocBlock>> {
        let Some(data) = sink.absorb(self.directory_data(directory_index::BASE_RELOCATION))?
        else {
            return Ok(Vec::new());
        };
        let Some(data) = data else {
            return Ok(Vec::new());
        };

        let mut blocks = Vec::new();
        let mut parser = Parser::new(data);
        while parser.len() - parser.pos() >= 8 {
            let page_rva = parser.read_le::<u32>()?;
            let block_size = parser.read_le::<u32>()? as usize;
            if block_size < 8 || block_size % 2 != 0 {
                let _ = sink.report(malformed_error!(
                    "Relocation block at page {:#010x} declares size {}",
                    page_rva,
                    block_size
                ));
                break;
            }
            let mut entries = Vec::with_capacity((block_size - 8) / 2);
            for _ in 0..(block_size - 8) / 2 {
                let packed = match sink.absorb(parser.read_le::<u16>())? {
                    Some(packed) => packed,
                    None => return Ok(blocks),
                };
                let kind = packed >> 12;
                if kind != super::reloc::IMAGE_REL_BASED_ABSOLUTE {
                    entries.push((kind, packed & 0x0FFF));
                }
            }
            blocks.push(RelocBlock { page_rva, entries });
        }
        Ok(blocks)
    }

    fn parse_debug(&self, sink: &mut IssueCollector) -> Result<Vec<DebugEntry>> {
        let Some(data) = sink.absorb(self.directory_data(directory_index::DEBUG))? else {
            return Ok(Vec::new());
        };
        let Some(data) = data else {
            return Ok(Vec::new());
        };

        let mut entries = Vec::new();
        let mut parser = Parser::new(data);
        for _ in 0..data.len() / DEBUG_ENTRY_SIZE as usize {
            entries.push(DebugEntry::read(&mut parser)?);
        }
        Ok(entries)
    }

    fn parse_clr(&self, sink: &mut IssueCollector) -> Result<Option<ParsedClr>> {
        let Some(data) = self.directory_data(directory_index::CLR)? else {
            return Ok(None);
        };

        let header = Cor20Header::read(&mut Parser::new(data))?;
        if !header.metadata.is_present() {
            return Ok(Some(ParsedClr {
                header,
                root: None,
                metadata_offset: 0,
            }));
        }

        let metadata_offset = self.map.rva_to_offset(header.metadata.rva)?;
        let root = {
            let mut parser = Parser::new(self.file.data());
            parser.seek(metadata_offset as usize)?;
            sink.absorb(MetadataRoot::read(&mut parser))?
        };

        Ok(Some(ParsedClr {
            header,
            root,
            metadata_offset,
        }))
    }
}
