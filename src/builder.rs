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

//! Top-level image assembly: orchestrates the section, directory and metadata
//! builders into final file bytes.
//!
//! [`PeImageBuilder`] owns the segment arena and every content buffer. Callers
//! populate the buffers (metadata rows, method bodies, imports, resources),
//! then [`PeImageBuilder::build`] runs the full pipeline: section policy,
//! offset assignment, reference resolution, header synthesis, byte emission.
//!
//! Section policy follows the loader's expectations: `.text` always exists and
//! carries the import address table (first, so the loader's writes stay inside
//! one page run), the COR20 header, method bodies, field data, manifest
//! resources, the metadata root, the remaining directories and the bootstrap
//! stub. `.rsrc` exists iff Win32 resources were added, `.reloc` iff any base
//! relocation exists.

use crate::{
    file::writer::Writer,
    layout::{
        align_up, Patch, Reference, RefKind, SegmentArena, SegmentId, SegmentKind,
    },
    metadata::{
        bodies::{MethodBody, MethodBodyBuffer},
        cor20::{Cor20Flags, Cor20HeaderBuilder, COR20_HEADER_SIZE},
        resources::{FieldDataBuffer, ManifestResourceBuffer},
        root::MetadataBuilder,
        token::Token,
    },
    pe::{
        debug::DebugDirectoryBuffer,
        export::ExportDirectoryBuffer,
        headers::{
            directory_index, CoffFileHeader, DataDirectory, FileCharacteristics,
            OptionalHeader, DATA_DIRECTORY_COUNT, DOS_STUB, MACHINE_AMD64, MACHINE_I386,
            MAGIC_PE32, MAGIC_PE64,
        },
        import::{ImportDirectoryBuffer, ImportedSymbol, ModuleHandle},
        reloc::{RelocDirectoryBuffer, IMAGE_REL_BASED_HIGHLOW},
        resource::{ResourceData, ResourceDirectoryBuffer, ResourceId},
        section::{SectionFlags, SectionHeader, SectionTableBuilder},
    },
    Error, Result,
};

/// Image-wide layout knobs with loader-friendly defaults.
#[derive(Debug, Clone)]
pub struct PeBuilderConfig {
    /// Target machine (`MACHINE_I386` or `MACHINE_AMD64`).
    pub machine: u16,
    /// Preferred load address.
    pub image_base: u64,
    /// In-memory section alignment. Must stay a multiple of 4KB so the base
    /// relocation page math holds.
    pub section_alignment: u32,
    /// On-disk section alignment.
    pub file_alignment: u32,
    /// Windows subsystem (3 = console, 2 = GUI).
    pub subsystem: u16,
    /// Emit a DLL instead of an executable.
    pub is_dll: bool,
    /// Runtime version string for the metadata root.
    pub runtime_version: String,
}

impl Default for PeBuilderConfig {
    fn default() -> Self {
        PeBuilderConfig {
            machine: MACHINE_I386,
            image_base: 0x40_0000,
            section_alignment: 0x2000,
            file_alignment: 0x200,
            subsystem: 3,
            is_dll: false,
            runtime_version: "v4.0.30319".to_string(),
        }
    }
}

impl PeBuilderConfig {
    /// `true` when the target uses the PE32+ layout.
    #[must_use]
    pub fn is_pe64(&self) -> bool {
        self.machine == MACHINE_AMD64
    }
}

/// Assembles a complete managed PE image.
pub struct PeImageBuilder {
    config: PeBuilderConfig,
    arena: SegmentArena,
    /// The metadata content buffers. Callers populate heaps and table rows
    /// directly; insertion offsets and tokens are final immediately.
    pub metadata: MetadataBuilder,
    /// COR20 runtime flags.
    pub cor20_flags: Cor20Flags,
    bodies: MethodBodyBuffer,
    field_data: FieldDataBuffer,
    manifest_resources: ManifestResourceBuffer,
    imports: ImportDirectoryBuffer,
    import_module_count: usize,
    force_import_directory: bool,
    exports: Option<ExportDirectoryBuffer>,
    win32_resources: ResourceDirectoryBuffer,
    debug: DebugDirectoryBuffer,
    entry_point_token: Token,
    strong_name_size: u32,
}

impl PeImageBuilder {
    /// Create a builder for the given configuration.
    ///
    /// # Errors
    /// Returns [`crate::Error::Error`] for an invalid configuration: either
    /// alignment not a power of two, a section alignment that breaks the 4KB
    /// relocation page granularity, or a file alignment exceeding the section
    /// alignment. Propagates arena failures from the content buffer roots.
    pub fn new(config: PeBuilderConfig) -> Result<Self> {
        if !config.section_alignment.is_power_of_two()
            || !config.file_alignment.is_power_of_two()
        {
            return Err(Error::Error(format!(
                "Alignments must be powers of two - section {:#x}, file {:#x}",
                config.section_alignment, config.file_alignment
            )));
        }
        if config.section_alignment % 0x1000 != 0 {
            return Err(Error::Error(format!(
                "Section alignment {:#x} is not a multiple of the 4KB relocation page",
                config.section_alignment
            )));
        }
        if config.file_alignment > config.section_alignment {
            return Err(Error::Error(format!(
                "File alignment {:#x} exceeds section alignment {:#x}",
                config.file_alignment, config.section_alignment
            )));
        }

        let mut arena = SegmentArena::new();
        let bodies = MethodBodyBuffer::new(&mut arena)?;
        let field_data = FieldDataBuffer::new(&mut arena)?;
        let metadata = MetadataBuilder::new(&config.runtime_version);
        let imports = ImportDirectoryBuffer::new(config.is_pe64());
        Ok(PeImageBuilder {
            config,
            arena,
            metadata,
            cor20_flags: Cor20Flags::IL_ONLY,
            bodies,
            field_data,
            manifest_resources: ManifestResourceBuffer::new(),
            imports,
            import_module_count: 0,
            force_import_directory: false,
            exports: None,
            win32_resources: ResourceDirectoryBuffer::new(),
            debug: DebugDirectoryBuffer::new(),
            entry_point_token: Token::new(0),
            strong_name_size: 0,
        })
    }

    /// The managed entry point token written into the COR20 header.
    pub fn set_entry_point(&mut self, token: Token) {
        self.entry_point_token = token;
    }

    /// Serialize a method body and return the segment its `MethodDef` row's
    /// RVA column references.
    ///
    /// # Errors
    /// Propagates encoding failures and phase violations.
    pub fn add_method_body(&mut self, body: &MethodBody) -> Result<SegmentId> {
        self.bodies.add_body(&mut self.arena, body)
    }

    /// Add a pre-encoded native body blob.
    ///
    /// # Errors
    /// Propagates phase violations.
    pub fn add_native_body(&mut self, data: Vec<u8>, alignment: u32) -> Result<SegmentId> {
        self.bodies.add_native(&mut self.arena, data, alignment)
    }

    /// Add one field's initial value and return the segment its `FieldRva`
    /// row references.
    ///
    /// # Errors
    /// Propagates phase violations.
    pub fn add_field_data(&mut self, data: Vec<u8>, alignment: u32) -> Result<SegmentId> {
        self.field_data.add(&mut self.arena, data, alignment)
    }

    /// Add one embedded manifest resource payload and return the offset a
    /// `ManifestResource` row stores.
    pub fn add_manifest_resource(&mut self, payload: &[u8]) -> u32 {
        self.manifest_resources.add(payload)
    }

    /// Register an imported module.
    pub fn import_module(&mut self, name: &str) -> ModuleHandle {
        self.import_module_count += 1;
        self.imports.add_module(name)
    }

    /// Register a symbol imported from `module`, returning its slot in the
    /// module's import address table.
    pub fn import_symbol(&mut self, module: ModuleHandle, symbol: ImportedSymbol) -> usize {
        self.imports.add_symbol(module, symbol)
    }

    /// Emit the import directory even with zero modules (sentinel only).
    pub fn require_import_directory(&mut self) {
        self.force_import_directory = true;
    }

    /// The export directory buffer, created on first use with `library_name`.
    pub fn exports(&mut self, library_name: &str) -> &mut ExportDirectoryBuffer {
        self.exports
            .get_or_insert_with(|| ExportDirectoryBuffer::new(library_name))
    }

    /// Add a Win32 resource leaf under `path`.
    ///
    /// # Errors
    /// Fails on an empty path, a path through an existing leaf, or a
    /// duplicate leaf.
    pub fn add_win32_resource(&mut self, path: &[ResourceId], data: ResourceData) -> Result<()> {
        self.win32_resources.add_data(path, data)
    }

    /// Add a debug directory entry carrying `data`.
    ///
    /// # Errors
    /// Propagates phase violations.
    pub fn add_debug_entry(
        &mut self,
        data_type: u32,
        time_date_stamp: u32,
        data: Vec<u8>,
    ) -> Result<()> {
        self.debug
            .add_entry(&mut self.arena, data_type, time_date_stamp, data)
    }

    /// Reserve `size` zero bytes for an externally computed strong-name
    /// signature and flag the image as signed.
    pub fn reserve_strong_name(&mut self, size: u32) {
        self.strong_name_size = size;
    }

    /// Run the full pipeline and return the final file bytes.
    ///
    /// # Errors
    /// Returns the first fatal build error; a partially assembled image is
    /// never emitted.
    pub fn build(self) -> Result<Vec<u8>> {
        let PeImageBuilder {
            config,
            mut arena,
            metadata,
            cor20_flags,
            bodies,
            field_data,
            manifest_resources,
            mut imports,
            import_module_count,
            force_import_directory,
            exports,
            win32_resources,
            debug,
            entry_point_token,
            strong_name_size,
        } = self;

        let is_pe64 = config.is_pe64();

        // 32-bit images bootstrap through the CLR loader thunk; register the
        // import before the directory is serialized.
        let stub_import = if is_pe64 {
            None
        } else {
            let module = imports.add_module("mscoree.dll");
            let name = if config.is_dll {
                "_CorDllMain"
            } else {
                "_CorExeMain"
            };
            let slot = imports.add_symbol(
                module,
                ImportedSymbol::Name {
                    hint: 0,
                    name: name.to_string(),
                },
            );
            Some((import_module_count, slot))
        };

        let text = arena.add_composite()?;

        let metadata_root = metadata.build(&mut arena)?;
        let metadata_size = arena.physical_size(metadata_root) as u32;

        let manifest_size = manifest_resources.size() as u32;
        let manifest = manifest_resources.into_segment(&mut arena)?;

        let strong_name = if strong_name_size > 0 {
            Some(arena.add_aligned(SegmentKind::Zero(strong_name_size), 4)?)
        } else {
            None
        };

        let mut cor20 = Cor20HeaderBuilder::new(metadata_root, metadata_size);
        cor20.flags = cor20_flags;
        cor20.entry_point_token = entry_point_token;
        if let Some(segment) = manifest {
            cor20.set_resources(segment, manifest_size);
        }
        if let Some(segment) = strong_name {
            cor20.set_strong_name(segment, strong_name_size);
        }
        let cor20_segment = cor20.build(&mut arena)?;

        let built_imports = if imports.is_empty() && !force_import_directory {
            None
        } else {
            Some(imports.build(&mut arena)?)
        };
        let built_debug = if debug.is_empty() {
            None
        } else {
            Some(debug.build(&mut arena)?)
        };
        let built_exports = match exports {
            Some(buffer) if !buffer.is_empty() => Some(buffer.build(&mut arena)?),
            _ => None,
        };

        // .text assembly order; the IAT leads so data directory 12 points at
        // the front of the section.
        if let Some(built) = &built_imports {
            arena.push_child(text, built.iat_root)?;
        }
        arena.push_child(text, cor20_segment)?;
        arena.push_child(text, bodies.root())?;
        arena.push_child(text, field_data.root())?;
        if let Some(segment) = manifest {
            arena.push_child(text, segment)?;
        }
        if let Some(segment) = strong_name {
            arena.push_child(text, segment)?;
        }
        arena.push_child(text, metadata_root)?;
        if let Some(built) = &built_debug {
            arena.push_child(text, built.root)?;
        }
        if let Some(built) = &built_imports {
            arena.push_child(text, built.directory_root)?;
        }
        if let Some(built) = &built_exports {
            arena.push_child(text, built.root)?;
        }

        let mut relocs = RelocDirectoryBuffer::new();
        let stub = match (&stub_import, &built_imports) {
            (Some((module_index, slot)), Some(built)) => {
                let target = built.address_tables[*module_index];
                let stub = arena.add_aligned(
                    SegmentKind::Patchable {
                        data: vec![0xFF, 0x25, 0, 0, 0, 0],
                        patches: vec![Patch {
                            at: 2,
                            reference: Reference {
                                target,
                                delta: (*slot as u32 * built.thunk_size) as i64,
                                kind: RefKind::Va,
                            },
                        }],
                    },
                    4,
                )?;
                arena.push_child(text, stub)?;
                relocs.add(&arena, text, stub, 2, IMAGE_REL_BASED_HIGHLOW)?;
                Some(stub)
            }
            _ => None,
        };

        let built_resources = if win32_resources.is_empty() {
            None
        } else {
            Some(win32_resources.build(&mut arena)?)
        };
        let built_relocs = if relocs.is_empty() {
            None
        } else {
            Some(relocs.build(&mut arena)?)
        };

        let mut sections = SectionTableBuilder::new(config.section_alignment, config.file_alignment);
        sections.add_section(
            ".text",
            SectionFlags::CNT_CODE | SectionFlags::MEM_EXECUTE | SectionFlags::MEM_READ,
            text,
        );
        let mut contents = vec![text];
        if let Some(built) = &built_resources {
            sections.add_section(
                ".rsrc",
                SectionFlags::CNT_INITIALIZED_DATA | SectionFlags::MEM_READ,
                built.root,
            );
            contents.push(built.root);
        }
        if let Some(built) = &built_relocs {
            sections.add_section(
                ".reloc",
                SectionFlags::CNT_INITIALIZED_DATA
                    | SectionFlags::MEM_READ
                    | SectionFlags::MEM_DISCARDABLE,
                built.root,
            );
            contents.push(built.root);
        }

        let optional_size: u16 = if is_pe64 { 240 } else { 224 };
        let headers_raw = 0x80
            + 4
            + 20
            + u32::from(optional_size)
            + SectionHeader::SIZE * sections.len() as u32;
        let size_of_headers =
            align_up(u64::from(headers_raw), u64::from(config.file_alignment)) as u32;

        let laid = sections.assign_offsets(&mut arena, headers_raw)?;
        let size_of_image = laid.size_of_image();
        let file_end = laid.file_end();
        let headers: Vec<SectionHeader> = laid.headers().to_vec();

        // Data directory table: addresses are final now, values recorded
        // before the resolve pass patches the segment contents.
        let mut directories = [DataDirectory { rva: 0, size: 0 }; DATA_DIRECTORY_COUNT];
        if let Some(built) = &built_exports {
            directories[directory_index::EXPORT] = DataDirectory {
                rva: arena.rva(built.directory)?,
                size: arena.physical_size(built.root) as u32,
            };
        }
        if let Some(built) = &built_imports {
            directories[directory_index::IMPORT] = DataDirectory {
                rva: arena.rva(built.descriptor_table)?,
                size: built.directory_size,
            };
            if built.iat_size > 0 {
                directories[directory_index::IAT] = DataDirectory {
                    rva: arena.rva(built.iat_root)?,
                    size: built.iat_size,
                };
            }
        }
        if let Some(built) = &built_resources {
            directories[directory_index::RESOURCE] = DataDirectory {
                rva: arena.rva(built.root)?,
                size: arena.physical_size(built.root) as u32,
            };
        }
        if let Some(built) = &built_relocs {
            directories[directory_index::BASE_RELOCATION] = DataDirectory {
                rva: arena.rva(built.root)?,
                size: built.size,
            };
        }
        if let Some(built) = &built_debug {
            directories[directory_index::DEBUG] = DataDirectory {
                rva: arena.rva(built.table)?,
                size: built.table_size,
            };
        }
        directories[directory_index::CLR] = DataDirectory {
            rva: arena.rva(cor20_segment)?,
            size: COR20_HEADER_SIZE,
        };

        let address_of_entry_point = match stub {
            Some(stub) => arena.rva(stub)?,
            None => 0,
        };
        let base_of_code = arena.rva(text)?;
        let size_of_code = headers[0].size_of_raw_data;
        let size_of_initialized_data = headers[1..]
            .iter()
            .map(|header| header.size_of_raw_data)
            .sum();
        let base_of_data = headers
            .get(1)
            .map_or(0, |header| header.virtual_address);

        let table = laid.resolve(&mut arena, config.image_base)?;

        let mut characteristics = FileCharacteristics::EXECUTABLE_IMAGE;
        if is_pe64 {
            characteristics |= FileCharacteristics::LARGE_ADDRESS_AWARE;
        } else {
            characteristics |= FileCharacteristics::MACHINE_32BIT;
        }
        if config.is_dll {
            characteristics |= FileCharacteristics::DLL;
        }
        let coff = CoffFileHeader {
            machine: config.machine,
            number_of_sections: headers.len() as u16,
            time_date_stamp: 0,
            pointer_to_symbol_table: 0,
            number_of_symbols: 0,
            size_of_optional_header: optional_size,
            characteristics,
        };

        let optional = OptionalHeader {
            magic: if is_pe64 { MAGIC_PE64 } else { MAGIC_PE32 },
            major_linker_version: 11,
            minor_linker_version: 0,
            size_of_code,
            size_of_initialized_data,
            size_of_uninitialized_data: 0,
            address_of_entry_point,
            base_of_code,
            base_of_data,
            image_base: config.image_base,
            section_alignment: config.section_alignment,
            file_alignment: config.file_alignment,
            major_operating_system_version: 4,
            minor_operating_system_version: 0,
            major_image_version: 0,
            minor_image_version: 0,
            major_subsystem_version: 4,
            minor_subsystem_version: 0,
            win32_version_value: 0,
            size_of_image,
            size_of_headers,
            checksum: 0,
            subsystem: config.subsystem,
            dll_characteristics: 0x8540,
            size_of_stack_reserve: 0x10_0000,
            size_of_stack_commit: 0x1000,
            size_of_heap_reserve: 0x10_0000,
            size_of_heap_commit: 0x1000,
            loader_flags: 0,
            number_of_rva_and_sizes: DATA_DIRECTORY_COUNT as u32,
            data_directories: directories,
        };

        let mut writer = Writer::with_capacity(file_end as usize);
        writer.write_bytes(&DOS_STUB);
        writer.write_bytes(b"PE\0\0");
        coff.write(&mut writer);
        optional.write(&mut writer);
        table.write(&mut writer);

        for (header, content) in table.headers().iter().zip(&contents) {
            writer.pad_to(header.pointer_to_raw_data as usize);
            arena.write(*content, &mut writer)?;
            writer.pad_to((header.pointer_to_raw_data + header.size_of_raw_data) as usize);
        }

        Ok(writer.into_bytes())
    }
}
