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

//! Build-then-read round trips over complete images.

use dotforge::builder::{PeBuilderConfig, PeImageBuilder};
use dotforge::file::parser::Parser;
use dotforge::metadata::bodies::MethodBody;
use dotforge::metadata::streams::{Cell, TablesView, UserStringsView};
use dotforge::metadata::tables::buffer::RowValue;
use dotforge::metadata::tables::TableId;
use dotforge::metadata::token::Token;
use dotforge::pe::headers::{directory_index, MACHINE_AMD64};
use dotforge::pe::image::PeImage;
use dotforge::pe::import::ImportedSymbol;
use dotforge::pe::resource::{
    ParsedResourceContent, ResourceData, ResourceId,
};

/// Populate `builder` with a minimal hello-world module and return the
/// entry point token.
fn populate_hello_world(builder: &mut PeImageBuilder) -> Token {
    let us_hello = builder
        .metadata
        .user_strings
        .get_or_add("Hello, world!")
        .unwrap();

    // ldstr <us token>; call <memberref token>; ret
    let mut code = vec![0x72];
    code.extend_from_slice(&(0x7000_0000 | us_hello).to_le_bytes());
    code.push(0x28);
    code.extend_from_slice(&0x0A00_0001u32.to_le_bytes());
    code.push(0x2A);
    let body = builder.add_method_body(&MethodBody::tiny(code)).unwrap();

    let module_name = builder.metadata.strings.get_or_add("hello.exe").unwrap();
    let mvid = builder
        .metadata
        .guids
        .get_or_add(uguid::guid!("a2a4b201-0c04-4f6c-8427-3b0e43b0c0a1"));
    builder
        .metadata
        .tables
        .add_row(
            TableId::Module,
            vec![
                RowValue::Fixed(0),
                RowValue::StringOffset(module_name),
                RowValue::GuidIndex(mvid),
                RowValue::GuidIndex(0),
                RowValue::GuidIndex(0),
            ],
        )
        .unwrap();

    let type_name = builder.metadata.strings.get_or_add("Program").unwrap();
    let type_ns = builder.metadata.strings.get_or_add("Hello").unwrap();
    builder
        .metadata
        .tables
        .add_row(
            TableId::TypeDef,
            vec![
                RowValue::Fixed(0x0010_0001), // public, BeforeFieldInit
                RowValue::StringOffset(type_name),
                RowValue::StringOffset(type_ns),
                RowValue::Coded(Token::new(0)),
                RowValue::RowIndex(1),
                RowValue::RowIndex(1),
            ],
        )
        .unwrap();

    let main_name = builder.metadata.strings.get_or_add("Main").unwrap();
    let main_sig = builder.metadata.blobs.get_or_add(&[0x00, 0x00, 0x01]).unwrap();
    let main = builder
        .metadata
        .tables
        .add_row(
            TableId::MethodDef,
            vec![
                RowValue::SegmentRva(body),
                RowValue::Fixed(0),      // ImplFlags: IL, managed
                RowValue::Fixed(0x0096), // Flags: public static hidebysig
                RowValue::StringOffset(main_name),
                RowValue::BlobOffset(main_sig),
                RowValue::RowIndex(1),
            ],
        )
        .unwrap();

    let asm_name = builder.metadata.strings.get_or_add("hello").unwrap();
    builder
        .metadata
        .tables
        .add_row(
            TableId::Assembly,
            vec![
                RowValue::Fixed(0x8004), // SHA1
                RowValue::Fixed(1),
                RowValue::Fixed(0),
                RowValue::Fixed(0),
                RowValue::Fixed(0),
                RowValue::Fixed(0),
                RowValue::BlobOffset(0),
                RowValue::StringOffset(asm_name),
                RowValue::StringOffset(0),
            ],
        )
        .unwrap();

    builder.set_entry_point(main);
    main
}

#[test]
fn hello_world_exe_round_trips() {
    let mut builder = PeImageBuilder::new(PeBuilderConfig::default()).unwrap();
    let main = populate_hello_world(&mut builder);
    assert_eq!(main.value(), 0x0600_0001);

    let bytes = builder.build().unwrap();
    let image = PeImage::from_mem(bytes).unwrap();

    let clr = image.clr().expect("CLR directory");
    assert_eq!(clr.header.entry_point_token(), Some(Token::new(0x0600_0001)));

    let tables = TablesView::parse(image.metadata_stream("#~").unwrap()).unwrap();
    assert_eq!(tables.row_count(TableId::Module), 1);
    assert_eq!(tables.row_count(TableId::TypeDef), 1);
    assert_eq!(tables.row_count(TableId::MethodDef), 1);
    assert_eq!(tables.row_count(TableId::Assembly), 1);
    assert_eq!(tables.row_count(TableId::Field), 0);

    // The method's RVA column resolves to a decodable tiny body.
    let row = tables.row(TableId::MethodDef, 1).unwrap();
    let Cell::Value(rva) = row[0] else {
        panic!("RVA column decoded as {:?}", row[0])
    };
    let offset = image.section_map().rva_to_offset(rva as u32).unwrap() as usize;
    let mut parser = Parser::new(&image.data()[offset..]);
    let body = MethodBody::decode(&mut parser).unwrap();
    assert!(body.is_tiny());
    assert_eq!(body.code.len(), 11);
    assert_eq!(body.code[0], 0x72); // ldstr
    assert_eq!(*body.code.last().unwrap(), 0x2A); // ret

    // The literal itself sits in #US at the ldstr operand's offset.
    let us = UserStringsView::new(image.metadata_stream("#US").unwrap());
    let us_offset = u32::from_le_bytes(body.code[1..5].try_into().unwrap()) & 0x00FF_FFFF;
    assert_eq!(us.get(us_offset).unwrap(), "Hello, world!");

    assert!(image.issues().is_empty());
}

#[test]
fn local_variable_forces_fat_body_aligned() {
    let mut builder = PeImageBuilder::new(PeBuilderConfig::default()).unwrap();

    // A tiny body first, so the fat one cannot accidentally start aligned.
    builder
        .add_method_body(&MethodBody::tiny(vec![0x2A]))
        .unwrap();

    let fat = MethodBody {
        code: vec![0x00, 0x2A], // nop; ret
        max_stack: 1,
        local_var_sig_token: Token::new(0x1100_0001),
        init_locals: true,
        exception_handlers: Vec::new(),
    };
    assert!(!fat.is_tiny());
    let fat_segment = builder.add_method_body(&fat).unwrap();

    builder
        .metadata
        .tables
        .add_row(
            TableId::StandAloneSig,
            vec![RowValue::BlobOffset(
                builder.metadata.blobs.get_or_add(&[0x07, 0x01, 0x08]).unwrap(),
            )],
        )
        .unwrap();
    builder
        .metadata
        .tables
        .add_row(
            TableId::MethodDef,
            vec![
                RowValue::SegmentRva(fat_segment),
                RowValue::Fixed(0),
                RowValue::Fixed(0x0096),
                RowValue::StringOffset(builder.metadata.strings.get_or_add("M").unwrap()),
                RowValue::BlobOffset(0),
                RowValue::RowIndex(1),
            ],
        )
        .unwrap();

    let bytes = builder.build().unwrap();
    let image = PeImage::from_mem(bytes).unwrap();

    let tables = TablesView::parse(image.metadata_stream("#~").unwrap()).unwrap();
    let row = tables.row(TableId::MethodDef, 1).unwrap();
    let Cell::Value(rva) = row[0] else {
        panic!("RVA column decoded as {:?}", row[0])
    };
    assert_eq!(rva % 4, 0);

    let offset = image.section_map().rva_to_offset(rva as u32).unwrap() as usize;
    let mut parser = Parser::new(&image.data()[offset..]);
    let decoded = MethodBody::decode(&mut parser).unwrap();
    assert!(!decoded.is_tiny());
    assert!(decoded.init_locals);
    assert_eq!(decoded.local_var_sig_token, Token::new(0x1100_0001));
    assert_eq!(decoded.code, vec![0x00, 0x2A]);
}

#[test]
fn embedded_manifest_resource_round_trips() {
    let mut builder = PeImageBuilder::new(PeBuilderConfig::default()).unwrap();

    let payload = [1u8, 2, 3, 4, 5, 6, 7];
    let resource_offset = builder.add_manifest_resource(&payload);
    let resource_name = builder
        .metadata
        .strings
        .get_or_add("SomeResource")
        .unwrap();
    builder
        .metadata
        .tables
        .add_row(
            TableId::ManifestResource,
            vec![
                RowValue::Fixed(u64::from(resource_offset)),
                RowValue::Fixed(1), // public
                RowValue::StringOffset(resource_name),
                RowValue::Coded(Token::new(0)), // embedded
            ],
        )
        .unwrap();

    let bytes = builder.build().unwrap();
    let image = PeImage::from_mem(bytes).unwrap();

    let clr = image.clr().expect("CLR directory");
    let resources = &clr.header.resources;
    assert!(resources.is_present());
    assert_eq!(resources.size, 11); // 4-byte length prefix + 7 payload bytes

    let base = image.section_map().rva_to_offset(resources.rva).unwrap() as usize;
    let data = image.data();
    let at = base + resource_offset as usize;
    let length = u32::from_le_bytes(data[at..at + 4].try_into().unwrap());
    assert_eq!(length, 7);
    assert_eq!(&data[at + 4..at + 11], &payload);
}

#[test]
fn forced_import_directory_serializes_sentinel_only() {
    // PE32+ so no bootstrap import sneaks in.
    let config = PeBuilderConfig {
        machine: MACHINE_AMD64,
        image_base: 0x1_4000_0000,
        ..PeBuilderConfig::default()
    };
    let mut builder = PeImageBuilder::new(config).unwrap();
    builder.require_import_directory();

    let bytes = builder.build().unwrap();
    let image = PeImage::from_mem(bytes).unwrap();

    let directory = &image.optional_header().data_directories[directory_index::IMPORT];
    assert!(directory.is_present());
    assert_eq!(directory.size, 20); // exactly one all-zero descriptor

    let offset = image.section_map().rva_to_offset(directory.rva).unwrap() as usize;
    assert!(image.data()[offset..offset + 20].iter().all(|&b| b == 0));
    assert!(image.imports().is_empty());
    assert!(image.issues().is_empty());
}

#[test]
fn imported_symbols_read_back() {
    let mut builder = PeImageBuilder::new(PeBuilderConfig::default()).unwrap();
    let kernel32 = builder.import_module("kernel32.dll");
    builder.import_symbol(
        kernel32,
        ImportedSymbol::Name {
            hint: 0x156,
            name: "GetProcAddress".to_string(),
        },
    );
    builder.import_symbol(kernel32, ImportedSymbol::Ordinal(42));

    let bytes = builder.build().unwrap();
    let image = PeImage::from_mem(bytes).unwrap();

    let imports = image.imports();
    // kernel32 plus the automatic mscoree bootstrap import.
    assert_eq!(imports.len(), 2);
    assert_eq!(imports[0].library, "kernel32.dll");
    assert_eq!(
        imports[0].symbols[0],
        ImportedSymbol::Name {
            hint: 0x156,
            name: "GetProcAddress".to_string(),
        }
    );
    assert_eq!(imports[0].symbols[1], ImportedSymbol::Ordinal(42));
    assert_eq!(imports[1].library, "mscoree.dll");
}

#[test]
fn win32_resources_round_trip() {
    let mut builder = PeImageBuilder::new(PeBuilderConfig::default()).unwrap();
    builder
        .add_win32_resource(
            &[
                ResourceId::Id(16), // RT_VERSION
                ResourceId::Name("APP".to_string()),
                ResourceId::Id(1033),
            ],
            ResourceData {
                codepage: 0,
                data: b"version-blob".to_vec(),
            },
        )
        .unwrap();

    let bytes = builder.build().unwrap();
    let image = PeImage::from_mem(bytes).unwrap();

    let names: Vec<&str> = image
        .sections()
        .iter()
        .map(|header| header.name.as_str())
        .collect();
    assert!(names.contains(&".rsrc"));

    let root = image.resources().expect("resource tree");
    assert_eq!(root.entries.len(), 1);
    assert_eq!(root.entries[0].id, ResourceId::Id(16));
    let ParsedResourceContent::Directory(level1) = &root.entries[0].content else {
        panic!("expected subdirectory")
    };
    assert_eq!(level1.entries[0].id, ResourceId::Name("APP".to_string()));
    let ParsedResourceContent::Directory(level2) = &level1.entries[0].content else {
        panic!("expected subdirectory")
    };
    let ParsedResourceContent::Data { rva, size, .. } = &level2.entries[0].content else {
        panic!("expected data leaf")
    };
    assert_eq!(*size, 12);
    let offset = image.section_map().rva_to_offset(*rva).unwrap() as usize;
    assert_eq!(&image.data()[offset..offset + 12], b"version-blob");

    assert!(image.issues().is_empty());
}

#[test]
fn section_tuples_survive_reparse() {
    let mut builder = PeImageBuilder::new(PeBuilderConfig::default()).unwrap();
    populate_hello_world(&mut builder);
    builder
        .add_win32_resource(
            &[ResourceId::Id(10), ResourceId::Id(1)],
            ResourceData {
                codepage: 0,
                data: vec![0xAB; 32],
            },
        )
        .unwrap();
    let bytes = builder.build().unwrap();

    let first = PeImage::from_mem(bytes.clone()).unwrap();
    let second = PeImage::from_mem(bytes).unwrap();

    let tuples = |image: &PeImage| -> Vec<(String, u32, u32, u32, u32)> {
        image
            .sections()
            .iter()
            .map(|header| {
                (
                    header.name.clone(),
                    header.pointer_to_raw_data,
                    header.virtual_address,
                    header.size_of_raw_data,
                    header.virtual_size,
                )
            })
            .collect()
    };
    assert_eq!(tuples(&first), tuples(&second));

    let names: Vec<String> = first
        .sections()
        .iter()
        .map(|header| header.name.clone())
        .collect();
    assert_eq!(names, [".text", ".rsrc", ".reloc"]);

    for header in first.sections() {
        assert_eq!(header.pointer_to_raw_data % 0x200, 0);
        assert_eq!(header.virtual_address % 0x2000, 0);
    }
}
