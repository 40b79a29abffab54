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

//! Structural laws that must hold for every built image.

use dotforge::builder::{PeBuilderConfig, PeImageBuilder};
use dotforge::layout::align_up;
use dotforge::metadata::bodies::MethodBody;
use dotforge::metadata::root::MetadataBuilder;
use dotforge::metadata::tables::buffer::RowValue;
use dotforge::metadata::tables::TableId;
use dotforge::pe::headers::directory_index;
use dotforge::pe::image::PeImage;
use dotforge::pe::import::ImportedSymbol;
use dotforge::pe::resource::{ParsedResourceContent, ResourceData, ResourceId};

#[test]
fn align_up_is_idempotent_and_minimal() {
    for boundary_shift in 0..16u32 {
        let boundary = 1u64 << boundary_shift;
        for value in [0, 1, 2, 3, 511, 512, 513, 0x1FFF, 0x2000, 0xFFFF_FFFF] {
            let aligned = align_up(value, boundary);
            assert_eq!(aligned % boundary, 0);
            assert!(aligned >= value);
            assert!(aligned - value < boundary);
            assert_eq!(align_up(aligned, boundary), aligned);
        }
    }
}

#[test]
fn rva_and_offset_translations_are_inverse() {
    let mut builder = PeImageBuilder::new(PeBuilderConfig::default()).unwrap();
    builder
        .add_method_body(&MethodBody::tiny(vec![0x00; 40]))
        .unwrap();
    builder
        .add_win32_resource(
            &[ResourceId::Id(10), ResourceId::Id(1)],
            ResourceData {
                codepage: 0,
                data: vec![0x55; 300],
            },
        )
        .unwrap();
    let bytes = builder.build().unwrap();
    let image = PeImage::from_mem(bytes).unwrap();

    let map = image.section_map();
    for span in map.spans() {
        // Probe the raw extent of the section, where both mappings exist.
        let extents = [0u32, 1, span.raw_size / 2, span.raw_size - 1];
        for extent in extents {
            let rva = span.virtual_address + extent;
            let offset = map.rva_to_offset(rva).unwrap();
            assert_eq!(map.offset_to_rva(offset).unwrap(), rva);
        }
    }

    // An RVA in the page gap between two sections maps to no section.
    let first = &map.spans()[0];
    assert!(map.rva_to_offset(first.virtual_address - 1).is_err());
}

#[test]
fn heaps_deduplicate_and_preserve_offsets() {
    let mut metadata = MetadataBuilder::new("v4.0.30319");

    let a = metadata.strings.get_or_add("SharedName").unwrap();
    let b = metadata.strings.get_or_add("Other").unwrap();
    assert_eq!(metadata.strings.get_or_add("SharedName").unwrap(), a);
    assert_ne!(a, b);
    assert_eq!(metadata.strings.get_or_add("").unwrap(), 0);

    let blob = metadata.blobs.get_or_add(&[1, 2, 3]).unwrap();
    assert_eq!(metadata.blobs.get_or_add(&[1, 2, 3]).unwrap(), blob);
    assert_ne!(metadata.blobs.get_or_add(&[1, 2, 3, 4]).unwrap(), blob);
    assert_eq!(metadata.blobs.get_or_add(&[]).unwrap(), 0);

    let us = metadata.user_strings.get_or_add("hello").unwrap();
    assert_eq!(metadata.user_strings.get_or_add("hello").unwrap(), us);
    assert_ne!(metadata.user_strings.get_or_add("hellp").unwrap(), us);

    let guid = uguid::guid!("11111111-2222-3333-4444-555555555555");
    let index = metadata.guids.get_or_add(guid);
    assert_eq!(metadata.guids.get_or_add(guid), index);
    assert_eq!(index, 1); // GUID indices are 1-based
}

#[test]
fn row_tokens_are_sequential_per_table() {
    let mut metadata = MetadataBuilder::new("v4.0.30319");

    let field_row = |metadata: &mut MetadataBuilder, name: &str| {
        let name = metadata.strings.get_or_add(name).unwrap();
        let signature = metadata.blobs.get_or_add(&[0x06, 0x08]).unwrap();
        vec![
            RowValue::Fixed(0x0016), // public static
            RowValue::StringOffset(name),
            RowValue::BlobOffset(signature),
        ]
    };

    // Interleave two tables; RIDs must count independently.
    let values = field_row(&mut metadata, "A");
    let first_field = metadata.tables.add_row(TableId::Field, values).unwrap();
    let first_param = metadata
        .tables
        .add_row(
            TableId::Param,
            vec![
                RowValue::Fixed(0),
                RowValue::Fixed(1),
                RowValue::StringOffset(metadata.strings.get_or_add("x").unwrap()),
            ],
        )
        .unwrap();
    let values = field_row(&mut metadata, "B");
    let second_field = metadata.tables.add_row(TableId::Field, values).unwrap();

    assert_eq!(first_field.value(), 0x0400_0001);
    assert_eq!(first_param.value(), 0x0800_0001);
    assert_eq!(second_field.value(), 0x0400_0002);
    assert_eq!(metadata.tables.row_count(TableId::Field), 2);
    assert_eq!(metadata.tables.row_count(TableId::Param), 1);
}

#[test]
fn import_descriptor_table_includes_sentinel_row() {
    let mut builder = PeImageBuilder::new(PeBuilderConfig::default()).unwrap();
    let user = builder.import_module("user32.dll");
    builder.import_symbol(
        user,
        ImportedSymbol::Name {
            hint: 0,
            name: "MessageBoxW".to_string(),
        },
    );

    let bytes = builder.build().unwrap();
    let image = PeImage::from_mem(bytes).unwrap();

    // user32 plus the automatic mscoree import, plus the sentinel.
    let directory = &image.optional_header().data_directories[directory_index::IMPORT];
    assert_eq!(directory.size, 3 * 20);

    let offset = image.section_map().rva_to_offset(directory.rva).unwrap() as usize;
    let sentinel = &image.data()[offset + 40..offset + 60];
    assert!(sentinel.iter().all(|&b| b == 0));
}

#[test]
fn named_resource_entries_set_the_name_bit() {
    let mut builder = PeImageBuilder::new(PeBuilderConfig::default()).unwrap();
    builder
        .add_win32_resource(
            &[
                ResourceId::Id(6), // RT_STRING
                ResourceId::Name("GREETING".to_string()),
                ResourceId::Id(1033),
            ],
            ResourceData {
                codepage: 1252,
                data: vec![0x11; 16],
            },
        )
        .unwrap();
    builder
        .add_win32_resource(
            &[ResourceId::Id(6), ResourceId::Id(7), ResourceId::Id(1033)],
            ResourceData {
                codepage: 0,
                data: vec![0x22; 16],
            },
        )
        .unwrap();

    let bytes = builder.build().unwrap();
    let image = PeImage::from_mem(bytes).unwrap();

    let root = image.resources().expect("resource tree");
    let ParsedResourceContent::Directory(types) = &root.entries[0].content else {
        panic!("expected a type subdirectory")
    };

    // Named entries precede ID entries within one directory, and the name
    // round-trips through the bit-31 tagged name cell.
    assert_eq!(types.entries[0].id, ResourceId::Name("GREETING".to_string()));
    assert_eq!(types.entries[1].id, ResourceId::Id(7));

    let ParsedResourceContent::Directory(named_langs) = &types.entries[0].content else {
        panic!("expected a language subdirectory")
    };
    let ParsedResourceContent::Data { codepage, size, .. } = &named_langs.entries[0].content
    else {
        panic!("expected a data leaf")
    };
    assert_eq!(*codepage, 1252);
    assert_eq!(*size, 16);

    assert!(image.issues().is_empty());
}
