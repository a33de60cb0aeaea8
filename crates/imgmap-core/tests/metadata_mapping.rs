//! Serving managed metadata from module images

mod common;

use std::sync::Arc;

use common::{
    cor20_header, debug_directory, PeBuilder, PeImage, TestImages, TestTarget, IMAGE_DIRECTORY_ENTRY_COM_DESCRIPTOR,
    IMAGE_DIRECTORY_ENTRY_DEBUG,
};
use imgmap_core::config::MemoryConfig;
use imgmap_core::formats::ModuleLayout;
use imgmap_core::memory::{MemoryReader, SnapshotMemory};
use imgmap_core::modules::ModuleSeed;
use imgmap_core::types::{Address, OperatingSystem};
use imgmap_core::{FlushReason, Target};

const BASE: u64 = 0x7f44_0000_0000;
const METADATA_RVA: u32 = 0x1200;
const METADATA_SIZE: u32 = 0x100;

fn metadata_blob() -> Vec<u8>
{
    let mut blob = b"BSJB".to_vec();
    blob.extend((4..METADATA_SIZE).map(|value| value as u8));
    blob
}

/// Managed PE32+: debug directory at 0x1000, CLR header at 0x1100 and
/// metadata at 0x1200, all in `.text`.
fn managed_image() -> PeImage
{
    let builder = PeBuilder::pe32_plus();
    let raw_pointer = builder.next_raw_pointer();
    let mut text = debug_directory(0x1000, raw_pointer, "Managed.pdb", [7; 16], 1);
    text.resize(0x100, 0);
    text.extend(cor20_header(METADATA_RVA, METADATA_SIZE));
    text.resize(0x200, 0);
    text.extend(metadata_blob());
    text.resize(0x380, 0xab);
    builder
        .section(".text", 0x1000, text)
        .directory(IMAGE_DIRECTORY_ENTRY_DEBUG, 0x1000, 28)
        .directory(IMAGE_DIRECTORY_ENTRY_COM_DESCRIPTOR, 0x1100, 72)
        .build()
}

/// A dump that mapped the image flat and zero-filled its metadata.
fn target(config: MemoryConfig) -> (Target, PeImage)
{
    common::init_tracing();
    let image = managed_image();
    let mut dumped = image.file.clone();
    let metadata_offset = image.file_offset(METADATA_RVA) as usize;
    dumped[metadata_offset..metadata_offset + METADATA_SIZE as usize].fill(0);

    let mut raw = SnapshotMemory::new();
    raw.insert(Address::from(BASE), dumped);
    let target = Target::new(
        TestTarget::new(
            OperatingSystem::Linux,
            vec![ModuleSeed::new("/app/Managed.dll", BASE, image.file.len() as u64)],
        ),
        Arc::new(raw),
        Arc::new(TestImages::default().with("Managed.dll", image.shared())),
        config,
    );
    (target, image)
}

#[test]
fn test_module_is_managed_file_layout()
{
    let (target, image) = target(MemoryConfig::default());
    let module = target.modules().lookup_by_base(Address::from(BASE)).unwrap();

    assert!(module.is_pe());
    assert!(module.is_managed());
    assert_eq!(module.layout(), ModuleLayout::File);
    let (start, size) = module.metadata_range().unwrap();
    assert_eq!(start.value(), BASE + u64::from(image.file_offset(METADATA_RVA)));
    assert_eq!(size, u64::from(METADATA_SIZE));
}

#[test]
fn test_metadata_served_over_zero_filled_dump()
{
    let (target, image) = target(MemoryConfig::default());
    let start = BASE + u64::from(image.file_offset(METADATA_RVA));

    let mut buffer = vec![0u8; METADATA_SIZE as usize];
    assert_eq!(target.memory().read(Address::from(start), &mut buffer), buffer.len());
    assert_eq!(buffer, metadata_blob());

    // the dump itself still reads back zeros
    let mut raw = [0xffu8; 4];
    assert_eq!(target.raw_memory().read(Address::from(start), &mut raw), 4);
    assert_eq!(raw, [0; 4]);
}

#[test]
fn test_read_past_metadata_end_falls_through()
{
    let (target, image) = target(MemoryConfig::default());
    let end = BASE + u64::from(image.file_offset(METADATA_RVA)) + u64::from(METADATA_SIZE);

    let mut buffer = [0u8; 16];
    assert_eq!(target.memory().read(Address::from(end - 8), &mut buffer), 16);
    assert_eq!(&buffer[..8], &metadata_blob()[METADATA_SIZE as usize - 8..]);
    // the rest of .text as dumped
    assert_eq!(&buffer[8..], &[0xab; 8]);
}

#[test]
fn test_other_addresses_read_from_dump()
{
    let (target, _) = target(MemoryConfig::default());
    let mut magic = [0u8; 2];
    assert_eq!(target.memory().read(Address::from(BASE), &mut magic), 2);
    assert_eq!(&magic, b"MZ");
}

#[test]
fn test_metadata_mapping_disabled()
{
    let config = MemoryConfig {
        map_metadata: false,
        ..MemoryConfig::default()
    };
    let (target, image) = target(config);
    let start = BASE + u64::from(image.file_offset(METADATA_RVA));

    let mut buffer = [0xffu8; 8];
    assert_eq!(target.memory().read(Address::from(start), &mut buffer), 8);
    assert_eq!(buffer, [0; 8]);
}

#[test]
fn test_metadata_survives_flush()
{
    let (target, image) = target(MemoryConfig::default());
    let start = BASE + u64::from(image.file_offset(METADATA_RVA));

    let mut buffer = [0u8; 4];
    assert_eq!(target.memory().read(Address::from(start), &mut buffer), 4);
    target.flush(FlushReason::ContextChanged);
    buffer = [0; 4];
    assert_eq!(target.memory().read(Address::from(start), &mut buffer), 4);
    assert_eq!(&buffer, b"BSJB");
}
