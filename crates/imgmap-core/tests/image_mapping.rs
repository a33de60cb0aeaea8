//! Reconstructing missing pages from module images

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use common::{
    elf64, macho64, relocation_block, PeBuilder, TestImages, TestTarget, ELF_DATA_VADDR,
    IMAGE_DIRECTORY_ENTRY_BASERELOC,
};
use imgmap_core::config::MemoryConfig;
use imgmap_core::events::FlushSignal;
use imgmap_core::memory::{ImageMappingMemoryService, MemoryReader, SnapshotMemory, PAGE_SIZE};
use imgmap_core::modules::{FormatProbe, ModuleDirectory, ModuleSeed};
use imgmap_core::provider::{ImageKey, ImageProvider, ImageSource};
use once_cell::sync::OnceCell;
use imgmap_core::types::{Address, OperatingSystem};
use imgmap_core::{FlushReason, Target};

const IMAGE_REL_BASED_HIGHLOW: u16 = 3;
const IMAGE_REL_BASED_DIR64: u16 = 10;

const ELF_BASE: u64 = 0x7f3a_0000_0000;
const ELF_BUILD_ID: [u8; 8] = [0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88];

fn payload() -> Vec<u8>
{
    (0..0x40u8).map(|value| value.wrapping_mul(3)).collect()
}

/// A Linux dump holding only the first page of `libfoo.so`.
fn elf_dump() -> (Vec<u8>, SnapshotMemory)
{
    let elf = elf64(&ELF_BUILD_ID, &payload());
    let mut raw = SnapshotMemory::new();
    raw.insert(Address::from(ELF_BASE), elf.file[..0x1000].to_vec());
    (elf.file, raw)
}

fn elf_target(raw: SnapshotMemory, provider: Arc<dyn ImageProvider>) -> Target
{
    common::init_tracing();
    Target::new(
        TestTarget::new(
            OperatingSystem::Linux,
            vec![ModuleSeed::new("/usr/lib/libfoo.so", ELF_BASE, 0x3000)],
        ),
        Arc::new(raw),
        provider,
        MemoryConfig::default(),
    )
}

#[test]
fn test_elf_segment_reconstructed()
{
    let (file, raw) = elf_dump();
    let target = elf_target(raw, Arc::new(TestImages::default().with("libfoo.so", Arc::from(file.as_slice()))));

    let mut buffer = vec![0u8; 0x80];
    let address = Address::from(ELF_BASE + ELF_DATA_VADDR);
    assert_eq!(target.memory().read(address, &mut buffer), 0x80);
    assert_eq!(&buffer[..0x40], payload().as_slice());
    // past the file-backed part of the segment
    assert!(buffer[0x40..].iter().all(|&byte| byte == 0));

    // the raw reader is untouched
    assert_eq!(target.raw_memory().read(address, &mut buffer), 0);
}

#[test]
fn test_partial_read_completed_from_image()
{
    let (file, mut raw) = elf_dump();
    let address = ELF_BASE + ELF_DATA_VADDR;
    raw.insert(Address::from(address), vec![0xee; 10]);
    let target = elf_target(raw, Arc::new(TestImages::default().with("libfoo.so", Arc::from(file.as_slice()))));

    let mut buffer = [0u8; 20];
    assert_eq!(target.memory().read(Address::from(address), &mut buffer), 20);
    assert_eq!(&buffer[..10], &[0xee; 10]);
    assert_eq!(&buffer[10..], &payload()[10..20]);
}

#[test]
fn test_missing_image_leaves_read_short()
{
    let (_, mut raw) = elf_dump();
    let address = ELF_BASE + ELF_DATA_VADDR;
    raw.insert(Address::from(address), vec![0xee; 10]);
    let images = Arc::new(TestImages::default());
    let target = elf_target(raw, images.clone());

    let mut buffer = [0u8; 20];
    assert_eq!(target.memory().read(Address::from(address), &mut buffer), 10);
    assert_eq!(target.memory().read(Address::from(address), &mut buffer), 10);
    // the failed page is remembered, so the provider is asked once
    assert_eq!(images.lookups(), 1);
}

/// Provider that reads the module's own missing page while locating it
struct SelfReadingImages
{
    image: Arc<[u8]>,
    memory: OnceCell<Weak<dyn MemoryReader>>,
    nested_read: AtomicUsize,
}

impl ImageProvider for SelfReadingImages
{
    fn locate(&self, _key: &ImageKey) -> Option<ImageSource>
    {
        let memory = self.memory.get()?.upgrade()?;
        let mut buffer = [0u8; 8];
        let read = memory.read(Address::from(ELF_BASE + ELF_DATA_VADDR), &mut buffer);
        self.nested_read.store(read, Ordering::SeqCst);
        Some(ImageSource::Bytes(self.image.clone()))
    }
}

#[test]
fn test_nested_read_of_same_module_is_cut_short()
{
    let (file, raw) = elf_dump();
    let images = Arc::new(SelfReadingImages {
        image: Arc::from(file.as_slice()),
        memory: OnceCell::new(),
        nested_read: AtomicUsize::new(usize::MAX),
    });
    let target = elf_target(raw, images.clone());
    assert!(images.memory.set(Arc::downgrade(target.memory())).is_ok());

    let address = Address::from(ELF_BASE + ELF_DATA_VADDR);
    let mut buffer = [0u8; 0x40];
    assert_eq!(target.memory().read(address, &mut buffer), 0x40);
    assert_eq!(&buffer[..], payload().as_slice());
    // the read made while locating the image gets nothing instead of recursing
    assert_eq!(images.nested_read.load(Ordering::SeqCst), 0);

    // the failure recorded by the nested read did not replace the page
    let mut again = [0u8; 0x40];
    assert_eq!(target.memory().read(address, &mut again), 0x40);
    assert_eq!(again, buffer);
}

#[test]
fn test_address_outside_modules_is_unreadable()
{
    let (file, raw) = elf_dump();
    let target = elf_target(raw, Arc::new(TestImages::default().with("libfoo.so", Arc::from(file.as_slice()))));

    let mut buffer = [0u8; 8];
    assert_eq!(target.memory().read(Address::from(0x1000), &mut buffer), 0);
    // inside the module but in the gap between segments
    assert_eq!(target.memory().read(Address::from(ELF_BASE + 0x1000), &mut buffer), 0);
}

#[test]
fn test_image_with_other_build_id_is_rejected()
{
    let (_, raw) = elf_dump();
    let other = elf64(&[0x99; 8], &payload());
    let target = elf_target(raw, Arc::new(TestImages::default().with("libfoo.so", Arc::from(other.file.as_slice()))));

    let mut buffer = [0u8; 8];
    assert_eq!(target.memory().read(Address::from(ELF_BASE + ELF_DATA_VADDR), &mut buffer), 0);
}

#[test]
fn test_macho_segment_reconstructed()
{
    common::init_tracing();
    let uuid = [0x42; 16];
    let file = macho64(uuid, b"__DATA contents");
    let base = 0x1_0800_0000;
    let mut raw = SnapshotMemory::new();
    raw.insert(Address::from(base), file[..0x1000].to_vec());

    let target = Target::new(
        TestTarget::new(
            OperatingSystem::MacOS,
            vec![ModuleSeed::new("/usr/lib/libbar.dylib", base, 0x2000)],
        ),
        Arc::new(raw),
        Arc::new(TestImages::default().with("libbar.dylib", Arc::from(file.as_slice()))),
        MemoryConfig::default(),
    );

    let mut buffer = [0u8; 15];
    assert_eq!(target.memory().read(Address::from(base + 0x1000), &mut buffer), 15);
    assert_eq!(&buffer, b"__DATA contents");
}

#[test]
fn test_pe32_plus_dir64_relocation()
{
    common::init_tracing();
    let builder = PeBuilder::pe32_plus();
    let preferred = builder.image_base();
    let mut text = vec![0x90u8; 0x1200];
    text[0x10..0x18].copy_from_slice(&(preferred + 0x1234).to_le_bytes());
    // a pointer straddling the first page boundary of .text
    text[0xffc..0x1004].copy_from_slice(&(preferred + 0x1100).to_le_bytes());
    let reloc = relocation_block(0x1000, &[(IMAGE_REL_BASED_DIR64, 0x10), (IMAGE_REL_BASED_DIR64, 0xffc)]);
    let image = builder
        .section(".text", 0x1000, text)
        .section(".reloc", 0x3000, reloc.clone())
        .directory(IMAGE_DIRECTORY_ENTRY_BASERELOC, 0x3000, reloc.len() as u32)
        .build();

    let base = 0x7ff6_1000_0000;
    let mut raw = SnapshotMemory::new();
    raw.insert(Address::from(base), image.file[..0x400].to_vec());
    let target = Target::new(
        TestTarget::new(
            OperatingSystem::Windows,
            vec![ModuleSeed::new(r"C:\app\app.exe", base, u64::from(image.size_of_image))],
        ),
        Arc::new(raw),
        Arc::new(TestImages::default().with("app.exe", image.shared())),
        MemoryConfig::default(),
    );

    let memory = target.memory();
    assert_eq!(memory.read_u64(Address::from(base + 0x1010)).unwrap(), base + 0x1234);
    assert_eq!(memory.read_u64(Address::from(base + 0x1ffc)).unwrap(), base + 0x1100);
    // untouched code bytes
    assert_eq!(memory.read_u32(Address::from(base + 0x1000)).unwrap(), 0x9090_9090);
    // between the end of .text and .reloc the loader leaves zeros
    assert_eq!(memory.read_u64(Address::from(base + 0x2800)).unwrap(), 0);
    // headers still come from the dump
    let mut magic = [0u8; 2];
    memory.read_exact(Address::from(base), &mut magic).unwrap();
    assert_eq!(&magic, b"MZ");
}

#[test]
fn test_pe32_highlow_relocation()
{
    common::init_tracing();
    let builder = PeBuilder::pe32();
    let preferred = builder.image_base() as u32;
    let mut text = vec![0u8; 0x100];
    text[0x20..0x24].copy_from_slice(&(preferred + 0x1234).to_le_bytes());
    let reloc = relocation_block(0x1000, &[(IMAGE_REL_BASED_HIGHLOW, 0x20), (0, 0)]);
    let image = builder
        .section(".text", 0x1000, text)
        .section(".reloc", 0x2000, reloc.clone())
        .directory(IMAGE_DIRECTORY_ENTRY_BASERELOC, 0x2000, reloc.len() as u32)
        .build();

    let base: u64 = 0x1000_0000;
    let mut raw = SnapshotMemory::new();
    raw.insert(Address::from(base), image.file[..0x400].to_vec());
    let target = Target::new(
        TestTarget::new(
            OperatingSystem::Windows,
            vec![ModuleSeed::new(r"C:\app\legacy.dll", base, u64::from(image.size_of_image))],
        ),
        Arc::new(raw),
        Arc::new(TestImages::default().with("legacy.dll", image.shared())),
        MemoryConfig::default(),
    );

    assert_eq!(
        target.memory().read_u32(Address::from(base + 0x1020)).unwrap(),
        0x1000_1234
    );
}

#[test]
fn test_page_at_preferred_base_is_not_relocated()
{
    common::init_tracing();
    let builder = PeBuilder::pe32_plus();
    let preferred = builder.image_base();
    let mut text = vec![0u8; 0x40];
    text[..8].copy_from_slice(&(preferred + 0x10).to_le_bytes());
    let reloc = relocation_block(0x1000, &[(IMAGE_REL_BASED_DIR64, 0)]);
    let image = builder
        .section(".text", 0x1000, text)
        .section(".reloc", 0x2000, reloc.clone())
        .directory(IMAGE_DIRECTORY_ENTRY_BASERELOC, 0x2000, reloc.len() as u32)
        .build();

    let mut raw = SnapshotMemory::new();
    raw.insert(Address::from(preferred), image.file[..0x400].to_vec());
    let target = Target::new(
        TestTarget::new(
            OperatingSystem::Windows,
            vec![ModuleSeed::new("app.exe", preferred, u64::from(image.size_of_image))],
        ),
        Arc::new(raw),
        Arc::new(TestImages::default().with("app.exe", image.shared())),
        MemoryConfig::default(),
    );
    assert_eq!(target.memory().read_u64(Address::from(preferred + 0x1000)).unwrap(), preferred + 0x10);
}

#[test]
fn test_flush_drops_reconstructed_pages()
{
    common::init_tracing();
    let (file, raw) = elf_dump();
    let raw: Arc<dyn MemoryReader> = Arc::new(raw);
    let images = Arc::new(TestImages::default().with("libfoo.so", Arc::from(file.as_slice())));
    let descriptor = TestTarget::new(
        OperatingSystem::Linux,
        vec![ModuleSeed::new("/usr/lib/libfoo.so", ELF_BASE, 0x3000)],
    );

    let signal = Arc::new(FlushSignal::new());
    let probe = Arc::new(FormatProbe::new(raw.clone(), OperatingSystem::Linux, images.clone()));
    let modules = ModuleDirectory::new(descriptor, probe, signal.clone());
    let service = ImageMappingMemoryService::new(raw, modules, &signal, PAGE_SIZE * 16);

    let address = Address::from(ELF_BASE + ELF_DATA_VADDR + 0x8);
    let mut buffer = [0u8; 8];
    assert_eq!(service.read(address, &mut buffer), 8);
    assert_eq!(service.read(address, &mut buffer), 8);
    assert_eq!(service.cache().page_count(), 1);
    assert_eq!(images.lookups(), 1);

    signal.fire(FlushReason::Resumed);
    assert_eq!(service.cache().page_count(), 0);

    assert_eq!(service.read(address, &mut buffer), 8);
    assert_eq!(&buffer, &payload()[8..16]);
    // modules were rebuilt, so the image was located again
    assert_eq!(images.lookups(), 2);
}

#[test]
fn test_image_mapping_disabled()
{
    let (file, raw) = elf_dump();
    let config = MemoryConfig {
        map_images: false,
        ..MemoryConfig::default()
    };
    let target = Target::new(
        TestTarget::new(
            OperatingSystem::Linux,
            vec![ModuleSeed::new("/usr/lib/libfoo.so", ELF_BASE, 0x3000)],
        ),
        Arc::new(raw),
        Arc::new(TestImages::default().with("libfoo.so", Arc::from(file.as_slice()))),
        config,
    );

    let mut buffer = [0u8; 8];
    assert_eq!(target.memory().read(Address::from(ELF_BASE + ELF_DATA_VADDR), &mut buffer), 0);
}
