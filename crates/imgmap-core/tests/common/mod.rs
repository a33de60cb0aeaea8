//! Synthetic images and collaborators shared by the integration tests.
//!
//! Images are assembled byte by byte so that every field a test depends on
//! is visible here; no binaries are checked in.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use imgmap_core::memory::MemoryReader;
use imgmap_core::modules::ModuleSeed;
use imgmap_core::provider::{ImageKey, ImageProvider, ImageSource};
use imgmap_core::types::{Address, OperatingSystem, TargetDescriptor};
use imgmap_core::Result;

pub const PE_TIMESTAMP: u32 = 0x6512_3456;
pub const PE_FILE_ALIGNMENT: u32 = 0x200;
pub const PE_SIZE_OF_HEADERS: u32 = 0x400;
pub const IMAGE_DIRECTORY_ENTRY_RESOURCE: usize = 2;
pub const IMAGE_DIRECTORY_ENTRY_BASERELOC: usize = 5;
pub const IMAGE_DIRECTORY_ENTRY_DEBUG: usize = 6;
pub const IMAGE_DIRECTORY_ENTRY_COM_DESCRIPTOR: usize = 14;

fn put_u16(bytes: &mut [u8], at: usize, value: u16)
{
    bytes[at..at + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(bytes: &mut [u8], at: usize, value: u32)
{
    bytes[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_u64(bytes: &mut [u8], at: usize, value: u64)
{
    bytes[at..at + 8].copy_from_slice(&value.to_le_bytes());
}

fn align(value: u32, alignment: u32) -> u32
{
    value.div_ceil(alignment) * alignment
}

struct PeSection
{
    name: &'static str,
    virtual_address: u32,
    data: Vec<u8>,
}

/// Builder for a minimal PE32 or PE32+ image
pub struct PeBuilder
{
    pe32_plus: bool,
    image_base: u64,
    time_date_stamp: u32,
    sections: Vec<PeSection>,
    directories: [(u32, u32); 16],
}

/// A built PE image with its layout facts
pub struct PeImage
{
    /// On-disk bytes
    pub file: Vec<u8>,
    pub image_base: u64,
    pub size_of_image: u32,
    /// `(virtual_address, pointer_to_raw_data, data)` per section
    sections: Vec<(u32, u32, Vec<u8>)>,
}

impl PeBuilder
{
    pub fn pe32_plus() -> Self
    {
        Self::new(true, 0x1_4000_0000)
    }

    pub fn pe32() -> Self
    {
        Self::new(false, 0x0040_0000)
    }

    fn new(pe32_plus: bool, image_base: u64) -> Self
    {
        Self {
            pe32_plus,
            image_base,
            time_date_stamp: PE_TIMESTAMP,
            sections: Vec::new(),
            directories: [(0, 0); 16],
        }
    }

    pub fn image_base(&self) -> u64
    {
        self.image_base
    }

    /// File offset the next added section's raw data will start at.
    pub fn next_raw_pointer(&self) -> u32
    {
        PE_SIZE_OF_HEADERS
            + self
                .sections
                .iter()
                .map(|section| align(section.data.len() as u32, PE_FILE_ALIGNMENT))
                .sum::<u32>()
    }

    pub fn section(mut self, name: &'static str, virtual_address: u32, data: Vec<u8>) -> Self
    {
        self.sections.push(PeSection {
            name,
            virtual_address,
            data,
        });
        self
    }

    pub fn directory(mut self, index: usize, rva: u32, size: u32) -> Self
    {
        self.directories[index] = (rva, size);
        self
    }

    pub fn build(self) -> PeImage
    {
        let size_of_image = align(
            self.sections
                .iter()
                .map(|section| section.virtual_address + section.data.len() as u32)
                .max()
                .unwrap_or(PE_SIZE_OF_HEADERS),
            0x1000,
        );

        let mut file = vec![0u8; PE_SIZE_OF_HEADERS as usize];
        file[0..2].copy_from_slice(b"MZ");
        put_u32(&mut file, 0x3c, 0x80);
        file[0x80..0x84].copy_from_slice(b"PE\0\0");

        let coff = 0x84;
        let optional_size: u16 = if self.pe32_plus { 240 } else { 224 };
        put_u16(&mut file, coff, if self.pe32_plus { 0x8664 } else { 0x14c });
        put_u16(&mut file, coff + 2, self.sections.len() as u16);
        put_u32(&mut file, coff + 4, self.time_date_stamp);
        put_u16(&mut file, coff + 16, optional_size);
        put_u16(&mut file, coff + 18, 0x2022);

        let optional = coff + 20;
        let directories_at = if self.pe32_plus {
            put_u16(&mut file, optional, 0x20b);
            put_u64(&mut file, optional + 24, self.image_base);
            put_u32(&mut file, optional + 108, 16);
            optional + 112
        } else {
            put_u16(&mut file, optional, 0x10b);
            put_u32(&mut file, optional + 28, self.image_base as u32);
            put_u32(&mut file, optional + 92, 16);
            optional + 96
        };
        put_u32(&mut file, optional + 32, 0x1000);
        put_u32(&mut file, optional + 36, PE_FILE_ALIGNMENT);
        put_u32(&mut file, optional + 56, size_of_image);
        put_u32(&mut file, optional + 60, PE_SIZE_OF_HEADERS);
        for (index, (rva, size)) in self.directories.iter().enumerate() {
            put_u32(&mut file, directories_at + index * 8, *rva);
            put_u32(&mut file, directories_at + index * 8 + 4, *size);
        }

        let mut table = optional + usize::from(optional_size);
        let mut sections = Vec::new();
        for section in self.sections {
            let raw_pointer = file.len() as u32;
            let raw_size = align(section.data.len() as u32, PE_FILE_ALIGNMENT);
            file[table..table + section.name.len()].copy_from_slice(section.name.as_bytes());
            put_u32(&mut file, table + 8, section.data.len() as u32);
            put_u32(&mut file, table + 12, section.virtual_address);
            put_u32(&mut file, table + 16, raw_size);
            put_u32(&mut file, table + 20, raw_pointer);
            put_u32(&mut file, table + 36, 0x4000_0040);
            table += 40;

            file.extend_from_slice(&section.data);
            file.resize((raw_pointer + raw_size) as usize, 0);
            sections.push((section.virtual_address, raw_pointer, section.data));
        }

        PeImage {
            file,
            image_base: self.image_base,
            size_of_image,
            sections,
        }
    }
}

impl PeImage
{
    /// The image as the loader maps it: sections at their RVAs.
    pub fn loaded(&self) -> Vec<u8>
    {
        let mut loaded = vec![0u8; self.size_of_image as usize];
        loaded[..PE_SIZE_OF_HEADERS as usize].copy_from_slice(&self.file[..PE_SIZE_OF_HEADERS as usize]);
        for (virtual_address, _, data) in &self.sections {
            let start = *virtual_address as usize;
            loaded[start..start + data.len()].copy_from_slice(data);
        }
        loaded
    }

    /// File offset of `rva`, for sections added to the builder.
    pub fn file_offset(&self, rva: u32) -> u32
    {
        self.sections
            .iter()
            .find(|(virtual_address, _, data)| rva >= *virtual_address && rva < virtual_address + data.len() as u32)
            .map(|(virtual_address, raw_pointer, _)| raw_pointer + (rva - virtual_address))
            .expect("rva inside a section")
    }

    pub fn shared(&self) -> Arc<[u8]>
    {
        Arc::from(self.file.as_slice())
    }
}

/// One base relocation block for the page at `page_rva`.
pub fn relocation_block(page_rva: u32, entries: &[(u16, u16)]) -> Vec<u8>
{
    let mut block = Vec::new();
    block.extend_from_slice(&page_rva.to_le_bytes());
    block.extend_from_slice(&((8 + entries.len() * 2) as u32).to_le_bytes());
    for (kind, offset) in entries {
        block.extend_from_slice(&((kind << 12) | offset).to_le_bytes());
    }
    block
}

/// Debug directory with one CodeView entry, followed by its `RSDS` record.
///
/// `rva` and `raw_pointer` locate the returned bytes in the image.
pub fn debug_directory(rva: u32, raw_pointer: u32, pdb_path: &str, guid: [u8; 16], age: u32) -> Vec<u8>
{
    let mut record = b"RSDS".to_vec();
    record.extend_from_slice(&guid);
    record.extend_from_slice(&age.to_le_bytes());
    record.extend_from_slice(pdb_path.as_bytes());
    record.push(0);

    let mut bytes = vec![0u8; 28];
    put_u32(&mut bytes, 4, PE_TIMESTAMP);
    put_u32(&mut bytes, 12, 2);
    put_u32(&mut bytes, 16, record.len() as u32);
    put_u32(&mut bytes, 20, rva + 28);
    put_u32(&mut bytes, 24, raw_pointer + 28);
    bytes.extend_from_slice(&record);
    bytes
}

/// A 72-byte CLR header pointing at metadata.
pub fn cor20_header(metadata_rva: u32, metadata_size: u32) -> Vec<u8>
{
    let mut bytes = vec![0u8; 72];
    put_u32(&mut bytes, 0, 72);
    put_u16(&mut bytes, 4, 2);
    put_u16(&mut bytes, 6, 5);
    put_u32(&mut bytes, 8, metadata_rva);
    put_u32(&mut bytes, 12, metadata_size);
    put_u32(&mut bytes, 16, 1);
    bytes
}

/// Resource tree holding one `RT_VERSION` entry with a `VS_FIXEDFILEINFO`.
///
/// `rva` is where the returned bytes are placed in the image.
pub fn version_resource(rva: u32, version: (u16, u16, u16, u16)) -> Vec<u8>
{
    let mut bytes = vec![0u8; 88];
    // root: one id entry, RT_VERSION -> subdirectory at 24
    put_u16(&mut bytes, 14, 1);
    put_u32(&mut bytes, 16, 16);
    put_u32(&mut bytes, 20, 0x8000_0000 | 24);
    // name: one id entry, 1 -> subdirectory at 48
    put_u16(&mut bytes, 24 + 14, 1);
    put_u32(&mut bytes, 40, 1);
    put_u32(&mut bytes, 44, 0x8000_0000 | 48);
    // language: one id entry, 0x409 -> data entry at 72
    put_u16(&mut bytes, 48 + 14, 1);
    put_u32(&mut bytes, 64, 0x409);
    put_u32(&mut bytes, 68, 72);

    let info_len = 40 + 52;
    let mut info = vec![0u8; info_len];
    put_u16(&mut info, 0, info_len as u16);
    put_u16(&mut info, 2, 52);
    for (index, unit) in "VS_VERSION_INFO".encode_utf16().enumerate() {
        put_u16(&mut info, 6 + index * 2, unit);
    }
    put_u32(&mut info, 40, 0xfeef_04bd);
    put_u32(&mut info, 44, 0x0001_0000);
    put_u32(&mut info, 48, (u32::from(version.0) << 16) | u32::from(version.1));
    put_u32(&mut info, 52, (u32::from(version.2) << 16) | u32::from(version.3));

    // data entry: rva, size, codepage, reserved
    put_u32(&mut bytes, 72, rva + 88);
    put_u32(&mut bytes, 76, info.len() as u32);
    bytes.extend_from_slice(&info);
    bytes
}

/// A minimal little-endian ELF64 shared object
///
/// Layout (file offset = vaddr for the first page):
/// - `0x000`: ELF header, then three program headers
/// - `0x200`: `PT_NOTE` with the GNU build-id
/// - `0x1000` (vaddr `0x2000`): writable `PT_LOAD`, `data` followed by zeros up to `0x200`
pub struct ElfImage
{
    pub file: Vec<u8>,
    pub build_id: Vec<u8>,
}

pub const ELF_DATA_VADDR: u64 = 0x2000;

pub fn elf64(build_id: &[u8], data: &[u8]) -> ElfImage
{
    let mut note = Vec::new();
    note.extend_from_slice(&4u32.to_le_bytes());
    note.extend_from_slice(&(build_id.len() as u32).to_le_bytes());
    note.extend_from_slice(&3u32.to_le_bytes());
    note.extend_from_slice(b"GNU\0");
    note.extend_from_slice(build_id);
    while note.len() % 4 != 0 {
        note.push(0);
    }

    let mut file = vec![0u8; 0x1000];
    file[0..4].copy_from_slice(b"\x7fELF");
    file[4] = 2;
    file[5] = 1;
    file[6] = 1;
    put_u16(&mut file, 16, 3);
    put_u16(&mut file, 18, 62);
    put_u32(&mut file, 20, 1);
    put_u64(&mut file, 32, 64);
    put_u16(&mut file, 52, 64);
    put_u16(&mut file, 54, 56);
    put_u16(&mut file, 56, 3);
    put_u16(&mut file, 58, 64);

    let program_header = |file: &mut Vec<u8>, index: usize, kind: u32, flags: u32, offset: u64, vaddr: u64, size: (u64, u64)| {
        let (filesz, memsz) = size;
        let at = 64 + index * 56;
        put_u32(file, at, kind);
        put_u32(file, at + 4, flags);
        put_u64(file, at + 8, offset);
        put_u64(file, at + 16, vaddr);
        put_u64(file, at + 24, vaddr);
        put_u64(file, at + 32, filesz);
        put_u64(file, at + 40, memsz);
        // notes are 4-byte aligned; loads are page aligned
        put_u64(file, at + 48, if kind == 4 { 4 } else { 0x1000 });
    };
    // PT_LOAD r-x, PT_LOAD rw-, PT_NOTE
    program_header(&mut file, 0, 1, 5, 0, 0, (0x1000, 0x1000));
    program_header(&mut file, 1, 1, 6, 0x1000, ELF_DATA_VADDR, (0x200, 0x1000));
    program_header(&mut file, 2, 4, 4, 0x200, 0x200, (note.len() as u64, note.len() as u64));
    file[0x200..0x200 + note.len()].copy_from_slice(&note);

    let mut segment = vec![0u8; 0x200];
    segment[..data.len()].copy_from_slice(data);
    file.extend_from_slice(&segment);

    ElfImage {
        file,
        build_id: build_id.to_vec(),
    }
}

/// A minimal little-endian MachO 64 dylib
///
/// `__TEXT` maps the first page (header included), `__DATA` at vmaddr
/// `0x1000` holds `data` and is writable.
pub fn macho64(uuid: [u8; 16], data: &[u8]) -> Vec<u8>
{
    let mut file = vec![0u8; 0x1000];
    put_u32(&mut file, 0, 0xfeed_facf);
    put_u32(&mut file, 4, 0x0100_0007);
    put_u32(&mut file, 8, 3);
    put_u32(&mut file, 12, 6);
    put_u32(&mut file, 16, 3);
    put_u32(&mut file, 20, 72 + 72 + 24);

    let segment = |file: &mut Vec<u8>, at: usize, name: &str, vmaddr: u64, fileoff: u64, filesize: u64, prot: u32| {
        put_u32(file, at, 0x19);
        put_u32(file, at + 4, 72);
        file[at + 8..at + 8 + name.len()].copy_from_slice(name.as_bytes());
        put_u64(file, at + 24, vmaddr);
        put_u64(file, at + 32, 0x1000);
        put_u64(file, at + 40, fileoff);
        put_u64(file, at + 48, filesize);
        put_u32(file, at + 56, prot);
        put_u32(file, at + 60, prot);
    };
    segment(&mut file, 32, "__TEXT", 0, 0, 0x1000, 5);
    segment(&mut file, 104, "__DATA", 0x1000, 0x1000, 0x200, 3);
    put_u32(&mut file, 176, 0x1b);
    put_u32(&mut file, 180, 24);
    file[184..200].copy_from_slice(&uuid);

    let mut segment_data = vec![0u8; 0x200];
    segment_data[..data.len()].copy_from_slice(data);
    file.extend_from_slice(&segment_data);
    file
}

/// `@(#)Version <version> @Commit: <commit>` as embedded by runtime builds.
pub fn embedded_version(version: &str) -> Vec<u8>
{
    let mut bytes = vec![0x55u8; 0x30];
    bytes.extend_from_slice(format!("@(#)Version {version} @Commit: 0123456789abcdef").as_bytes());
    bytes.push(0);
    bytes
}

/// Descriptor over a fixed module list
pub struct TestTarget
{
    pub os: OperatingSystem,
    pub seeds: Vec<ModuleSeed>,
}

impl TestTarget
{
    pub fn new(os: OperatingSystem, seeds: Vec<ModuleSeed>) -> Arc<Self>
    {
        Arc::new(Self { os, seeds })
    }
}

impl TargetDescriptor for TestTarget
{
    fn operating_system(&self) -> OperatingSystem
    {
        self.os
    }

    fn pointer_size(&self) -> usize
    {
        8
    }

    fn enumerate_modules(&self) -> Result<Vec<ModuleSeed>>
    {
        Ok(self.seeds.clone())
    }
}

/// Provider serving images by file name, counting lookups
#[derive(Default)]
pub struct TestImages
{
    images: HashMap<String, Arc<[u8]>>,
    pub lookups: AtomicUsize,
}

impl TestImages
{
    pub fn with(mut self, file_name: &str, bytes: Arc<[u8]>) -> Self
    {
        self.images.insert(file_name.to_string(), bytes);
        self
    }

    pub fn lookups(&self) -> usize
    {
        self.lookups.load(Ordering::SeqCst)
    }
}

impl ImageProvider for TestImages
{
    fn locate(&self, key: &ImageKey) -> Option<ImageSource>
    {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.images.get(key.file_name()).cloned().map(ImageSource::Bytes)
    }
}

/// Raw reader that counts calls, for asserting which layer served a read
pub struct CountingMemory<M>
{
    pub inner: M,
    pub reads: AtomicUsize,
}

impl<M> CountingMemory<M>
{
    pub fn new(inner: M) -> Self
    {
        Self {
            inner,
            reads: AtomicUsize::new(0),
        }
    }

    pub fn reads(&self) -> usize
    {
        self.reads.load(Ordering::SeqCst)
    }
}

impl<M: MemoryReader> MemoryReader for CountingMemory<M>
{
    fn read(&self, address: Address, buffer: &mut [u8]) -> usize
    {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.read(address, buffer)
    }
}

/// Install a test subscriber so `RUST_LOG` works while debugging a test.
pub fn init_tracing()
{
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
