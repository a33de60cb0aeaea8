//! # PE Images
//!
//! Header, section table and data directory parsing for PE32 and PE32+
//! images in either file or loaded layout.
//!
//! The NT headers and section table are parsed with `object`. The debug
//! directory, CodeView record, CLR header and version resource are small
//! fixed structures read through [`ImageBytes`], so the same code works on an
//! image file and on an image sitting in target memory.

use std::fmt;

use object::pe::{self, ImageDosHeader, ImageNtHeaders32, ImageNtHeaders64};
use object::read::pe::{optional_header_magic, ImageNtHeaders, ImageOptionalHeader};
use object::LittleEndian as LE;
use tracing::{debug, trace};

use super::{ImageBytes, ModuleLayout};
use crate::error::{ImgmapError, Result};

/// Bytes read from the start of an image to parse its headers.
pub const HEADER_PROBE_SIZE: usize = 0x1000;

const DEBUG_DIRECTORY_ENTRY_SIZE: usize = 28;
const MAX_DEBUG_RECORDS: usize = 64;
const COR20_HEADER_SIZE: usize = 72;
const CODEVIEW_RSDS: &[u8; 4] = b"RSDS";
const MAX_PDB_PATH: usize = 1024;
const RESOURCE_DIRECTORY_SIZE: u64 = 16;
const RESOURCE_ENTRY_SIZE: u64 = 8;
const RESOURCE_SUBDIRECTORY: u32 = 0x8000_0000;
const MAX_VERSION_RESOURCE: usize = 0x1000;
const FIXED_FILE_INFO_SIGNATURE: u32 = 0xfeef_04bd;

/// One entry of the section table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionHeader
{
    /// Section name with trailing NULs removed
    pub name: String,
    pub virtual_address: u32,
    pub virtual_size: u32,
    pub pointer_to_raw_data: u32,
    pub size_of_raw_data: u32,
}

impl SectionHeader
{
    /// Extent of the section in loaded layout.
    ///
    /// Some linkers leave `virtual_size` zero; the raw size is used then.
    #[must_use]
    pub fn virtual_span(&self) -> u32
    {
        if self.virtual_size == 0 {
            self.size_of_raw_data
        } else {
            self.virtual_size
        }
    }

    /// Whether `rva` lies inside the section's loaded extent.
    #[must_use]
    pub fn contains_rva(&self, rva: u32) -> bool
    {
        rva >= self.virtual_address && u64::from(rva) < u64::from(self.virtual_address) + u64::from(self.virtual_span())
    }
}

/// Optional-header fields, section table and data directories of a PE image
#[derive(Debug, Clone)]
pub struct PeHeaders
{
    pub layout: ModuleLayout,
    pub is_pe32_plus: bool,
    pub machine: u16,
    /// Preferred (link-time) base address
    pub image_base: u64,
    pub size_of_image: u32,
    pub size_of_headers: u32,
    pub time_date_stamp: u32,
    pub sections: Vec<SectionHeader>,
    directories: Vec<(u32, u32)>,
}

impl PeHeaders
{
    /// Parse DOS, NT and section headers from the start of an image.
    ///
    /// `layout` records how the rest of the image is laid out; it does not
    /// affect header parsing since headers sit at offset zero either way.
    ///
    /// ## Errors
    ///
    /// Returns [`ImgmapError::Object`] if the headers fail validation.
    pub fn parse(data: &[u8], layout: ModuleLayout) -> Result<Self>
    {
        match optional_header_magic(data)? {
            pe::IMAGE_NT_OPTIONAL_HDR64_MAGIC => Self::parse_nt::<ImageNtHeaders64>(data, layout, true),
            pe::IMAGE_NT_OPTIONAL_HDR32_MAGIC => Self::parse_nt::<ImageNtHeaders32>(data, layout, false),
            magic => Err(ImgmapError::BadImageFormat(format!("unknown optional header magic 0x{magic:04x}"))),
        }
    }

    fn parse_nt<Pe: ImageNtHeaders>(data: &[u8], layout: ModuleLayout, is_pe32_plus: bool) -> Result<Self>
    {
        let dos = ImageDosHeader::parse(data)?;
        let mut offset = u64::from(dos.nt_headers_offset());
        let (nt, data_directories) = Pe::parse(data, &mut offset)?;
        let section_table = nt.sections(data, offset)?;

        let sections = section_table
            .iter()
            .map(|section| SectionHeader {
                name: String::from_utf8_lossy(&section.name)
                    .trim_end_matches('\0')
                    .to_string(),
                virtual_address: section.virtual_address.get(LE),
                virtual_size: section.virtual_size.get(LE),
                pointer_to_raw_data: section.pointer_to_raw_data.get(LE),
                size_of_raw_data: section.size_of_raw_data.get(LE),
            })
            .collect();
        let directories = data_directories
            .iter()
            .map(|directory| (directory.virtual_address.get(LE), directory.size.get(LE)))
            .collect();

        let optional = nt.optional_header();
        let file_header = nt.file_header();
        Ok(Self {
            layout,
            is_pe32_plus,
            machine: file_header.machine.get(LE),
            image_base: optional.image_base(),
            size_of_image: optional.size_of_image(),
            size_of_headers: optional.size_of_headers(),
            time_date_stamp: file_header.time_date_stamp.get(LE),
            sections,
            directories,
        })
    }

    /// `(rva, size)` of a data directory, or `None` if absent or empty.
    #[must_use]
    pub fn directory(&self, index: usize) -> Option<(u32, u32)>
    {
        self.directories
            .get(index)
            .copied()
            .filter(|&(rva, size)| rva != 0 && size != 0)
    }

    /// Section whose loaded extent contains `rva`.
    #[must_use]
    pub fn section_containing(&self, rva: u32) -> Option<&SectionHeader>
    {
        self.sections.iter().find(|section| section.contains_rva(rva))
    }

    /// File offset backing `rva`, or `None` if no raw data backs it.
    #[must_use]
    pub fn file_offset(&self, rva: u32) -> Option<u32>
    {
        if rva < self.size_of_headers {
            return Some(rva);
        }
        self.sections.iter().find_map(|section| {
            let delta = rva.checked_sub(section.virtual_address)?;
            (delta < section.size_of_raw_data && delta < section.virtual_span())
                .then(|| section.pointer_to_raw_data.checked_add(delta))
                .flatten()
        })
    }

    /// RVA of a file offset, or `None` if it falls outside headers and sections.
    #[must_use]
    pub fn offset_to_rva(&self, offset: u32) -> Option<u32>
    {
        if offset < self.size_of_headers {
            return Some(offset);
        }
        self.sections.iter().find_map(|section| {
            let delta = offset.checked_sub(section.pointer_to_raw_data)?;
            (delta < section.size_of_raw_data).then(|| section.virtual_address.checked_add(delta)).flatten()
        })
    }

    /// Offset of `rva` from the image start in this image's own layout.
    #[must_use]
    pub fn rva_to_offset(&self, rva: u32) -> Option<u64>
    {
        match self.layout {
            ModuleLayout::Loaded => Some(u64::from(rva)),
            ModuleLayout::File | ModuleLayout::Unknown => self.file_offset(rva).map(u64::from),
        }
    }

    fn read_directory<B: ImageBytes + ?Sized>(&self, bytes: &B, index: usize, limit: usize) -> Option<Vec<u8>>
    {
        let (rva, size) = self.directory(index)?;
        let offset = self.rva_to_offset(rva)?;
        let len = usize::try_from(size).ok()?.min(limit);
        bytes.read_vec(offset, len)
    }

    /// Relocation table bytes of an image file (file layout only).
    #[must_use]
    pub fn relocation_table<'a>(&self, data: &'a [u8]) -> Option<&'a [u8]>
    {
        let (rva, size) = self.directory(pe::IMAGE_DIRECTORY_ENTRY_BASERELOC)?;
        let start = usize::try_from(self.file_offset(rva)?).ok()?;
        let end = start.checked_add(usize::try_from(size).ok()?)?.min(data.len());
        data.get(start..end)
    }

    /// File version from the `VS_FIXEDFILEINFO` of the version resource,
    /// as the `(dwFileVersionMS, dwFileVersionLS)` pair.
    #[must_use]
    pub fn fixed_file_version<B: ImageBytes + ?Sized>(&self, bytes: &B) -> Option<(u32, u32)>
    {
        let (root_rva, _) = self.directory(pe::IMAGE_DIRECTORY_ENTRY_RESOURCE)?;
        let root = self.rva_to_offset(root_rva)?;

        // type -> name -> language -> data entry
        let by_type = resource_entry(bytes, root, 0, Some(u32::from(pe::RT_VERSION)))?;
        let by_name = resource_entry(bytes, root, subdirectory(by_type)?, None)?;
        let by_language = resource_entry(bytes, root, subdirectory(by_name)?, None)?;
        if by_language & RESOURCE_SUBDIRECTORY != 0 {
            return None;
        }

        let entry = bytes.read_vec(root + u64::from(by_language), 8)?;
        let data_rva = le_u32(&entry, 0);
        let data_size = usize::try_from(le_u32(&entry, 4)).ok()?.min(MAX_VERSION_RESOURCE);
        let data = bytes.read_vec(self.rva_to_offset(data_rva)?, data_size)?;

        (0..data.len().saturating_sub(16))
            .step_by(4)
            .find(|&at| le_u32(&data, at) == FIXED_FILE_INFO_SIGNATURE)
            .map(|at| (le_u32(&data, at + 8), le_u32(&data, at + 12)))
    }
}

fn subdirectory(entry: u32) -> Option<u32>
{
    (entry & RESOURCE_SUBDIRECTORY != 0).then_some(entry & !RESOURCE_SUBDIRECTORY)
}

/// Data/subdirectory field of the entry with `id` (or the first entry) in
/// the resource directory at `root + directory`.
fn resource_entry<B: ImageBytes + ?Sized>(bytes: &B, root: u64, directory: u32, id: Option<u32>) -> Option<u32>
{
    let start = root + u64::from(directory);
    let header = bytes.read_vec(start, 16)?;
    let count = u64::from(le_u16(&header, 12)) + u64::from(le_u16(&header, 14));
    (0..count).find_map(|index| {
        let entry = bytes.read_vec(start + RESOURCE_DIRECTORY_SIZE + index * RESOURCE_ENTRY_SIZE, 8)?;
        let name = le_u32(&entry, 0);
        match id {
            Some(id) if name != id => None,
            _ => Some(le_u32(&entry, 4)),
        }
    })
}

/// One record of the debug directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebugRecord
{
    pub kind: u32,
    pub size_of_data: u32,
    pub address_of_raw_data: u32,
    pub pointer_to_raw_data: u32,
}

impl DebugRecord
{
    fn parse(bytes: &[u8]) -> Self
    {
        Self {
            kind: le_u32(bytes, 12),
            size_of_data: le_u32(bytes, 16),
            address_of_raw_data: le_u32(bytes, 20),
            pointer_to_raw_data: le_u32(bytes, 24),
        }
    }

    /// Zero-filled or misread entries have a zero or out-of-range type.
    fn is_plausible(&self) -> bool
    {
        self.kind != 0 && self.kind < 0x20
    }
}

/// PDB identity from a CodeView `RSDS` debug record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PdbInfo
{
    pub path: String,
    pub guid: [u8; 16],
    pub age: u32,
}

impl PdbInfo
{
    fn parse(record: &[u8]) -> Option<Self>
    {
        if record.len() < 24 || &record[..4] != CODEVIEW_RSDS {
            return None;
        }
        let mut guid = [0u8; 16];
        guid.copy_from_slice(&record[4..20]);
        let age = le_u32(record, 20);
        let path = &record[24..];
        let end = path.iter().position(|&byte| byte == 0).unwrap_or(path.len());
        Some(Self {
            path: String::from_utf8_lossy(&path[..end]).into_owned(),
            guid,
            age,
        })
    }
}

impl fmt::Display for PdbInfo
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let g = &self.guid;
        write!(
            f,
            "{} {{{:08x}-{:04x}-{:04x}-",
            self.path,
            le_u32(g, 0),
            le_u16(g, 4),
            le_u16(g, 6)
        )?;
        for byte in &g[8..10] {
            write!(f, "{byte:02x}")?;
        }
        f.write_str("-")?;
        for byte in &g[10..] {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "}} {}", self.age)
    }
}

/// The part of the CLR (COR20) header this crate needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorHeader
{
    pub metadata_rva: u32,
    pub metadata_size: u32,
    pub flags: u32,
}

/// Everything probed from a PE image in one layout
#[derive(Debug, Clone)]
pub struct PeImageInfo
{
    pub headers: PeHeaders,
    pub debug_records: Vec<DebugRecord>,
    pub pdb: Option<PdbInfo>,
    pub cor_header: Option<CorHeader>,
}

impl PeImageInfo
{
    /// Parse headers, debug directory and CLR header assuming `layout`.
    ///
    /// ## Errors
    ///
    /// Fails only if the headers themselves do not parse; unreadable debug or
    /// CLR data just leaves those fields empty.
    pub fn parse<B: ImageBytes + ?Sized>(bytes: &B, layout: ModuleLayout) -> Result<Self>
    {
        let mut header = vec![0u8; HEADER_PROBE_SIZE];
        let read = bytes.read_bytes(0, &mut header);
        header.truncate(read);
        let headers = PeHeaders::parse(&header, layout)?;

        let debug_records: Vec<DebugRecord> = headers
            .read_directory(
                bytes,
                pe::IMAGE_DIRECTORY_ENTRY_DEBUG,
                DEBUG_DIRECTORY_ENTRY_SIZE * MAX_DEBUG_RECORDS,
            )
            .map(|table| {
                table
                    .chunks_exact(DEBUG_DIRECTORY_ENTRY_SIZE)
                    .map(DebugRecord::parse)
                    .filter(DebugRecord::is_plausible)
                    .collect()
            })
            .unwrap_or_default();

        let pdb = debug_records
            .iter()
            .filter(|record| record.kind == pe::IMAGE_DEBUG_TYPE_CODEVIEW)
            .find_map(|record| {
                let offset = match layout {
                    ModuleLayout::Loaded => u64::from(record.address_of_raw_data),
                    ModuleLayout::File | ModuleLayout::Unknown => u64::from(record.pointer_to_raw_data),
                };
                let len = usize::try_from(record.size_of_data).ok()?.min(24 + MAX_PDB_PATH);
                PdbInfo::parse(&bytes.read_vec(offset, len)?)
            });

        let cor_header = headers
            .read_directory(bytes, pe::IMAGE_DIRECTORY_ENTRY_COM_DESCRIPTOR, COR20_HEADER_SIZE)
            .filter(|raw| raw.len() == COR20_HEADER_SIZE && le_u32(raw, 0) as usize >= COR20_HEADER_SIZE)
            .map(|raw| CorHeader {
                metadata_rva: le_u32(&raw, 8),
                metadata_size: le_u32(&raw, 12),
                flags: le_u32(&raw, 16),
            });

        trace!(
            ?layout,
            sections = headers.sections.len(),
            debug_records = debug_records.len(),
            managed = cor_header.is_some(),
            "parsed PE headers"
        );
        if pdb.is_none() && !debug_records.is_empty() {
            debug!(?layout, "PE image has debug records but no readable CodeView record");
        }

        Ok(Self {
            headers,
            debug_records,
            pdb,
            cor_header,
        })
    }

    /// Whether the image carries a CLR header.
    #[must_use]
    pub fn is_managed(&self) -> bool
    {
        self.cor_header.is_some()
    }

    /// `(rva, size)` of the managed metadata, if present and non-empty.
    #[must_use]
    pub fn metadata_directory(&self) -> Option<(u32, u32)>
    {
        self.cor_header
            .filter(|cor| cor.metadata_rva != 0 && cor.metadata_size != 0)
            .map(|cor| (cor.metadata_rva, cor.metadata_size))
    }
}

pub(crate) fn le_u16(bytes: &[u8], offset: usize) -> u16
{
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

pub(crate) fn le_u32(bytes: &[u8], offset: usize) -> u32
{
    u32::from_le_bytes([bytes[offset], bytes[offset + 1], bytes[offset + 2], bytes[offset + 3]])
}
