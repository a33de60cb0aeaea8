//! ELF program headers and GNU build-id notes.
//!
//! Used to identify an ELF module from its headers in target memory. The
//! headers are parsed with `object`; notes are walked by hand because in
//! memory they live at a virtual address, not at the file offset `object`'s
//! note iterator expects.

use object::elf::{FileHeader32, FileHeader64, ELFCLASS64, ELF_NOTE_GNU, NT_GNU_BUILD_ID, PF_W, PT_LOAD, PT_NOTE};
use object::read::elf::{FileHeader, ProgramHeader};
use object::{Endian, Endianness};

use super::{ImageBytes, MAX_HEADER_TABLE_SIZE};
use crate::error::{ImgmapError, Result};

const PAGE_MASK: u64 = 0xfff;
/// Index of the class byte in `e_ident`
const IDENT_CLASS: usize = 4;
const MAX_NOTE_SEGMENT: u64 = 0x10000;

/// A `PT_LOAD` segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElfLoadSegment
{
    pub vaddr: u64,
    pub memsz: u64,
    pub writable: bool,
}

/// The program-header view of an ELF image
#[derive(Debug, Clone, Default)]
pub struct ElfProgramHeaders
{
    pub little_endian: bool,
    /// Page-aligned vaddr of the first `PT_LOAD`; the ELF header sits here.
    pub base_vaddr: u64,
    pub loads: Vec<ElfLoadSegment>,
    /// `(vaddr, memsz)` of each `PT_NOTE`
    pub notes: Vec<(u64, u64)>,
}

impl ElfProgramHeaders
{
    /// Parse the ELF header and program headers of an image.
    ///
    /// ## Errors
    ///
    /// Returns an error if the image is not ELF or the program headers are
    /// not readable.
    pub fn read<B: ImageBytes + ?Sized>(bytes: &B) -> Result<Self>
    {
        let ident = bytes
            .read_vec(0, 64)
            .ok_or_else(|| ImgmapError::BadImageFormat("ELF header not readable".to_string()))?;
        if ident[IDENT_CLASS] == ELFCLASS64 {
            Self::read_class::<FileHeader64<Endianness>, B>(bytes, &ident)
        } else {
            Self::read_class::<FileHeader32<Endianness>, B>(bytes, &ident)
        }
    }

    fn read_class<Elf: FileHeader<Endian = Endianness>, B: ImageBytes + ?Sized>(bytes: &B, ident: &[u8]) -> Result<Self>
    {
        let header = Elf::parse(ident)?;
        let endian = header.endian()?;

        let phoff: u64 = header.e_phoff(endian).into();
        let table_size = u64::from(header.e_phnum(endian)) * u64::from(header.e_phentsize(endian));
        let needed = phoff
            .checked_add(table_size)
            .and_then(|end| usize::try_from(end).ok())
            .filter(|&end| end <= MAX_HEADER_TABLE_SIZE)
            .ok_or_else(|| ImgmapError::BadImageFormat("ELF program header table out of range".to_string()))?;
        let data = bytes
            .read_vec(0, needed)
            .ok_or_else(|| ImgmapError::BadImageFormat("ELF program headers not readable".to_string()))?;
        let header = Elf::parse(data.as_slice())?;

        let mut result = Self {
            little_endian: endian.is_little_endian(),
            ..Self::default()
        };
        for program_header in header.program_headers(endian, data.as_slice())? {
            let vaddr: u64 = program_header.p_vaddr(endian).into();
            let memsz: u64 = program_header.p_memsz(endian).into();
            match program_header.p_type(endian) {
                PT_LOAD => result.loads.push(ElfLoadSegment {
                    vaddr,
                    memsz,
                    writable: program_header.p_flags(endian) & PF_W != 0,
                }),
                PT_NOTE => result.notes.push((vaddr, memsz)),
                _ => {}
            }
        }
        result.base_vaddr = result
            .loads
            .iter()
            .map(|segment| segment.vaddr)
            .min()
            .unwrap_or(0)
            & !PAGE_MASK;
        Ok(result)
    }

    /// GNU build-id read from the `PT_NOTE` segments of a mapped image.
    ///
    /// `bytes` must address the image from its ELF header, in loaded layout.
    #[must_use]
    pub fn build_id<B: ImageBytes + ?Sized>(&self, bytes: &B) -> Option<Vec<u8>>
    {
        self.notes.iter().find_map(|&(vaddr, memsz)| {
            let offset = vaddr.checked_sub(self.base_vaddr)?;
            let len = usize::try_from(memsz.min(MAX_NOTE_SEGMENT)).ok()?;
            let mut notes = vec![0u8; len];
            let read = bytes.read_bytes(offset, &mut notes);
            find_gnu_build_id(&notes[..read], self.little_endian)
        })
    }

    /// `(rva, size)` of every writable `PT_LOAD` segment.
    pub fn writable_ranges(&self) -> impl Iterator<Item = (u64, u64)> + '_
    {
        self.loads
            .iter()
            .filter(|segment| segment.writable)
            .filter_map(|segment| Some((segment.vaddr.checked_sub(self.base_vaddr)?, segment.memsz)))
    }
}

/// Walk a run of ELF notes and return the `NT_GNU_BUILD_ID` descriptor.
#[must_use]
pub fn find_gnu_build_id(notes: &[u8], little_endian: bool) -> Option<Vec<u8>>
{
    let endian = if little_endian { Endianness::Little } else { Endianness::Big };
    let word = |at: usize| -> Option<u32> {
        let bytes: [u8; 4] = notes.get(at..at + 4)?.try_into().ok()?;
        Some(endian.read_u32_bytes(bytes))
    };

    let mut offset = 0usize;
    while offset + 12 <= notes.len() {
        let name_size = usize::try_from(word(offset)?).ok()?;
        let desc_size = usize::try_from(word(offset + 4)?).ok()?;
        let kind = word(offset + 8)?;

        let name_start = offset + 12;
        let desc_start = name_start.checked_add(align4(name_size))?;
        let desc_end = desc_start.checked_add(desc_size)?;
        if desc_end > notes.len() {
            return None;
        }

        let name = &notes[name_start..name_start + name_size];
        let name = name.strip_suffix(&[0]).unwrap_or(name);
        if kind == NT_GNU_BUILD_ID && name == ELF_NOTE_GNU.strip_suffix(&[0]).unwrap_or(ELF_NOTE_GNU) {
            return Some(notes[desc_start..desc_end].to_vec());
        }
        offset = desc_start.checked_add(align4(desc_size))?;
    }
    None
}

fn align4(value: usize) -> usize
{
    (value + 3) & !3
}
