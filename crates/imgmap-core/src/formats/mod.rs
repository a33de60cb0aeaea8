//! # Binary Formats
//!
//! Parsing of PE, ELF and MachO images, both straight out of target memory
//! (to probe a module's format and identity) and from image files located on
//! disk (to reconstruct missing memory).
//!
//! Headers are parsed with the `object` crate. The few structures `object`
//! has no reader for in this shape (PE debug/CLR/resource tables, ELF notes
//! read from memory) are decoded from `object`'s `Pod` definitions or by hand.

pub mod elf;
pub mod image;
pub mod macho;
pub mod pe;

pub use image::{ImageKind, ModuleImage, SegmentMap, VirtualSegment};
pub use pe::{CorHeader, DebugRecord, PdbInfo, PeHeaders, PeImageInfo, SectionHeader};

use crate::memory::MemoryReader;
use crate::types::Address;

/// Upper bound on ELF program header and MachO load command tables read
/// from an image.
pub const MAX_HEADER_TABLE_SIZE: usize = 0x10000;

/// How the bytes of a PE image are laid out in the address range they occupy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ModuleLayout
{
    /// On-disk layout: sections sit at their raw file offsets
    File,
    /// Mapped layout: sections sit at their RVAs, padded to section alignment
    Loaded,
    /// Not a PE image, or the headers could not be parsed
    #[default]
    Unknown,
}

/// Random access to the bytes of an image, by offset from its start
///
/// Implemented for plain byte slices (image files) and for [`MappedImage`]
/// (an image as it sits in target memory).
pub trait ImageBytes
{
    /// Read up to `buffer.len()` bytes at `offset`; returns the count read.
    fn read_bytes(&self, offset: u64, buffer: &mut [u8]) -> usize;

    /// Read exactly `len` bytes at `offset`, or nothing.
    fn read_vec(&self, offset: u64, len: usize) -> Option<Vec<u8>>
    {
        let mut buffer = vec![0u8; len];
        (self.read_bytes(offset, &mut buffer) == len).then_some(buffer)
    }
}

impl ImageBytes for [u8]
{
    fn read_bytes(&self, offset: u64, buffer: &mut [u8]) -> usize
    {
        let Ok(start) = usize::try_from(offset) else {
            return 0;
        };
        let Some(available) = self.get(start..) else {
            return 0;
        };
        let len = available.len().min(buffer.len());
        buffer[..len].copy_from_slice(&available[..len]);
        len
    }
}

/// An image as it sits in target memory at `base`, bounded by `size`
pub struct MappedImage<'a>
{
    memory: &'a dyn MemoryReader,
    base: Address,
    size: u64,
}

impl<'a> MappedImage<'a>
{
    /// View `[base, base + size)` of `memory` as image bytes.
    pub fn new(memory: &'a dyn MemoryReader, base: Address, size: u64) -> Self
    {
        Self { memory, base, size }
    }

    /// Base address of the view.
    pub fn base(&self) -> Address
    {
        self.base
    }
}

impl ImageBytes for MappedImage<'_>
{
    fn read_bytes(&self, offset: u64, buffer: &mut [u8]) -> usize
    {
        if offset >= self.size {
            return 0;
        }
        let available = usize::try_from(self.size - offset).unwrap_or(usize::MAX);
        let len = buffer.len().min(available);
        match self.base.checked_add(offset) {
            Some(address) => self.memory.read(address, &mut buffer[..len]),
            None => 0,
        }
    }
}
