//! # Target Memory
//!
//! The read path shared by every layer of a target's memory stack.
//!
//! A stack is built from the inside out:
//!
//! 1. A data-source reader (dump memory list, live process) implementing
//!    [`MemoryReader`]. [`SnapshotMemory`] is the in-crate version.
//! 2. [`ImageMappingMemoryService`] fills short reads from module images.
//! 3. [`MetadataMappingMemoryService`] serves managed metadata from module
//!    images before anything else is consulted.
//!
//! Reads never fail with an error: a layer that cannot produce bytes reports
//! fewer bytes than requested and the caller decides what a gap means.

pub mod cache;
pub mod image;
pub mod metadata;
pub mod relocation;

use std::collections::BTreeMap;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;

pub use cache::{PageCache, PageSource, DEFAULT_CACHE_SIZE_LIMIT, PAGE_SIZE};
pub use image::{ImageMappingMemoryService, ModuleImageReader};
pub use metadata::{MetadataMappingMemoryService, MetadataRegion};

use crate::error::{ImgmapError, Result};
use crate::types::Address;

/// Read access to target memory
///
/// Implementations fill `buffer` from the start and return how many bytes
/// were read. A return value smaller than `buffer.len()` means the byte at
/// `address + returned` could not be read; nothing past it is attempted.
pub trait MemoryReader: Send + Sync
{
    /// Read up to `buffer.len()` bytes at `address`.
    fn read(&self, address: Address, buffer: &mut [u8]) -> usize;

    /// Read exactly `buffer.len()` bytes.
    ///
    /// ## Errors
    ///
    /// Returns [`ImgmapError::InvalidAddress`] naming the first unreadable byte.
    fn read_exact(&self, address: Address, buffer: &mut [u8]) -> Result<()>
    {
        let read = self.read(address, buffer);
        if read == buffer.len() {
            Ok(())
        } else {
            Err(ImgmapError::InvalidAddress(address.value().wrapping_add(read as u64)))
        }
    }

    /// Read a 32-bit little-endian value.
    ///
    /// ## Errors
    ///
    /// Returns [`ImgmapError::InvalidAddress`] if fewer than 4 bytes are readable.
    fn read_u32(&self, address: Address) -> Result<u32>
    {
        let mut bytes = [0u8; 4];
        self.read_exact(address, &mut bytes)?;
        Ok(u32::from_le_bytes(bytes))
    }

    /// Read a 64-bit little-endian value.
    ///
    /// ## Errors
    ///
    /// Returns [`ImgmapError::InvalidAddress`] if fewer than 8 bytes are readable.
    fn read_u64(&self, address: Address) -> Result<u64>
    {
        let mut bytes = [0u8; 8];
        self.read_exact(address, &mut bytes)?;
        Ok(u64::from_le_bytes(bytes))
    }

    /// Read a pointer of `pointer_size` bytes (4 or 8), zero-extended.
    ///
    /// ## Errors
    ///
    /// Returns [`ImgmapError::InvalidAddress`] if the pointer is not fully readable.
    fn read_pointer(&self, address: Address, pointer_size: usize) -> Result<u64>
    {
        if pointer_size == 4 {
            self.read_u32(address).map(u64::from)
        } else {
            self.read_u64(address)
        }
    }
}

impl<T: MemoryReader + ?Sized> MemoryReader for Arc<T>
{
    fn read(&self, address: Address, buffer: &mut [u8]) -> usize
    {
        (**self).read(address, buffer)
    }
}

impl<T: MemoryReader + ?Sized> MemoryReader for &T
{
    fn read(&self, address: Address, buffer: &mut [u8]) -> usize
    {
        (**self).read(address, buffer)
    }
}

/// `Read + Seek` view of a window of target memory
///
/// Lets stream-based parsers (notably `object::ReadCache`) parse headers
/// straight out of the target. A short read from the underlying reader
/// surfaces as end-of-stream.
pub struct MemoryStream<'a>
{
    memory: &'a dyn MemoryReader,
    base: u64,
    size: u64,
    position: u64,
}

impl<'a> MemoryStream<'a>
{
    /// Stream over `[base, base + size)`.
    pub fn new(memory: &'a dyn MemoryReader, base: Address, size: u64) -> Self
    {
        Self {
            memory,
            base: base.value(),
            size,
            position: 0,
        }
    }
}

impl Read for MemoryStream<'_>
{
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>
    {
        if self.position >= self.size {
            return Ok(0);
        }
        let available = usize::try_from(self.size - self.position).unwrap_or(usize::MAX);
        let len = buf.len().min(available);
        let address = Address::new(self.base.wrapping_add(self.position));
        let read = self.memory.read(address, &mut buf[..len]);
        self.position += read as u64;
        Ok(read)
    }
}

impl Seek for MemoryStream<'_>
{
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64>
    {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => self.size.checked_add_signed(delta),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
        };
        let target =
            target.ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "seek before start of memory stream"))?;
        self.position = target;
        Ok(target)
    }
}

/// Sparse set of captured memory ranges
///
/// The shape of a dump's memory list: each range is a base address and the
/// bytes captured there. Reads continue across adjacent ranges and stop at
/// the first gap.
///
/// ```rust
/// use imgmap_core::memory::{MemoryReader, SnapshotMemory};
/// use imgmap_core::types::Address;
///
/// let mut memory = SnapshotMemory::new();
/// memory.insert(Address::from(0x1000), vec![1, 2, 3, 4]);
///
/// let mut buffer = [0u8; 8];
/// assert_eq!(memory.read(Address::from(0x1002), &mut buffer), 2);
/// assert_eq!(&buffer[..2], &[3, 4]);
/// ```
#[derive(Debug, Default, Clone)]
pub struct SnapshotMemory
{
    ranges: BTreeMap<u64, Vec<u8>>,
}

impl SnapshotMemory
{
    /// Empty snapshot.
    #[must_use]
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Add a captured range, replacing any range with the same base.
    pub fn insert(&mut self, base: Address, bytes: Vec<u8>)
    {
        self.ranges.insert(base.value(), bytes);
    }

    /// Number of captured ranges.
    #[must_use]
    pub fn len(&self) -> usize
    {
        self.ranges.len()
    }

    /// Whether nothing has been captured.
    #[must_use]
    pub fn is_empty(&self) -> bool
    {
        self.ranges.is_empty()
    }

    fn range_containing(&self, address: u64) -> Option<(u64, &[u8])>
    {
        let (&start, bytes) = self.ranges.range(..=address).next_back()?;
        let offset = address - start;
        (offset < bytes.len() as u64).then(|| (offset, bytes.as_slice()))
    }
}

impl MemoryReader for SnapshotMemory
{
    fn read(&self, address: Address, buffer: &mut [u8]) -> usize
    {
        let mut copied = 0usize;
        while copied < buffer.len() {
            let Some(current) = address.value().checked_add(copied as u64) else {
                break;
            };
            let Some((offset, bytes)) = self.range_containing(current) else {
                break;
            };
            // offset < bytes.len(), so it fits in usize
            let offset = usize::try_from(offset).unwrap_or(usize::MAX);
            let chunk = (bytes.len() - offset).min(buffer.len() - copied);
            buffer[copied..copied + chunk].copy_from_slice(&bytes[offset..offset + chunk]);
            copied += chunk;
        }
        copied
    }
}
