//! # Image-Backed Memory
//!
//! Fills reads the data source cannot satisfy with bytes reconstructed from
//! module image files.
//!
//! Dumps routinely omit the pages of mapped images since they can be found
//! again on disk or on a symbol server. A read that comes back short from
//! the wrapped reader continues in a [`PageCache`] whose pages are produced
//! by [`ModuleImageReader`]:
//!
//! 1. find the module containing the page
//! 2. locate its image through the module's [`ImageProvider`](crate::provider::ImageProvider)
//! 3. extract the bytes the image maps at that address
//! 4. for PE images, apply base relocations for the module's actual base

use std::cell::RefCell;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Weak};

use tracing::{debug, trace, warn};

use super::cache::{PageCache, PageSource};
use super::relocation::apply_relocations;
use super::MemoryReader;
use crate::events::FlushSignal;
use crate::formats::pe::SectionHeader;
use crate::formats::{ModuleImage, ModuleLayout, PeImageInfo};
use crate::modules::{Module, ModuleDirectory};
use crate::types::Address;

/// Bytes read on either side of a slice so relocated fields that straddle
/// its edges are still patched.
const RELOCATION_PADDING: u32 = 8;

thread_local! {
    static IN_FLIGHT: RefCell<HashSet<u64>> = RefCell::new(HashSet::new());
}

/// Marks a module's image base as being resolved on this thread
struct InFlightGuard
{
    image_base: u64,
}

impl InFlightGuard
{
    /// `None` if `image_base` is already being resolved further up the stack.
    fn enter(image_base: u64) -> Option<Self>
    {
        IN_FLIGHT
            .with(|in_flight| in_flight.borrow_mut().insert(image_base))
            .then_some(Self { image_base })
    }
}

impl Drop for InFlightGuard
{
    fn drop(&mut self)
    {
        IN_FLIGHT.with(|in_flight| {
            in_flight.borrow_mut().remove(&self.image_base);
        });
    }
}

/// [`PageSource`] producing pages from module images
pub struct ModuleImageReader
{
    modules: Arc<ModuleDirectory>,
}

impl ModuleImageReader
{
    pub fn new(modules: Arc<ModuleDirectory>) -> Self
    {
        Self { modules }
    }

    /// Bytes the module containing `address` maps there, at most `size`.
    ///
    /// Every failure (no module, no image, bad RVA) is logged and yields
    /// `None`; the page cache remembers it for the rest of the epoch.
    pub fn read_from_module(&self, address: Address, size: usize) -> Option<Vec<u8>>
    {
        let module = match self.modules.lookup_by_address(address) {
            Ok(Some(module)) => module,
            Ok(None) => {
                trace!(%address, "no module maps address");
                return None;
            }
            Err(error) => {
                warn!(%address, %error, "module directory unavailable");
                return None;
            }
        };

        let Some(_guard) = InFlightGuard::enter(module.image_base().value()) else {
            debug!(%address, module = module.name(), "recursive image read; giving up");
            return None;
        };

        let rva = address.value() - module.image_base().value();
        let image = module.image()?;
        let mut bytes = if module.is_pe() {
            read_pe(&module, &image, u32::try_from(rva).ok()?, size)?
        } else {
            match image.read_virtual(rva, size) {
                Ok(bytes) => bytes,
                Err(error) => {
                    debug!(%address, module = module.name(), %error, "address not mapped by image");
                    return None;
                }
            }
        };
        bytes.truncate(size);
        trace!(%address, module = module.name(), size = bytes.len(), "read from module image");
        Some(bytes)
    }
}

impl PageSource for ModuleImageReader
{
    fn fetch_page(&self, base: Address, size: usize) -> Option<Vec<u8>>
    {
        self.read_from_module(base, size)
    }
}

/// Bytes of a PE module at `rva`, continuing across headers and sections
/// until `size` bytes are produced or the image has nothing more to give.
fn read_pe(module: &Module, image: &ModuleImage, rva: u32, size: usize) -> Option<Vec<u8>>
{
    let info = image.pe()?;
    let mut bytes = Vec::with_capacity(size);
    while bytes.len() < size {
        let at = u32::try_from(bytes.len()).ok().and_then(|read| rva.checked_add(read))?;
        let remaining = size - bytes.len();
        // a module of unknown layout is treated as a flat file mapping
        let chunk = match module.layout() {
            ModuleLayout::Loaded => read_loaded(module, image, info, at, remaining),
            ModuleLayout::File | ModuleLayout::Unknown => read_file_layout(module, image, info, at, remaining),
        };
        match chunk {
            Some(chunk) if !chunk.is_empty() => bytes.extend_from_slice(&chunk),
            _ => break,
        }
    }
    (!bytes.is_empty()).then_some(bytes)
}

/// Module mapped the way the loader maps it: sections at their RVAs.
fn read_loaded(module: &Module, image: &ModuleImage, info: &PeImageInfo, rva: u32, size: usize) -> Option<Vec<u8>>
{
    let headers = &info.headers;
    if rva < headers.size_of_headers {
        return Some(header_bytes(image.data(), headers.size_of_headers, rva, size));
    }
    let Some(section) = headers.section_containing(rva) else {
        if rva >= headers.size_of_image {
            debug!(rva, module = module.name(), "rva past the end of the image");
            return None;
        }
        // alignment padding between sections is zero-filled by the loader
        let next = headers
            .sections
            .iter()
            .map(|section| section.virtual_address)
            .filter(|&start| start > rva)
            .min()
            .unwrap_or(headers.size_of_image);
        let len = ((next - rva) as usize).min(size);
        return Some(vec![0u8; len]);
    };
    let offset = rva - section.virtual_address;
    Some(relocated_section_slice(
        module,
        image,
        info,
        section,
        section.virtual_span(),
        offset,
        size,
    ))
}

/// Module mapped as a flat copy of its file: sections at raw offsets.
fn read_file_layout(
    module: &Module,
    image: &ModuleImage,
    info: &PeImageInfo,
    offset: u32,
    size: usize,
) -> Option<Vec<u8>>
{
    let headers = &info.headers;
    if offset < headers.size_of_headers {
        return Some(header_bytes(image.data(), headers.size_of_headers, offset, size));
    }
    let Some(section) = headers.sections.iter().find(|section| {
        offset >= section.pointer_to_raw_data && offset - section.pointer_to_raw_data < section.size_of_raw_data
    }) else {
        debug!(offset, module = module.name(), "file offset outside every section");
        return None;
    };
    Some(relocated_section_slice(
        module,
        image,
        info,
        section,
        section.size_of_raw_data,
        offset - section.pointer_to_raw_data,
        size,
    ))
}

fn header_bytes(data: &[u8], size_of_headers: u32, offset: u32, size: usize) -> Vec<u8>
{
    let start = offset as usize;
    let end = (size_of_headers as usize).min(data.len()).min(start.saturating_add(size));
    data.get(start..end).unwrap_or_default().to_vec()
}

/// `size` bytes at `offset` into `section` (whose extent in the module's
/// layout is `span`), relocated for the module's load address.
///
/// Bytes past the section's raw data are zero, as the loader leaves them.
fn relocated_section_slice(
    module: &Module,
    image: &ModuleImage,
    info: &PeImageInfo,
    section: &SectionHeader,
    span: u32,
    offset: u32,
    size: usize,
) -> Vec<u8>
{
    let len = u32::try_from(size).unwrap_or(u32::MAX).min(span - offset);
    let padded_start = offset.saturating_sub(RELOCATION_PADDING);
    let padded_end = offset.saturating_add(len).saturating_add(RELOCATION_PADDING).min(span);

    let mut padded = vec![0u8; (padded_end - padded_start) as usize];
    let raw_end = padded_end.min(section.size_of_raw_data);
    if padded_start < raw_end {
        let file_start = section.pointer_to_raw_data as usize + padded_start as usize;
        let file_end = section.pointer_to_raw_data as usize + raw_end as usize;
        let data = image.data();
        let available = data.get(file_start..file_end.min(data.len())).unwrap_or_default();
        padded[..available.len()].copy_from_slice(available);
    }

    let delta = module.image_base().value().wrapping_sub(info.headers.image_base);
    if let Some(table) = info.headers.relocation_table(image.data()) {
        let summary = apply_relocations(table, section.virtual_address + padded_start, &mut padded, delta);
        if summary.unsupported > 0 {
            debug!(module = module.name(), unsupported = summary.unsupported, "unsupported relocations skipped");
        }
    }

    let start = (offset - padded_start) as usize;
    padded[start..start + len as usize].to_vec()
}

/// Memory layer that completes short reads from module images
pub struct ImageMappingMemoryService
{
    memory: Arc<dyn MemoryReader>,
    cache: Arc<PageCache<ModuleImageReader>>,
}

impl ImageMappingMemoryService
{
    /// Wrap `memory`, caching up to `cache_size_limit` bytes of image pages
    /// and dropping them whenever `signal` fires.
    pub fn new(
        memory: Arc<dyn MemoryReader>,
        modules: Arc<ModuleDirectory>,
        signal: &FlushSignal,
        cache_size_limit: usize,
    ) -> Self
    {
        let cache = Arc::new(PageCache::with_size_limit(
            ModuleImageReader::new(modules),
            cache_size_limit,
        ));
        let weak: Weak<PageCache<ModuleImageReader>> = Arc::downgrade(&cache);
        signal.register(move |_| {
            if let Some(cache) = weak.upgrade() {
                cache.clear();
            }
        });
        Self { memory, cache }
    }

    /// The page cache holding reconstructed image pages.
    pub fn cache(&self) -> &PageCache<ModuleImageReader>
    {
        &self.cache
    }
}

impl MemoryReader for ImageMappingMemoryService
{
    fn read(&self, address: Address, buffer: &mut [u8]) -> usize
    {
        let read = self.memory.read(address, buffer);
        if read >= buffer.len() {
            return read;
        }
        let Some(rest) = address.checked_add(read as u64) else {
            return read;
        };
        let filled = self.cache.read(rest, &mut buffer[read..]);
        if filled > 0 {
            trace!(address = %rest, size = filled, "filled from module images");
        }
        read + filled
    }
}

impl fmt::Debug for ImageMappingMemoryService
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("ImageMappingMemoryService")
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}
