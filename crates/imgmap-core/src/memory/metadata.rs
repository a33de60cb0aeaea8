//! # Metadata-Backed Memory
//!
//! Serves the managed metadata of every managed module straight from the
//! module's image, ahead of the wrapped reader.
//!
//! Some capture tools zero-fill pages they did not save instead of leaving
//! them out, so a short read cannot be relied on to notice missing
//! metadata. Inside a metadata region the image copy therefore always wins.

use std::fmt;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use tracing::{debug, trace, warn};

use super::MemoryReader;
use crate::error::Result;
use crate::events::{EpochCell, FlushSignal};
use crate::modules::{Module, ModuleDirectory};
use crate::types::Address;

/// Where one managed module's metadata sits in the target
pub struct MetadataRegion
{
    start: Address,
    end: Address,
    module: Arc<Module>,
    blob: OnceCell<Option<Arc<[u8]>>>,
}

impl MetadataRegion
{
    fn new(module: Arc<Module>) -> Option<Self>
    {
        let (start, size) = module.metadata_range()?;
        let end = start.checked_add(size)?;
        Some(Self {
            start,
            end,
            module,
            blob: OnceCell::new(),
        })
    }

    pub fn start(&self) -> Address
    {
        self.start
    }

    pub fn end(&self) -> Address
    {
        self.end
    }

    pub fn module(&self) -> &Arc<Module>
    {
        &self.module
    }

    fn contains(&self, address: Address) -> bool
    {
        address >= self.start && address < self.end
    }

    /// The metadata bytes from the module image, fetched on first use.
    fn blob(&self) -> Option<&Arc<[u8]>>
    {
        self.blob
            .get_or_init(|| {
                let image = self.module.image()?;
                let Some(metadata) = image.metadata() else {
                    warn!(module = self.module.name(), "image has no readable metadata");
                    return None;
                };
                debug!(module = self.module.name(), size = metadata.len(), "loaded metadata from image");
                Some(Arc::from(metadata))
            })
            .as_ref()
    }
}

/// Binary search over regions sorted by start address.
fn find_region(regions: &[MetadataRegion], address: Address) -> Option<&MetadataRegion>
{
    let mut lower = 0usize;
    let mut upper = regions.len();
    while lower < upper {
        let mid = lower + (upper - lower) / 2;
        let region = &regions[mid];
        if region.contains(address) {
            return Some(region);
        }
        if region.start < address {
            lower = mid + 1;
        } else {
            upper = mid;
        }
    }
    None
}

/// Memory layer that prefers image metadata over the wrapped reader
pub struct MetadataMappingMemoryService
{
    memory: Arc<dyn MemoryReader>,
    modules: Arc<ModuleDirectory>,
    signal: Arc<FlushSignal>,
    regions: EpochCell<Vec<MetadataRegion>>,
}

impl MetadataMappingMemoryService
{
    /// Wrap `memory`; the region list is rebuilt after every flush of `signal`.
    pub fn new(memory: Arc<dyn MemoryReader>, modules: Arc<ModuleDirectory>, signal: Arc<FlushSignal>) -> Self
    {
        Self {
            memory,
            modules,
            signal,
            regions: EpochCell::new(),
        }
    }

    fn regions(&self) -> Result<Arc<Vec<MetadataRegion>>>
    {
        self.regions.get_or_try_init(self.signal.generation(), || {
            let mut regions: Vec<MetadataRegion> = self
                .modules
                .modules()?
                .into_iter()
                .filter(|module| module.is_managed())
                .filter_map(MetadataRegion::new)
                .collect();
            regions.sort_by_key(MetadataRegion::start);
            debug!(regions = regions.len(), "built metadata region list");
            Ok(regions)
        })
    }

    /// Copy metadata bytes at `address` into `buffer`; 0 if not a metadata address.
    fn read_metadata(&self, address: Address, buffer: &mut [u8]) -> usize
    {
        let regions = match self.regions() {
            Ok(regions) => regions,
            Err(error) => {
                warn!(%address, %error, "metadata regions unavailable");
                return 0;
            }
        };
        let Some(region) = find_region(&regions, address) else {
            return 0;
        };
        let Some(blob) = region.blob() else {
            return 0;
        };

        // region end bounds the blob even if the image disagrees on size
        let offset = (address.value() - region.start.value()) as usize;
        let region_len = (region.end.value() - region.start.value()) as usize;
        let available = blob.len().min(region_len).saturating_sub(offset);
        if available == 0 {
            return 0;
        }
        let len = available.min(buffer.len());
        buffer[..len].copy_from_slice(&blob[offset..offset + len]);
        trace!(%address, module = region.module.name(), size = len, "served metadata from image");
        len
    }
}

impl MemoryReader for MetadataMappingMemoryService
{
    fn read(&self, address: Address, buffer: &mut [u8]) -> usize
    {
        let served = self.read_metadata(address, buffer);
        if served == buffer.len() {
            return served;
        }
        let Some(rest) = address.checked_add(served as u64) else {
            return served;
        };
        served + self.memory.read(rest, &mut buffer[served..])
    }
}

impl fmt::Debug for MetadataMappingMemoryService
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("MetadataMappingMemoryService")
            .field("generation", &self.signal.generation())
            .finish_non_exhaustive()
    }
}
