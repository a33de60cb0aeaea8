//! Format probing of modules from their mapped headers.

use std::sync::Arc;

use tracing::{debug, warn};

use super::{FormatInfo, Module, ModuleInspector};
use crate::formats::elf::ElfProgramHeaders;
use crate::formats::macho::MachOLoadCommands;
use crate::formats::{MappedImage, ModuleImage, ModuleLayout, PeImageInfo};
use crate::memory::MemoryReader;
use crate::provider::ImageProvider;
use crate::types::{Address, OperatingSystem};

/// [`ModuleInspector`] reading headers through a target's raw memory
pub struct FormatProbe
{
    raw: Arc<dyn MemoryReader>,
    operating_system: OperatingSystem,
    provider: Arc<dyn ImageProvider>,
}

impl FormatProbe
{
    /// `raw` must be the innermost data-source reader, never an
    /// image-backed layer.
    pub fn new(raw: Arc<dyn MemoryReader>, operating_system: OperatingSystem, provider: Arc<dyn ImageProvider>) -> Self
    {
        Self {
            raw,
            operating_system,
            provider,
        }
    }

    fn view(&self, module: &Module) -> MappedImage<'_>
    {
        MappedImage::new(&*self.raw, module.image_base(), module.image_size())
    }
}

/// Pick between the loaded-layout and file-layout parse of the same headers.
///
/// Loaded layout wins unless it found no debug records while file layout
/// found at least one.
pub(crate) fn choose_layout(loaded: Option<PeImageInfo>, file: Option<PeImageInfo>) -> Option<PeImageInfo>
{
    match (loaded, file) {
        (Some(loaded), Some(file)) => {
            if loaded.debug_records.is_empty() && !file.debug_records.is_empty() {
                Some(file)
            } else {
                Some(loaded)
            }
        }
        (loaded, file) => loaded.or(file),
    }
}

impl ModuleInspector for FormatProbe
{
    fn operating_system(&self) -> OperatingSystem
    {
        self.operating_system
    }

    fn probe_format(&self, module: &Module) -> FormatInfo
    {
        let view = self.view(module);

        if self.operating_system == OperatingSystem::Windows {
            // every Windows module is a PE image mapped by the loader
            let pe = match PeImageInfo::parse(&view, ModuleLayout::Loaded) {
                Ok(info) => Some(Arc::new(info)),
                Err(error) => {
                    warn!(module = module.name(), address = %module.image_base(), %error, "unreadable PE headers");
                    None
                }
            };
            return FormatInfo {
                is_pe: true,
                layout: ModuleLayout::Loaded,
                pe,
            };
        }

        let loaded = PeImageInfo::parse(&view, ModuleLayout::Loaded);
        if let Err(error) = &loaded {
            debug!(module = module.name(), %error, "not a PE image");
            return FormatInfo::default();
        }
        let file = PeImageInfo::parse(&view, ModuleLayout::File).ok();

        match choose_layout(loaded.ok(), file) {
            Some(info) => {
                debug!(
                    module = module.name(),
                    layout = ?info.headers.layout,
                    managed = info.is_managed(),
                    "detected PE image"
                );
                FormatInfo {
                    is_pe: true,
                    layout: info.headers.layout,
                    pe: Some(Arc::new(info)),
                }
            }
            None => FormatInfo::default(),
        }
    }

    fn probe_build_id(&self, module: &Module) -> Option<Vec<u8>>
    {
        if module.is_pe() {
            return None;
        }
        let view = self.view(module);
        let build_id = match self.operating_system {
            OperatingSystem::Linux => match ElfProgramHeaders::read(&view) {
                Ok(headers) => headers.build_id(&view),
                Err(error) => {
                    warn!(module = module.name(), %error, "unreadable ELF headers");
                    None
                }
            },
            OperatingSystem::MacOS => match MachOLoadCommands::read(&view) {
                Ok(commands) => commands.uuid.map(|uuid| uuid.to_vec()),
                Err(error) => {
                    warn!(module = module.name(), %error, "unreadable MachO headers");
                    None
                }
            },
            OperatingSystem::Windows => None,
        };
        if build_id.is_none() {
            debug!(module = module.name(), "no build id");
        }
        build_id
    }

    fn writable_ranges(&self, module: &Module) -> Vec<(Address, u64)>
    {
        let view = self.view(module);
        let base = module.image_base();
        let ranges: Vec<(u64, u64)> = match self.operating_system {
            OperatingSystem::Linux => ElfProgramHeaders::read(&view)
                .map(|headers| headers.writable_ranges().collect())
                .unwrap_or_default(),
            OperatingSystem::MacOS => MachOLoadCommands::read(&view)
                .map(|commands| commands.writable_ranges().collect())
                .unwrap_or_default(),
            OperatingSystem::Windows => Vec::new(),
        };
        ranges
            .into_iter()
            .filter_map(|(rva, size)| Some((base.checked_add(rva)?, size)))
            .collect()
    }

    fn open_image(&self, module: &Module) -> Option<Arc<ModuleImage>>
    {
        let Some(key) = module.image_key() else {
            debug!(module = module.name(), "no identity to locate image by");
            return None;
        };
        let Some(source) = self.provider.locate(&key) else {
            debug!(module = module.name(), %key, "image not available");
            return None;
        };
        let image = match ModuleImage::open(&source) {
            Ok(image) => image,
            Err(error) => {
                warn!(module = module.name(), %key, %error, "located image is unusable");
                return None;
            }
        };
        if image.identity() != Some(&key.identity) {
            warn!(module = module.name(), %key, found = ?image.identity(), "located image has a different identity");
            return None;
        }
        if module.is_pe() != image.pe().is_some() {
            warn!(module = module.name(), %key, "located image has the wrong format");
            return None;
        }
        Some(Arc::new(image))
    }
}
