//! # Target
//!
//! One inspected dump or process with its module directory and memory stack.
//!
//! ## Lifecycle
//!
//! 1. The host builds a [`Target`] from its data source: a
//!    [`TargetDescriptor`], the raw [`MemoryReader`] and an [`ImageProvider`]
//! 2. Consumers read through [`Target::memory`] and look modules up through
//!    [`Target::modules`]
//! 3. Whenever the data source may have changed (process resumed, context
//!    switched) the host calls [`Target::flush`]; every cache drops its state
//!    before `flush` returns
//!
//! ## Read Stack
//!
//! ```text
//! MetadataMappingMemoryService   (if map_metadata)
//!   -> ImageMappingMemoryService (if map_images)
//!     -> raw data-source reader
//! ```
//!
//! Format probing always reads through the raw reader so that probing a
//! module's headers can never loop back into mapping that module.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::MemoryConfig;
use crate::events::{FlushReason, FlushSignal};
use crate::memory::{ImageMappingMemoryService, MemoryReader, MetadataMappingMemoryService};
use crate::modules::{FormatProbe, Module, ModuleDirectory, ModuleInspector, VersionData};
use crate::provider::ImageProvider;
use crate::types::{OperatingSystem, TargetDescriptor};

/// A target with its composed memory stack
pub struct Target
{
    descriptor: Arc<dyn TargetDescriptor>,
    config: MemoryConfig,
    signal: Arc<FlushSignal>,
    modules: Arc<ModuleDirectory>,
    raw: Arc<dyn MemoryReader>,
    memory: Arc<dyn MemoryReader>,
}

impl Target
{
    /// Build a target over a data source.
    ///
    /// ## Example
    ///
    /// ```rust
    /// use std::sync::Arc;
    ///
    /// use imgmap_core::config::MemoryConfig;
    /// use imgmap_core::memory::{MemoryReader, SnapshotMemory};
    /// use imgmap_core::modules::ModuleSeed;
    /// use imgmap_core::provider::NoImageProvider;
    /// use imgmap_core::types::{Address, OperatingSystem, TargetDescriptor};
    /// use imgmap_core::{Result, Target};
    ///
    /// struct Dump;
    ///
    /// impl TargetDescriptor for Dump
    /// {
    ///     fn operating_system(&self) -> OperatingSystem
    ///     {
    ///         OperatingSystem::Linux
    ///     }
    ///
    ///     fn pointer_size(&self) -> usize
    ///     {
    ///         8
    ///     }
    ///
    ///     fn enumerate_modules(&self) -> Result<Vec<ModuleSeed>>
    ///     {
    ///         Ok(vec![ModuleSeed::new("/usr/bin/app", 0x40_0000, 0x1000)])
    ///     }
    /// }
    ///
    /// let mut raw = SnapshotMemory::new();
    /// raw.insert(Address::from(0x1000), vec![1, 2, 3, 4]);
    ///
    /// let target = Target::new(Arc::new(Dump), Arc::new(raw), Arc::new(NoImageProvider), MemoryConfig::default());
    /// assert_eq!(target.memory().read_u32(Address::from(0x1000)).unwrap(), 0x0403_0201);
    /// assert_eq!(target.modules().modules().unwrap().len(), 1);
    /// ```
    pub fn new(
        descriptor: Arc<dyn TargetDescriptor>,
        raw: Arc<dyn MemoryReader>,
        provider: Arc<dyn ImageProvider>,
        config: MemoryConfig,
    ) -> Self
    {
        let signal = Arc::new(FlushSignal::new());
        let inspector: Arc<dyn ModuleInspector> = Arc::new(FormatProbe::new(
            raw.clone(),
            descriptor.operating_system(),
            provider,
        ));
        let modules = ModuleDirectory::new(descriptor.clone(), inspector, signal.clone());

        let mut memory = raw.clone();
        if config.map_images {
            memory = Arc::new(ImageMappingMemoryService::new(
                memory,
                modules.clone(),
                &signal,
                config.cache_size_limit,
            ));
        }
        if config.map_metadata {
            memory = Arc::new(MetadataMappingMemoryService::new(memory, modules.clone(), signal.clone()));
        }

        info!(
            os = %descriptor.operating_system(),
            pointer_size = descriptor.pointer_size(),
            map_images = config.map_images,
            map_metadata = config.map_metadata,
            "created target"
        );

        Self {
            descriptor,
            config,
            signal,
            modules,
            raw,
            memory,
        }
    }

    /// The composed reader: metadata, then data source, then images.
    pub fn memory(&self) -> &Arc<dyn MemoryReader>
    {
        &self.memory
    }

    /// The data source's reader with no image-backed layers.
    pub fn raw_memory(&self) -> &Arc<dyn MemoryReader>
    {
        &self.raw
    }

    pub fn modules(&self) -> &Arc<ModuleDirectory>
    {
        &self.modules
    }

    pub fn operating_system(&self) -> OperatingSystem
    {
        self.descriptor.operating_system()
    }

    pub fn pointer_size(&self) -> usize
    {
        self.descriptor.pointer_size()
    }

    pub fn config(&self) -> &MemoryConfig
    {
        &self.config
    }

    /// The signal every cache of this target is subscribed to.
    ///
    /// Hosts layering their own caches over the target register here.
    pub fn flush_signal(&self) -> &Arc<FlushSignal>
    {
        &self.signal
    }

    /// Drop every cached page, module and metadata region.
    pub fn flush(&self, reason: FlushReason)
    {
        debug!(%reason, "flushing target");
        self.signal.fire(reason);
    }

    /// Version of `module`, read through the composed memory stack.
    pub fn module_version(&self, module: &Module) -> Option<VersionData>
    {
        module.version(&*self.memory)
    }
}

impl fmt::Debug for Target
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("Target")
            .field("operating_system", &self.operating_system())
            .field("config", &self.config)
            .field("signal", &self.signal)
            .finish_non_exhaustive()
    }
}
