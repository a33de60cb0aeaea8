//! The per-target set of modules, rebuilt once per flush epoch.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use tracing::{debug, trace};

use super::{Module, ModuleInspector};
use crate::error::{ImgmapError, Result};
use crate::events::{EpochCell, FlushSignal};
use crate::types::{Address, OperatingSystem, TargetDescriptor};

/// Modules of one epoch, indexed three ways
struct ModuleTable
{
    by_base: HashMap<u64, Arc<Module>>,
    /// Same modules as `by_base`, ordered by image base
    sorted: Vec<Arc<Module>>,
    /// Same modules in enumeration order
    by_index: Vec<Arc<Module>>,
}

impl ModuleTable
{
    fn build(descriptor: &dyn TargetDescriptor, inspector: &Arc<dyn ModuleInspector>) -> Result<Self>
    {
        let seeds = descriptor.enumerate_modules()?;
        let mut by_base = HashMap::with_capacity(seeds.len());
        let mut by_index = Vec::with_capacity(seeds.len());

        for (index, seed) in seeds.into_iter().enumerate() {
            let module = Arc::new(Module::new(index, seed, inspector.clone()));
            trace!(index, module = module.name(), address = %module.image_base(), size = module.image_size(), "enumerated module");
            if by_base.insert(module.image_base().value(), module.clone()).is_some() {
                return Err(ImgmapError::DuplicateModule(module.image_base().value()));
            }
            by_index.push(module);
        }

        let mut sorted = by_index.clone();
        sorted.sort_by_key(|module| module.image_base());
        debug!(modules = sorted.len(), "built module directory");

        Ok(Self {
            by_base,
            sorted,
            by_index,
        })
    }
}

/// Find the module whose `[base, base + size)` contains `address`.
///
/// `sorted` must be ordered by image base.
pub(crate) fn search_by_address(sorted: &[Arc<Module>], address: Address) -> Option<&Arc<Module>>
{
    let mut lower = 0usize;
    let mut upper = sorted.len();
    while lower < upper {
        let mid = lower + (upper - lower) / 2;
        let module = &sorted[mid];
        if module.contains(address) {
            return Some(module);
        }
        if module.image_base() < address {
            lower = mid + 1;
        } else {
            upper = mid;
        }
    }
    None
}

/// Lookup of a target's modules by address, base, index and name
///
/// The module set is enumerated from the [`TargetDescriptor`] on first use
/// and again on first use after every flush.
pub struct ModuleDirectory
{
    descriptor: Arc<dyn TargetDescriptor>,
    inspector: Arc<dyn ModuleInspector>,
    signal: Arc<FlushSignal>,
    table: EpochCell<ModuleTable>,
}

impl ModuleDirectory
{
    /// Create a directory that drops its modules whenever `signal` fires.
    pub fn new(
        descriptor: Arc<dyn TargetDescriptor>,
        inspector: Arc<dyn ModuleInspector>,
        signal: Arc<FlushSignal>,
    ) -> Arc<Self>
    {
        let directory = Arc::new(Self {
            descriptor,
            inspector,
            signal: signal.clone(),
            table: EpochCell::new(),
        });
        let weak: Weak<Self> = Arc::downgrade(&directory);
        signal.register(move |_| {
            if let Some(directory) = weak.upgrade() {
                directory.table.clear();
            }
        });
        directory
    }

    fn table(&self) -> Result<Arc<ModuleTable>>
    {
        self.table
            .get_or_try_init(self.signal.generation(), || ModuleTable::build(&*self.descriptor, &self.inspector))
    }

    pub fn operating_system(&self) -> OperatingSystem
    {
        self.descriptor.operating_system()
    }

    /// All modules ordered by image base.
    ///
    /// ## Errors
    ///
    /// Returns [`ImgmapError::DuplicateModule`] if two modules share a base,
    /// or whatever error module enumeration reported.
    pub fn modules(&self) -> Result<Vec<Arc<Module>>>
    {
        Ok(self.table()?.sorted.clone())
    }

    /// Module containing `address`. A miss is `Ok(None)`, not an error.
    ///
    /// ## Errors
    ///
    /// Only fails if the module set itself cannot be built.
    pub fn lookup_by_address(&self, address: Address) -> Result<Option<Arc<Module>>>
    {
        let table = self.table()?;
        Ok(search_by_address(&table.sorted, address).cloned())
    }

    /// Module whose image base is exactly `base`.
    ///
    /// ## Errors
    ///
    /// Returns [`ImgmapError::InvalidAddress`] if no module starts there.
    pub fn lookup_by_base(&self, base: Address) -> Result<Arc<Module>>
    {
        self.table()?
            .by_base
            .get(&base.value())
            .cloned()
            .ok_or(ImgmapError::InvalidAddress(base.value()))
    }

    /// Module at position `index` of the target's enumeration.
    ///
    /// ## Errors
    ///
    /// Returns [`ImgmapError::InvalidModuleIndex`] if `index` is out of range.
    pub fn lookup_by_index(&self, index: usize) -> Result<Arc<Module>>
    {
        self.table()?
            .by_index
            .get(index)
            .cloned()
            .ok_or(ImgmapError::InvalidModuleIndex(index))
    }

    /// Modules whose file name matches `name`, ignoring directories.
    ///
    /// Case-insensitive on Windows targets only. Several modules can share
    /// a name when loaded from different paths.
    ///
    /// ## Errors
    ///
    /// Only fails if the module set itself cannot be built.
    pub fn lookup_by_name(&self, name: &str) -> Result<Vec<Arc<Module>>>
    {
        let os = self.operating_system();
        let wanted = crate::provider::file_name(name);
        Ok(self
            .table()?
            .by_index
            .iter()
            .filter(|module| os.file_names_equal(module.name(), wanted))
            .cloned()
            .collect())
    }
}

impl fmt::Debug for ModuleDirectory
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("ModuleDirectory")
            .field("operating_system", &self.operating_system())
            .field("generation", &self.signal.generation())
            .finish_non_exhaustive()
    }
}
