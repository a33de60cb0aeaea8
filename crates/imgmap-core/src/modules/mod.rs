//! # Modules
//!
//! Loaded binary images of a target and the directory that finds them.
//!
//! ## Lazy Properties
//!
//! A [`Module`] is built from a [`ModuleSeed`] reported by the target. Its
//! format, build-id, image and version are each computed at most once, on
//! first use, and never change afterwards. Modules live for one flush epoch:
//! the [`ModuleDirectory`] rebuilds them from fresh seeds after a flush, so
//! "invalidating" a property means dropping the module that holds it.
//!
//! ## Module Kinds
//!
//! Where a module came from is a [`ModuleOrigin`] tag; what can be learned
//! about it from memory and images goes through the [`ModuleInspector`]
//! capability, implemented by [`FormatProbe`].

mod directory;
mod probe;
mod version;

use std::fmt;
use std::sync::Arc;

use once_cell::sync::OnceCell;

pub use directory::ModuleDirectory;
pub use probe::FormatProbe;
pub use version::{parse_version_string, search_version_string, VersionData};

use crate::formats::{ModuleImage, ModuleLayout, PdbInfo, PeImageInfo};
use crate::memory::MemoryReader;
use crate::provider::{self, ImageIdentity, ImageKey};
use crate::types::{Address, OperatingSystem};

/// Where a module's description came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleOrigin
{
    /// Module list of a crash dump, with whatever identity it recorded
    Dump
    {
        time_date_stamp: Option<u32>,
        size_of_image: Option<u32>,
        build_id: Option<Vec<u8>>,
    },
    /// Loader of a live process
    Live
    {
        version_string: Option<String>,
    },
    /// Synthesized by a higher layer (e.g. from the runtime's own module list)
    Synthetic
    {
        is_managed: bool,
    },
}

/// A module as reported by [`TargetDescriptor::enumerate_modules`]
///
/// [`TargetDescriptor::enumerate_modules`]: crate::types::TargetDescriptor::enumerate_modules
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleSeed
{
    /// Module path as reported by the target
    pub file_name: String,
    pub image_base: u64,
    pub image_size: u64,
    pub origin: ModuleOrigin,
}

impl ModuleSeed
{
    /// Seed for a dump module without recorded identity.
    #[must_use]
    pub fn new(file_name: impl Into<String>, image_base: u64, image_size: u64) -> Self
    {
        Self {
            file_name: file_name.into(),
            image_base,
            image_size,
            origin: ModuleOrigin::Dump {
                time_date_stamp: None,
                size_of_image: None,
                build_id: None,
            },
        }
    }

    #[must_use]
    pub fn with_origin(mut self, origin: ModuleOrigin) -> Self
    {
        self.origin = origin;
        self
    }
}

/// Result of format detection on a module's mapped headers
#[derive(Debug, Clone, Default)]
pub struct FormatInfo
{
    pub is_pe: bool,
    pub layout: ModuleLayout,
    /// Parsed PE headers, when they were readable
    pub pe: Option<Arc<PeImageInfo>>,
}

impl FormatInfo
{
    /// Whether the parsed headers carry a CLR header.
    #[must_use]
    pub fn is_managed(&self) -> bool
    {
        self.pe.as_ref().is_some_and(|info| info.is_managed())
    }
}

/// What can be learned about a module beyond its seed
///
/// Every method reads target memory through the raw reader only, never
/// through the image-backed layers, so probing a module cannot recurse into
/// mapping that same module.
pub trait ModuleInspector: Send + Sync
{
    fn operating_system(&self) -> OperatingSystem;

    /// Detect PE-ness and layout from the mapped headers.
    fn probe_format(&self, module: &Module) -> FormatInfo;

    /// ELF build-id or MachO UUID from the mapped headers.
    fn probe_build_id(&self, module: &Module) -> Option<Vec<u8>>;

    /// Absolute `(address, size)` of the module's writable segments.
    fn writable_ranges(&self, module: &Module) -> Vec<(Address, u64)>;

    /// Locate and parse the module's image file.
    fn open_image(&self, module: &Module) -> Option<Arc<ModuleImage>>;
}

/// One loaded binary image
pub struct Module
{
    index: usize,
    file_name: String,
    image_base: Address,
    image_size: u64,
    origin: ModuleOrigin,
    inspector: Arc<dyn ModuleInspector>,
    format: OnceCell<FormatInfo>,
    build_id: OnceCell<Option<Vec<u8>>>,
    image: OnceCell<Option<Arc<ModuleImage>>>,
    version: OnceCell<Option<VersionData>>,
}

impl Module
{
    pub(crate) fn new(index: usize, seed: ModuleSeed, inspector: Arc<dyn ModuleInspector>) -> Self
    {
        Self {
            index,
            file_name: seed.file_name,
            image_base: Address::new(seed.image_base),
            image_size: seed.image_size,
            origin: seed.origin,
            inspector,
            format: OnceCell::new(),
            build_id: OnceCell::new(),
            image: OnceCell::new(),
            version: OnceCell::new(),
        }
    }

    /// Position in the target's enumeration order.
    pub fn index(&self) -> usize
    {
        self.index
    }

    /// Full path as reported by the target.
    pub fn file_name(&self) -> &str
    {
        &self.file_name
    }

    /// File name without directories.
    pub fn name(&self) -> &str
    {
        provider::file_name(&self.file_name)
    }

    pub fn image_base(&self) -> Address
    {
        self.image_base
    }

    pub fn image_size(&self) -> u64
    {
        self.image_size
    }

    pub fn origin(&self) -> &ModuleOrigin
    {
        &self.origin
    }

    /// Whether `address` lies in `[image_base, image_base + image_size)`.
    pub fn contains(&self, address: Address) -> bool
    {
        address >= self.image_base && address.value() - self.image_base.value() < self.image_size
    }

    /// Format detection result, probed on first use.
    pub fn format(&self) -> &FormatInfo
    {
        self.format.get_or_init(|| self.inspector.probe_format(self))
    }

    pub fn is_pe(&self) -> bool
    {
        self.format().is_pe
    }

    pub fn layout(&self) -> ModuleLayout
    {
        self.format().layout
    }

    /// Whether the module holds managed code.
    pub fn is_managed(&self) -> bool
    {
        matches!(self.origin, ModuleOrigin::Synthetic { is_managed: true }) || self.format().is_managed()
    }

    /// PDB identity from the CodeView debug record.
    pub fn pdb_info(&self) -> Option<&PdbInfo>
    {
        self.format().pe.as_ref()?.pdb.as_ref()
    }

    /// ELF build-id or MachO UUID.
    ///
    /// Taken from the dump's module record when present, otherwise read
    /// from the mapped headers.
    pub fn build_id(&self) -> Option<&[u8]>
    {
        self.build_id
            .get_or_init(|| match &self.origin {
                ModuleOrigin::Dump {
                    build_id: Some(build_id),
                    ..
                } if !build_id.is_empty() => Some(build_id.clone()),
                _ => self.inspector.probe_build_id(self),
            })
            .as_deref()
    }

    /// Identity to look the module's image up by, if one is known.
    pub fn image_key(&self) -> Option<ImageKey>
    {
        let identity = if self.is_pe() {
            let headers = self.format().pe.as_ref().map(|info| &info.headers);
            let (recorded_stamp, recorded_size) = match &self.origin {
                ModuleOrigin::Dump {
                    time_date_stamp,
                    size_of_image,
                    ..
                } => (*time_date_stamp, *size_of_image),
                _ => (None, None),
            };
            ImageIdentity::Pe {
                time_date_stamp: recorded_stamp.or_else(|| headers.map(|h| h.time_date_stamp))?,
                size_of_image: recorded_size.or_else(|| headers.map(|h| h.size_of_image))?,
            }
        } else {
            match self.inspector.operating_system() {
                OperatingSystem::Linux => ImageIdentity::BuildId(self.build_id()?.to_vec()),
                OperatingSystem::MacOS => ImageIdentity::Uuid(self.build_id()?.try_into().ok()?),
                OperatingSystem::Windows => return None,
            }
        };
        Some(ImageKey {
            module_path: self.file_name.clone(),
            identity,
        })
    }

    /// The module's image file, located on first use.
    pub fn image(&self) -> Option<Arc<ModuleImage>>
    {
        self.image.get_or_init(|| self.inspector.open_image(self)).clone()
    }

    /// Address and size of the managed metadata as mapped in the target.
    pub fn metadata_range(&self) -> Option<(Address, u64)>
    {
        let info = self.format().pe.as_ref()?;
        let (rva, size) = info.metadata_directory()?;
        let offset = info.headers.rva_to_offset(rva)?;
        Some((self.image_base.checked_add(offset)?, u64::from(size)))
    }

    /// Module version, read through `memory` on first use.
    ///
    /// `memory` should be the target's composed reader so that version
    /// resources missing from a dump can come from the image.
    pub fn version(&self, memory: &dyn MemoryReader) -> Option<VersionData>
    {
        *self.version.get_or_init(|| version::module_version(self, memory))
    }

    pub(crate) fn inspector(&self) -> &dyn ModuleInspector
    {
        &*self.inspector
    }
}

impl fmt::Debug for Module
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("Module")
            .field("index", &self.index)
            .field("file_name", &self.file_name)
            .field("image_base", &self.image_base)
            .field("image_size", &format_args!("0x{:x}", self.image_size))
            .field("origin", &self.origin)
            .field("format", &self.format.get())
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Module
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{} {} 0x{:x}", self.image_base, self.name(), self.image_size)
    }
}
