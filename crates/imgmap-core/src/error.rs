//! # Error Types
//!
//! Error handling for the memory virtualization layer.
//!
//! We use `thiserror` to automatically generate `Error` trait implementations
//! and nice error messages.
//!
//! Most failures in this crate never reach a caller as an `Err`: a missing
//! page, an image that cannot be found, or a corrupt header all degrade to a
//! short read. The variants here are what is left once that policy has been
//! applied.

use thiserror::Error;

/// Main error type for memory and module operations
///
/// ## Error Categories
///
/// 1. **Invariant violations**: InvalidAddress, InvalidModuleIndex, DuplicateModule
/// 2. **Malformed input**: BadImageFormat, InvalidVirtualAddress, Object
/// 3. **Unsupported input**: UnsupportedRelocation
/// 4. **Configuration**: Config
/// 5. **I/O errors**: Io (opening or reading a module image on disk)
#[derive(Error, Debug)]
pub enum ImgmapError
{
    /// No module is loaded at the given base address, or memory at the
    /// address could not be read in full.
    ///
    /// Returned by exact lookups (`lookup_by_base`) and by the fixed-width
    /// read helpers on `MemoryReader`. Containment lookups never produce it;
    /// they return `None` instead.
    #[error("Invalid address: 0x{0:016x}")]
    InvalidAddress(u64),

    /// Module index does not correspond to any module in the directory.
    #[error("Invalid module index: {0}")]
    InvalidModuleIndex(usize),

    /// Two modules reported by the target share a base address.
    ///
    /// This indicates a bug in the module enumeration of the data source,
    /// so the directory refuses to build rather than silently dropping one.
    #[error("Duplicate module base address: 0x{0:016x}")]
    DuplicateModule(u64),

    /// Header or table of a PE, ELF or MachO image failed validation.
    #[error("Bad image format: {0}")]
    BadImageFormat(String),

    /// A virtual address (or RVA) does not fall in any segment or section of an image.
    #[error("Invalid virtual address: 0x{0:016x}")]
    InvalidVirtualAddress(u64),

    /// A base relocation entry uses a type the relocation engine does not patch.
    #[error("Unsupported relocation type {kind} at rva 0x{rva:08x}")]
    UnsupportedRelocation
    {
        /// Upper four bits of the relocation entry
        kind: u16,
        /// RVA of the field the entry targets
        rva: u32,
    },

    /// A configuration value (usually from the environment) could not be parsed.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// I/O error while opening or reading an image file
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Parse error reported by the `object` crate
    #[error("Object parse error: {0}")]
    Object(#[from] object::read::Error),
}

impl ImgmapError
{
    /// Whether this error is a data-quality problem the read path absorbs
    /// (as opposed to a caller or data-source bug).
    #[must_use]
    pub fn is_recoverable(&self) -> bool
    {
        !matches!(
            self,
            Self::InvalidModuleIndex(_) | Self::DuplicateModule(_) | Self::Config(_)
        )
    }
}

/// Convenience type alias for `Result<T, ImgmapError>`
///
/// ```rust
/// use imgmap_core::error::Result;
/// fn foo() -> Result<()>
/// {
///     Ok(())
/// }
/// ```
pub type Result<T> = std::result::Result<T, ImgmapError>;
