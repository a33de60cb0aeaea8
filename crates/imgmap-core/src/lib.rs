//! # imgmap-core
//!
//! Memory virtualization for post-mortem and live debugging.
//!
//! Crash dumps and restricted process snapshots rarely contain every page a
//! debugger wants to read. This crate layers reconstruction services over a
//! target's raw memory so that missing pages of loaded modules are rebuilt
//! from the module images (relocated to their actual load address) and
//! managed metadata is always served from a trustworthy copy.
//!
//! It provides:
//! - A fixed-page read-through cache with negative caching ([`memory::PageCache`])
//! - A per-target module directory with address, base, index and name lookup
//! - PE/ELF/MachO format probing, build-id and PDB identity extraction
//! - A PE base relocation engine
//! - The image and metadata mapping memory layers, composed by [`Target`]
//!
//! ## Platform Support
//!
//! Nothing here talks to an operating system. Targets captured on Windows,
//! Linux and macOS are all readable from any host, given a data source and
//! (optionally) an image provider.

pub mod config;
pub mod error;
pub mod events;
pub mod formats;
pub mod memory;
pub mod modules;
pub mod provider;
pub mod target;
pub mod types;

pub use config::MemoryConfig;
// Re-export commonly used types
pub use error::{ImgmapError, Result};
pub use events::{FlushReason, FlushSignal};
pub use memory::MemoryReader;
pub use modules::{Module, ModuleDirectory, ModuleSeed};
pub use target::Target;
pub use types::{Address, OperatingSystem, TargetDescriptor};
