//! Target description types.
//!
//! A target is the thing being inspected: a crash dump or a live process.
//! This crate never talks to one directly; it only needs the narrow
//! [`TargetDescriptor`] view defined here.

use std::fmt;

use crate::error::Result;
use crate::modules::ModuleSeed;

/// Operating system the target was captured on
///
/// Decides which module formats are probed (PE everywhere, ELF on Linux,
/// MachO on macOS) and how module names compare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperatingSystem
{
    /// Windows: every module is a PE image in loaded layout
    Windows,
    /// Linux: native modules are ELF, managed assemblies are PE
    Linux,
    /// macOS: native modules are MachO, managed assemblies are PE
    MacOS,
}

impl OperatingSystem
{
    /// Compare two module file names the way the platform's loader would.
    ///
    /// Windows file names are case-insensitive; everything else compares
    /// byte-for-byte.
    ///
    /// ```rust
    /// use imgmap_core::types::OperatingSystem;
    ///
    /// assert!(OperatingSystem::Windows.file_names_equal("NTDLL.dll", "ntdll.DLL"));
    /// assert!(!OperatingSystem::Linux.file_names_equal("libc.so.6", "LIBC.so.6"));
    /// ```
    #[must_use]
    pub fn file_names_equal(self, left: &str, right: &str) -> bool
    {
        match self {
            Self::Windows => left.eq_ignore_ascii_case(right),
            Self::Linux | Self::MacOS => left == right,
        }
    }
}

impl fmt::Display for OperatingSystem
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            Self::Windows => write!(f, "Windows"),
            Self::Linux => write!(f, "Linux"),
            Self::MacOS => write!(f, "macOS"),
        }
    }
}

/// What the memory layer needs to know about a target
///
/// Implemented by the dump reader or live-process backend that owns the
/// target. Enumeration is called at most once per flush epoch.
pub trait TargetDescriptor: Send + Sync
{
    /// Operating system the target runs (or ran) on.
    fn operating_system(&self) -> OperatingSystem;

    /// Size of a target pointer in bytes (4 or 8).
    fn pointer_size(&self) -> usize;

    /// Enumerate the modules the data source knows about.
    ///
    /// ## Errors
    ///
    /// Returns an error if the data source's module list cannot be read.
    fn enumerate_modules(&self) -> Result<Vec<ModuleSeed>>;
}
