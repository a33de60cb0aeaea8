//! Module version lookup.
//!
//! PE modules carry a `VS_FIXEDFILEINFO` in their version resource. ELF and
//! MachO builds of the runtime embed a `@(#)Version <version> @Commit: <sha>`
//! string in a writable segment, which is searched for instead.

use std::fmt;

use tracing::{debug, trace};

use super::{Module, ModuleOrigin};
use crate::formats::pe::PeHeaders;
use crate::formats::{MappedImage, ModuleLayout};
use crate::memory::{MemoryReader, PAGE_SIZE};
use crate::types::Address;

const VERSION_PREFIX: &[u8] = b"@(#)Version ";
const SEARCH_CHUNK: usize = 0x4000;
const MAX_VERSION_LENGTH: usize = 0x100;

/// Four-part file version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct VersionData
{
    pub major: u32,
    pub minor: u32,
    pub build: u32,
    pub revision: u32,
}

impl VersionData
{
    #[must_use]
    pub const fn new(major: u32, minor: u32, build: u32, revision: u32) -> Self
    {
        Self {
            major,
            minor,
            build,
            revision,
        }
    }

    /// Version from the `dwFileVersionMS`/`dwFileVersionLS` pair.
    #[must_use]
    pub const fn from_fixed_file_info(most_significant: u32, least_significant: u32) -> Self
    {
        Self::new(
            most_significant >> 16,
            most_significant & 0xffff,
            least_significant >> 16,
            least_significant & 0xffff,
        )
    }
}

impl fmt::Display for VersionData
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}.{}.{}.{}", self.major, self.minor, self.build, self.revision)
    }
}

/// Parse the version part of an embedded version string.
///
/// The version runs up to the first space (a private build may have no
/// commit suffix) and may end with a stray `.`. Two to four numeric parts
/// are accepted; missing parts are zero.
///
/// ```rust
/// use imgmap_core::modules::{parse_version_string, VersionData};
///
/// assert_eq!(
///     parse_version_string("8.0.1024.12345 @Commit: 0123abcd"),
///     Some(VersionData::new(8, 0, 1024, 12345))
/// );
/// assert_eq!(parse_version_string("42.42.42.42424."), Some(VersionData::new(42, 42, 42, 42424)));
/// assert_eq!(parse_version_string("not a version"), None);
/// ```
#[must_use]
pub fn parse_version_string(text: &str) -> Option<VersionData>
{
    let version = text.split(' ').next()?;
    let version = version.strip_suffix('.').unwrap_or(version);
    let parts = version
        .split('.')
        .map(str::parse::<u32>)
        .collect::<Result<Vec<_>, _>>()
        .ok()?;
    if !(2..=4).contains(&parts.len()) {
        return None;
    }
    Some(VersionData::new(
        parts[0],
        parts[1],
        parts.get(2).copied().unwrap_or(0),
        parts.get(3).copied().unwrap_or(0),
    ))
}

/// Search `[start, start + size)` for an embedded version string.
///
/// Returns the text after the `@(#)Version ` prefix up to its NUL
/// terminator. Unreadable pages are skipped; a string with no terminator
/// within a bounded length is treated as not found.
#[must_use]
pub fn search_version_string(memory: &dyn MemoryReader, start: Address, size: u64) -> Option<String>
{
    let end = start.value().checked_add(size)?;
    let page_mask = PAGE_SIZE as u64 - 1;
    let overlap = VERSION_PREFIX.len() - 1;
    let mut buffer = vec![0u8; SEARCH_CHUNK];
    let mut cursor = start.value();

    while cursor < end {
        let len = usize::try_from(end - cursor).map_or(SEARCH_CHUNK, |remaining| remaining.min(SEARCH_CHUNK));
        let read = memory.read(Address::new(cursor), &mut buffer[..len]);

        if let Some(at) = buffer[..read]
            .windows(VERSION_PREFIX.len())
            .position(|window| window == VERSION_PREFIX)
        {
            let text = cursor + (at + VERSION_PREFIX.len()) as u64;
            return read_terminated(memory, Address::new(text), end);
        }

        if read < len {
            // resume on the page after the unreadable byte
            cursor = ((cursor + read as u64) | page_mask).checked_add(1)?;
        } else if cursor + len as u64 >= end || len <= overlap {
            break;
        } else {
            cursor += (len - overlap) as u64;
        }
    }
    None
}

fn read_terminated(memory: &dyn MemoryReader, address: Address, end: u64) -> Option<String>
{
    let limit = usize::try_from(end.saturating_sub(address.value())).map_or(MAX_VERSION_LENGTH, |remaining| {
        remaining.min(MAX_VERSION_LENGTH)
    });
    let mut text = vec![0u8; limit];
    let read = memory.read(address, &mut text);
    let terminator = text[..read].iter().position(|&byte| byte == 0)?;
    Some(String::from_utf8_lossy(&text[..terminator]).into_owned())
}

/// Version of `module`, reading through `memory`.
pub(super) fn module_version(module: &Module, memory: &dyn MemoryReader) -> Option<VersionData>
{
    if module.is_pe() {
        let headers = pe_headers(module)?;
        let view = MappedImage::new(memory, module.image_base(), module.image_size());
        let version = headers
            .fixed_file_version(&view)
            .map(|(most, least)| VersionData::from_fixed_file_info(most, least));
        trace!(module = module.name(), version = ?version, "read PE version resource");
        return version;
    }

    if let ModuleOrigin::Live {
        version_string: Some(text),
    } = module.origin()
    {
        if let Some(version) = parse_version_string(text) {
            return Some(version);
        }
    }

    let text = module
        .inspector()
        .writable_ranges(module)
        .into_iter()
        .find_map(|(start, size)| search_version_string(memory, start, size))?;
    let version = parse_version_string(&text);
    if version.is_none() {
        debug!(module = module.name(), text, "unparseable embedded version string");
    }
    version
}

/// Headers probed from memory, or the image file's headers laid out the
/// way the module is mapped.
fn pe_headers(module: &Module) -> Option<PeHeaders>
{
    if let Some(info) = module.format().pe.as_ref() {
        return Some(info.headers.clone());
    }
    let image = module.image()?;
    let mut headers = image.pe()?.headers.clone();
    headers.layout = match module.layout() {
        ModuleLayout::File => ModuleLayout::File,
        ModuleLayout::Loaded | ModuleLayout::Unknown => ModuleLayout::Loaded,
    };
    Some(headers)
}
