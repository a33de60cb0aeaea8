//! # Image Providers
//!
//! Where module images come from. Finding or downloading an image (symbol
//! servers, caches) is the host's business; this crate only asks "given
//! this identity, where are the bytes?".

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, trace};

use crate::formats::ModuleImage;

/// Format-specific content identity of a module image
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ImageIdentity
{
    /// PE: link timestamp and size of image from the optional header
    Pe
    {
        time_date_stamp: u32,
        size_of_image: u32,
    },
    /// ELF: `NT_GNU_BUILD_ID` descriptor
    BuildId(Vec<u8>),
    /// MachO: `LC_UUID`
    Uuid([u8; 16]),
}

impl fmt::Display for ImageIdentity
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            Self::Pe {
                time_date_stamp,
                size_of_image,
            } => write!(f, "{time_date_stamp:08x}{size_of_image:x}"),
            Self::BuildId(bytes) => bytes.iter().try_for_each(|byte| write!(f, "{byte:02x}")),
            Self::Uuid(bytes) => bytes.iter().try_for_each(|byte| write!(f, "{byte:02x}")),
        }
    }
}

/// What a provider is asked to find
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageKey
{
    /// Module path as the target reported it
    pub module_path: String,
    pub identity: ImageIdentity,
}

impl ImageKey
{
    /// File name part of the module path (either separator style).
    #[must_use]
    pub fn file_name(&self) -> &str
    {
        file_name(&self.module_path)
    }
}

impl fmt::Display for ImageKey
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}/{}", self.file_name(), self.identity)
    }
}

/// Strip directories from a module path, accepting `/` and `\` separators.
#[must_use]
pub fn file_name(path: &str) -> &str
{
    path.rsplit(|c: char| c == '/' || c == '\\').next().unwrap_or(path)
}

/// A located image
#[derive(Debug, Clone)]
pub enum ImageSource
{
    Path(PathBuf),
    Bytes(Arc<[u8]>),
}

/// Locates module images by identity
///
/// Implementations may block (e.g. on a download). Returning `None` means
/// the image is unavailable; memory it would have backed stays unreadable.
pub trait ImageProvider: Send + Sync
{
    fn locate(&self, key: &ImageKey) -> Option<ImageSource>;
}

/// Provider that never finds anything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoImageProvider;

impl ImageProvider for NoImageProvider
{
    fn locate(&self, _key: &ImageKey) -> Option<ImageSource>
    {
        None
    }
}

/// Uses the module's own path when the file there has the right identity
///
/// Debugging on the machine that produced a dump usually has the exact
/// binaries at their original paths; everything else goes to the fallback
/// provider (typically a symbol server client).
#[derive(Default, Clone)]
pub struct LocalImageProvider
{
    fallback: Option<Arc<dyn ImageProvider>>,
}

impl LocalImageProvider
{
    /// Local files only.
    #[must_use]
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Local files first, then `fallback`.
    #[must_use]
    pub fn with_fallback(fallback: Arc<dyn ImageProvider>) -> Self
    {
        Self {
            fallback: Some(fallback),
        }
    }

    fn locate_local(key: &ImageKey) -> Option<ImageSource>
    {
        let path = Path::new(&key.module_path);
        if !path.is_file() {
            return None;
        }
        match ModuleImage::from_path(path) {
            Ok(image) if image.identity() == Some(&key.identity) => {
                debug!(path = %path.display(), "using local module image");
                Some(ImageSource::Bytes(image.shared_data()))
            }
            Ok(image) => {
                trace!(
                    path = %path.display(),
                    expected = %key.identity,
                    found = ?image.identity(),
                    "local module image does not match"
                );
                None
            }
            Err(error) => {
                debug!(path = %path.display(), %error, "local module image unreadable");
                None
            }
        }
    }
}

impl ImageProvider for LocalImageProvider
{
    fn locate(&self, key: &ImageKey) -> Option<ImageSource>
    {
        Self::locate_local(key).or_else(|| self.fallback.as_ref()?.locate(key))
    }
}

impl fmt::Debug for LocalImageProvider
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("LocalImageProvider")
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}
