//! # Configuration
//!
//! Knobs for the memory stack of a target.
//!
//! ## Environment Variables
//!
//! - `IMGMAP_CACHE_LIMIT`: byte limit of each image page cache before it is
//!   cleared wholesale (`67108864`, `64m`, `512k`, `1g`)
//! - `IMGMAP_MAP_IMAGES`: stack the image mapping service (`1`/`0`, `true`/`false`)
//! - `IMGMAP_MAP_METADATA`: stack the metadata mapping service (`1`/`0`, `true`/`false`)

use std::env;

use crate::error::{ImgmapError, Result};
use crate::memory::cache::DEFAULT_CACHE_SIZE_LIMIT;

/// Configuration of a target's memory stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryConfig
{
    /// Total cached bytes at which an image page cache is cleared before the next insert.
    pub cache_size_limit: usize,
    /// Reconstruct missing pages from module images.
    pub map_images: bool,
    /// Always serve managed metadata from module images.
    pub map_metadata: bool,
}

impl Default for MemoryConfig
{
    fn default() -> Self
    {
        Self {
            cache_size_limit: DEFAULT_CACHE_SIZE_LIMIT,
            map_images: true,
            map_metadata: true,
        }
    }
}

impl MemoryConfig
{
    /// Defaults overridden by the `IMGMAP_*` environment variables.
    ///
    /// ## Errors
    ///
    /// Returns [`ImgmapError::Config`] if a variable is set but malformed.
    pub fn from_env() -> Result<Self>
    {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Defaults overridden by values from an arbitrary lookup function.
    ///
    /// ## Errors
    ///
    /// Returns [`ImgmapError::Config`] if a value is present but malformed.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(value) = lookup("IMGMAP_CACHE_LIMIT") {
            config.cache_size_limit = parse_size(&value)?;
        }
        if let Some(value) = lookup("IMGMAP_MAP_IMAGES") {
            config.map_images = parse_flag("IMGMAP_MAP_IMAGES", &value)?;
        }
        if let Some(value) = lookup("IMGMAP_MAP_METADATA") {
            config.map_metadata = parse_flag("IMGMAP_MAP_METADATA", &value)?;
        }
        Ok(config)
    }
}

fn parse_size(value: &str) -> Result<usize>
{
    let trimmed = value.trim().to_ascii_lowercase();
    let (digits, multiplier) = match trimmed.chars().last() {
        Some('k') => (&trimmed[..trimmed.len() - 1], 1024),
        Some('m') => (&trimmed[..trimmed.len() - 1], 1024 * 1024),
        Some('g') => (&trimmed[..trimmed.len() - 1], 1024 * 1024 * 1024),
        _ => (trimmed.as_str(), 1),
    };
    digits
        .trim()
        .parse::<usize>()
        .ok()
        .and_then(|count| count.checked_mul(multiplier))
        .ok_or_else(|| ImgmapError::Config(format!("IMGMAP_CACHE_LIMIT: invalid size '{value}'")))
}

fn parse_flag(name: &str, value: &str) -> Result<bool>
{
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ImgmapError::Config(format!("{name}: expected a boolean, found '{value}'"))),
    }
}
