//! Module images located on disk (or handed over as bytes).

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use object::{FileKind, Object, ObjectSegment};
use tracing::debug;

use super::pe::PeImageInfo;
use super::ModuleLayout;
use crate::error::{ImgmapError, Result};
use crate::provider::{ImageIdentity, ImageSource};

const ELF_PAGE_MASK: u64 = 0xfff;

/// A segment of an ELF or MachO image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualSegment
{
    /// Link-time virtual address
    pub address: u64,
    /// Size in memory
    pub size: u64,
    pub file_offset: u64,
    /// Bytes backed by the file; the rest of `size` is zero-filled.
    pub file_size: u64,
}

/// Virtual address translation for ELF and MachO images
#[derive(Debug, Clone, Default)]
pub struct SegmentMap
{
    /// Virtual address the image's first byte is linked at
    pub preferred_base: u64,
    pub segments: Vec<VirtualSegment>,
}

impl SegmentMap
{
    /// Bytes at `rva` (relative to `preferred_base`), up to `size`.
    ///
    /// The read continues into the next segment while segments are
    /// back to back, and stops at the first unmapped address.
    ///
    /// ## Errors
    ///
    /// Returns [`ImgmapError::InvalidVirtualAddress`] if no segment contains `rva`.
    pub fn read(&self, data: &[u8], rva: u64, size: usize) -> Result<Vec<u8>>
    {
        let start = self.preferred_base.wrapping_add(rva);
        if self.segment_at(start).is_none() {
            return Err(ImgmapError::InvalidVirtualAddress(start));
        }

        let mut bytes = Vec::new();
        let mut address = start;
        while bytes.len() < size {
            let Some(segment) = self.segment_at(address) else {
                break;
            };
            let offset = address - segment.address;
            let wanted = size - bytes.len();
            let len = usize::try_from(segment.size - offset).map_or(wanted, |remaining| remaining.min(wanted));

            let chunk_start = bytes.len();
            bytes.resize(chunk_start + len, 0);
            if offset < segment.file_size {
                let backed = usize::try_from(segment.file_size - offset).map_or(len, |remaining| remaining.min(len));
                let file_start = segment
                    .file_offset
                    .checked_add(offset)
                    .and_then(|file_start| usize::try_from(file_start).ok())
                    .ok_or(ImgmapError::InvalidVirtualAddress(address))?;
                let available = data.get(file_start..).unwrap_or_default();
                let copied = backed.min(available.len());
                bytes[chunk_start..chunk_start + copied].copy_from_slice(&available[..copied]);
            }

            let Some(next) = address.checked_add(len as u64) else {
                break;
            };
            address = next;
        }
        Ok(bytes)
    }

    fn segment_at(&self, address: u64) -> Option<&VirtualSegment>
    {
        self.segments
            .iter()
            .find(|segment| address >= segment.address && address - segment.address < segment.size)
    }
}

/// What kind of image a [`ModuleImage`] holds
#[derive(Debug, Clone)]
pub enum ImageKind
{
    Pe(PeImageInfo),
    Elf(SegmentMap),
    MachO(SegmentMap),
}

/// A module's image file, parsed once and shared
pub struct ModuleImage
{
    path: Option<PathBuf>,
    data: Arc<[u8]>,
    kind: ImageKind,
    identity: Option<ImageIdentity>,
}

impl ModuleImage
{
    /// Load and parse an image from wherever a provider found it.
    ///
    /// ## Errors
    ///
    /// Returns [`ImgmapError::Io`] if the file cannot be read and a format
    /// error if it is not a supported PE, ELF or thin MachO image.
    pub fn open(source: &ImageSource) -> Result<Self>
    {
        match source {
            ImageSource::Path(path) => Self::from_path(path),
            ImageSource::Bytes(bytes) => Self::from_bytes(bytes.clone(), None),
        }
    }

    /// Read and parse an image file.
    ///
    /// ## Errors
    ///
    /// See [`ModuleImage::open`].
    pub fn from_path(path: &Path) -> Result<Self>
    {
        let data: Arc<[u8]> = fs::read(path)?.into();
        Self::from_bytes(data, Some(path.to_path_buf()))
    }

    /// Parse an image held in memory.
    ///
    /// ## Errors
    ///
    /// See [`ModuleImage::open`].
    pub fn from_bytes(data: Arc<[u8]>, path: Option<PathBuf>) -> Result<Self>
    {
        let (kind, identity) = match FileKind::parse(&*data)? {
            FileKind::Pe32 | FileKind::Pe64 => {
                let info = PeImageInfo::parse(&*data, ModuleLayout::File)?;
                let identity = ImageIdentity::Pe {
                    time_date_stamp: info.headers.time_date_stamp,
                    size_of_image: info.headers.size_of_image,
                };
                (ImageKind::Pe(info), Some(identity))
            }
            FileKind::Elf32 | FileKind::Elf64 => {
                let file = object::File::parse(&*data)?;
                let identity = file.build_id()?.map(|id| ImageIdentity::BuildId(id.to_vec()));
                let segments = segments(&file);
                let preferred_base = segments.iter().map(|segment| segment.address).min().unwrap_or(0) & !ELF_PAGE_MASK;
                (
                    ImageKind::Elf(SegmentMap {
                        preferred_base,
                        segments,
                    }),
                    identity,
                )
            }
            FileKind::MachO32 | FileKind::MachO64 => {
                let file = object::File::parse(&*data)?;
                let identity = file.mach_uuid()?.map(ImageIdentity::Uuid);
                let preferred_base = file
                    .segments()
                    .find(|segment| matches!(segment.name(), Ok(Some("__TEXT"))))
                    .map(|segment| segment.address())
                    .or_else(|| {
                        file.segments()
                            .filter(|segment| segment.file_range().1 > 0)
                            .map(|segment| segment.address())
                            .min()
                    })
                    .unwrap_or(0);
                (
                    ImageKind::MachO(SegmentMap {
                        preferred_base,
                        segments: segments(&file),
                    }),
                    identity,
                )
            }
            other => {
                return Err(ImgmapError::BadImageFormat(format!("unsupported image kind {other:?}")));
            }
        };
        debug!(path = ?path, size = data.len(), identity = ?identity, "parsed module image");

        Ok(Self {
            path,
            data,
            kind,
            identity,
        })
    }

    /// File the image was read from, if it came from disk.
    pub fn path(&self) -> Option<&Path>
    {
        self.path.as_deref()
    }

    /// Raw file bytes.
    pub fn data(&self) -> &[u8]
    {
        &self.data
    }

    /// Shared handle to the raw file bytes.
    pub fn shared_data(&self) -> Arc<[u8]>
    {
        self.data.clone()
    }

    pub fn kind(&self) -> &ImageKind
    {
        &self.kind
    }

    /// PE headers, if this is a PE image.
    pub fn pe(&self) -> Option<&PeImageInfo>
    {
        match &self.kind {
            ImageKind::Pe(info) => Some(info),
            ImageKind::Elf(_) | ImageKind::MachO(_) => None,
        }
    }

    /// Identity used to match the image against a module.
    pub fn identity(&self) -> Option<&ImageIdentity>
    {
        self.identity.as_ref()
    }

    /// Virtual-address read for ELF and MachO images.
    ///
    /// ## Errors
    ///
    /// Returns [`ImgmapError::InvalidVirtualAddress`] if `rva` is not mapped
    /// by any segment, or [`ImgmapError::BadImageFormat`] for PE images.
    pub fn read_virtual(&self, rva: u64, size: usize) -> Result<Vec<u8>>
    {
        match &self.kind {
            ImageKind::Elf(map) | ImageKind::MachO(map) => map.read(&self.data, rva, size),
            ImageKind::Pe(_) => Err(ImgmapError::BadImageFormat(
                "PE images are mapped through their section table".to_string(),
            )),
        }
    }

    /// The managed metadata blob of a PE image with a CLR header.
    pub fn metadata(&self) -> Option<&[u8]>
    {
        let info = self.pe()?;
        let (rva, size) = info.metadata_directory()?;
        let start = usize::try_from(info.headers.file_offset(rva)?).ok()?;
        let end = start.checked_add(usize::try_from(size).ok()?)?;
        self.data.get(start..end)
    }
}

impl fmt::Debug for ModuleImage
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("ModuleImage")
            .field("path", &self.path)
            .field("size", &self.data.len())
            .field("kind", &self.kind)
            .field("identity", &self.identity)
            .finish()
    }
}

fn segments(file: &object::File<'_>) -> Vec<VirtualSegment>
{
    file.segments()
        .map(|segment| {
            let (file_offset, file_size) = segment.file_range();
            VirtualSegment {
                address: segment.address(),
                size: segment.size(),
                file_offset,
                file_size,
            }
        })
        .filter(|segment| segment.size > 0)
        .collect()
}
