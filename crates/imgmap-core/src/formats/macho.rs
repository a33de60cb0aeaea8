//! MachO load commands: segments and `LC_UUID`.

use std::mem;

use object::macho::{MachHeader32, MachHeader64, VM_PROT_WRITE};
use object::read::macho::MachHeader;
use object::Endianness;

use super::{ImageBytes, MAX_HEADER_TABLE_SIZE};
use crate::error::{ImgmapError, Result};

const MH_MAGIC_64_LE: [u8; 4] = [0xcf, 0xfa, 0xed, 0xfe];
const MH_MAGIC_64_BE: [u8; 4] = [0xfe, 0xed, 0xfa, 0xcf];

/// A `LC_SEGMENT`/`LC_SEGMENT_64` command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachOSegment
{
    pub name: String,
    pub vmaddr: u64,
    pub vmsize: u64,
    pub fileoff: u64,
    pub filesize: u64,
    pub writable: bool,
}

/// The load-command view of a MachO image
#[derive(Debug, Clone, Default)]
pub struct MachOLoadCommands
{
    pub uuid: Option<[u8; 16]>,
    /// vmaddr of `__TEXT`; the MachO header sits here.
    pub text_vmaddr: u64,
    pub segments: Vec<MachOSegment>,
}

impl MachOLoadCommands
{
    /// Parse the header and load commands at the start of an image.
    ///
    /// ## Errors
    ///
    /// Returns an error if the image is not a thin MachO or its load commands
    /// are not readable.
    pub fn read<B: ImageBytes + ?Sized>(bytes: &B) -> Result<Self>
    {
        let magic = bytes
            .read_vec(0, 4)
            .ok_or_else(|| ImgmapError::BadImageFormat("MachO header not readable".to_string()))?;
        if magic == MH_MAGIC_64_LE || magic == MH_MAGIC_64_BE {
            Self::read_class::<MachHeader64<Endianness>, B>(bytes)
        } else {
            Self::read_class::<MachHeader32<Endianness>, B>(bytes)
        }
    }

    fn read_class<Mach: MachHeader<Endian = Endianness>, B: ImageBytes + ?Sized>(bytes: &B) -> Result<Self>
    {
        let header_size = mem::size_of::<Mach>();
        let header = bytes
            .read_vec(0, header_size)
            .ok_or_else(|| ImgmapError::BadImageFormat("MachO header not readable".to_string()))?;
        let endian = Mach::parse(header.as_slice(), 0)?.endian()?;
        let needed = usize::try_from(Mach::parse(header.as_slice(), 0)?.sizeofcmds(endian))
            .ok()
            .and_then(|commands_size| header_size.checked_add(commands_size))
            .filter(|&end| end <= MAX_HEADER_TABLE_SIZE)
            .ok_or_else(|| ImgmapError::BadImageFormat("MachO load commands out of range".to_string()))?;

        let data = bytes
            .read_vec(0, needed)
            .ok_or_else(|| ImgmapError::BadImageFormat("MachO load commands not readable".to_string()))?;
        let mach = Mach::parse(data.as_slice(), 0)?;

        let mut result = Self::default();
        let mut commands = mach.load_commands(endian, data.as_slice(), 0)?;
        while let Some(command) = commands.next()? {
            if let Some((segment, _)) = command.segment_64()? {
                let initprot = segment.initprot.get(endian);
                result.segments.push(MachOSegment {
                    name: segment_name(&segment.segname),
                    vmaddr: segment.vmaddr.get(endian),
                    vmsize: segment.vmsize.get(endian),
                    fileoff: segment.fileoff.get(endian),
                    filesize: segment.filesize.get(endian),
                    writable: initprot & VM_PROT_WRITE != 0,
                });
            } else if let Some((segment, _)) = command.segment_32()? {
                let initprot = segment.initprot.get(endian);
                result.segments.push(MachOSegment {
                    name: segment_name(&segment.segname),
                    vmaddr: u64::from(segment.vmaddr.get(endian)),
                    vmsize: u64::from(segment.vmsize.get(endian)),
                    fileoff: u64::from(segment.fileoff.get(endian)),
                    filesize: u64::from(segment.filesize.get(endian)),
                    writable: initprot & VM_PROT_WRITE != 0,
                });
            } else if let Some(uuid) = command.uuid()? {
                result.uuid = Some(uuid.uuid);
            }
        }
        result.text_vmaddr = text_vmaddr(&result.segments);
        Ok(result)
    }

    /// `(rva, size)` of every writable segment other than `__LINKEDIT`.
    pub fn writable_ranges(&self) -> impl Iterator<Item = (u64, u64)> + '_
    {
        self.segments
            .iter()
            .filter(|segment| segment.writable && segment.name != "__LINKEDIT")
            .filter_map(|segment| Some((segment.vmaddr.checked_sub(self.text_vmaddr)?, segment.vmsize)))
    }
}

/// vmaddr the image's first mapped byte is linked at.
///
/// `__TEXT` when present, else the lowest segment other than `__PAGEZERO`.
pub(crate) fn text_vmaddr(segments: &[MachOSegment]) -> u64
{
    segments
        .iter()
        .find(|segment| segment.name == "__TEXT")
        .or_else(|| {
            segments
                .iter()
                .filter(|segment| segment.name != "__PAGEZERO")
                .min_by_key(|segment| segment.vmaddr)
        })
        .map_or(0, |segment| segment.vmaddr)
}

fn segment_name(raw: &[u8; 16]) -> String
{
    let end = raw.iter().position(|&byte| byte == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}
