//! PE base relocation engine.
//!
//! Rewrites address-valued fields of a slice of image bytes from the image's
//! preferred base to the base the module was actually loaded at.
//!
//! The relocation table is a sequence of blocks. Each block is an 8-byte
//! header (page RVA, block size including the header) followed by 16-bit
//! entries whose upper 4 bits are the relocation type and lower 12 bits the
//! offset inside the 4 KiB page.

use object::pe::{IMAGE_REL_BASED_ABSOLUTE, IMAGE_REL_BASED_DIR64, IMAGE_REL_BASED_HIGHLOW};
use tracing::warn;

use crate::error::ImgmapError;

const BLOCK_HEADER_SIZE: usize = 8;
const BLOCK_PAGE_SIZE: u64 = 0x1000;
/// Widest patched field; a block can touch this many bytes past its page.
const MAX_FIELD_SIZE: u64 = 8;

/// What a relocation pass did to a slice.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelocationSummary
{
    /// Fields that were rewritten
    pub applied: usize,
    /// Entries inside the slice with a type that is not patched
    pub unsupported: usize,
}

/// Apply base relocations from `table` to `data`.
///
/// `data` holds the image bytes at `[slice_rva, slice_rva + data.len())` in
/// loaded layout and `delta` is `load base - preferred base` (wrapping). A
/// field is patched only if it lies entirely inside `data`; callers that
/// need fields straddling the slice edge must pad the slice.
///
/// Malformed tables end the walk early rather than failing: a block whose
/// declared size is smaller than its own header stops processing.
pub fn apply_relocations(table: &[u8], slice_rva: u32, data: &mut [u8], delta: u64) -> RelocationSummary
{
    let mut summary = RelocationSummary::default();
    if delta == 0 || data.is_empty() {
        return summary;
    }

    let slice_start = u64::from(slice_rva);
    let slice_end = slice_start + data.len() as u64;

    let mut offset = 0usize;
    while offset + BLOCK_HEADER_SIZE <= table.len() {
        let page_rva = read_u32(table, offset);
        let block_size = read_u32(table, offset + 4) as usize;
        if block_size < BLOCK_HEADER_SIZE {
            break;
        }
        let block_end = offset.saturating_add(block_size).min(table.len());
        let entries = &table[offset + BLOCK_HEADER_SIZE..block_end];
        offset = offset.saturating_add(block_size);

        let block_start = u64::from(page_rva);
        let block_limit = block_start + BLOCK_PAGE_SIZE + MAX_FIELD_SIZE;
        if block_limit <= slice_start || block_start >= slice_end {
            continue;
        }

        for entry in entries.chunks_exact(2) {
            let entry = u16::from_le_bytes([entry[0], entry[1]]);
            let kind = entry >> 12;
            let target = block_start + u64::from(entry & 0x0fff);

            let width = match kind {
                IMAGE_REL_BASED_ABSOLUTE => continue,
                IMAGE_REL_BASED_HIGHLOW => 4,
                IMAGE_REL_BASED_DIR64 => 8,
                _ => {
                    if target >= slice_start && target < slice_end {
                        let error = ImgmapError::UnsupportedRelocation {
                            kind,
                            rva: u32::try_from(target).unwrap_or(u32::MAX),
                        };
                        warn!(%error, "leaving relocated field unpatched");
                        summary.unsupported += 1;
                    }
                    continue;
                }
            };
            if target < slice_start || target + width > slice_end {
                continue;
            }

            // target - slice_start < data.len(), so it fits in usize
            let at = usize::try_from(target - slice_start).unwrap_or(usize::MAX);
            if kind == IMAGE_REL_BASED_HIGHLOW {
                let field = &mut data[at..at + 4];
                // HIGHLOW relocations only see the low 32 bits of the delta
                #[allow(clippy::cast_possible_truncation)]
                let patched = read_u32(field, 0).wrapping_add(delta as u32);
                field.copy_from_slice(&patched.to_le_bytes());
            } else {
                let field = &mut data[at..at + 8];
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(field);
                let patched = u64::from_le_bytes(bytes).wrapping_add(delta);
                field.copy_from_slice(&patched.to_le_bytes());
            }
            summary.applied += 1;
        }
    }

    summary
}

fn read_u32(bytes: &[u8], offset: usize) -> u32
{
    u32::from_le_bytes([bytes[offset], bytes[offset + 1], bytes[offset + 2], bytes[offset + 3]])
}
