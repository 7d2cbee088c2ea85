//! Strobe snapshotting.
//!
//! The sampler walks the cell chain and copies enabled cells into the strobe
//! payload, host byte order, no synchronization against the application.
//! That is deliberate: timeliness beats coherence here, and callers that
//! need atomic snapshots use an external strobe source instead.

use core::ptr::NonNull;

use crate::config::{Config, StrobeDynamics};
use crate::crc::{self, CrcFn};
use crate::frame::DataFrame;
use crate::planner::STROBE_TAG;
use crate::space::DataSpace;

/// Capture one strobe cycle into the frame. A dynamic cycle in which no cell
/// is due still produces the tag, mask and CRC portions: the empty mask is
/// how the client learns the cycle carried no data.
pub(crate) fn sample(
    frame: &mut DataFrame,
    space: &mut DataSpace,
    cfg: &Config,
    crc: CrcFn,
    mask_bytes: usize,
) {
    let dynamic = cfg.strobe_dynamics == StrobeDynamics::Dynamic;
    let base = frame.prefix;
    let mut cursor = base;

    if cfg.strobe_stuffed() {
        frame.buf[cursor] = STROBE_TAG;
        cursor += 1;
    }
    let mask_base = cursor;
    if dynamic {
        frame.buf[mask_base..mask_base + mask_bytes].fill(0);
        cursor += mask_bytes;
    }

    for (index, cell) in space.cells_mut().iter_mut().enumerate() {
        if !cell.ty.enabled() {
            continue;
        }
        if dynamic {
            cell.rate.counter = cell.rate.counter.saturating_sub(1);
            if cell.rate.counter > 0 {
                continue;
            }
            cell.rate.counter = cell.rate.reload;
            frame.buf[mask_base + index / 8] |= 1 << (index % 8);
        }
        let footprint = cell.footprint();
        if let Some(ptr) = cell.ptr {
            let dst = &mut frame.buf[cursor..cursor + footprint];
            unsafe {
                copy_cell(
                    dst,
                    ptr,
                    cell.count as usize,
                    cell.ty.byte_width(),
                    cfg.unaligned_access,
                )
            };
        } else {
            // Conceptual cell without backing memory; its slot reads zero.
            frame.buf[cursor..cursor + footprint].fill(0);
        }
        cursor += footprint;
    }

    if cfg.strobe_crc {
        cursor = base + crc::append(crc, &mut frame.buf[base..], cursor - base, cfg.crc_width);
    }

    frame.bytes_total = cursor - base;
    frame.valid = 1;
}

/// Copy one cell's elements into the strobe buffer.
///
/// # Safety
///
/// `ptr` must reference at least `count * width` readable bytes, aligned to
/// `width` when the target forbids unaligned access. Concurrent mutation by
/// the application is tolerated; torn multi-element snapshots are accepted
/// protocol behavior.
unsafe fn copy_cell(dst: &mut [u8], ptr: NonNull<u8>, count: usize, width: usize, unaligned: bool) {
    if unaligned || width == 1 {
        core::ptr::copy_nonoverlapping(ptr.as_ptr(), dst.as_mut_ptr(), count * width);
        return;
    }
    // Word-sized reads, byte-sized writes, host byte order preserved.
    let mut offset = 0;
    for i in 0..count {
        match width {
            2 => {
                let value = ptr.as_ptr().cast::<u16>().add(i).read_volatile();
                dst[offset..offset + 2].copy_from_slice(&value.to_ne_bytes());
            }
            4 => {
                let value = ptr.as_ptr().cast::<u32>().add(i).read_volatile();
                dst[offset..offset + 4].copy_from_slice(&value.to_ne_bytes());
            }
            _ => {
                let value = ptr.as_ptr().cast::<u64>().add(i).read_volatile();
                dst[offset..offset + 8].copy_from_slice(&value.to_ne_bytes());
            }
        }
        offset += width;
    }
}
