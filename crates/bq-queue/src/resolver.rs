//! The Read/Write Overlap Resolver (§4.2): services reads against queued
//! writes, and tells `pwrite` whether an incoming write can be absorbed
//! in-place instead of allocating a new request.

use std::collections::HashMap;

use crate::request::{Request, RequestId};

fn copy_into(out: &mut [u8], base_offset: u64, abs_offset: u64, src: &[u8]) {
    let start = (abs_offset - base_offset) as usize;
    out[start..start + src.len()].copy_from_slice(src);
}

/// Resolve `[range_offset, range_offset + range_size)` against `ids`
/// (already in most-recent-first order), copying queued write bytes into
/// `out` (indexed relative to `base_offset`, the original read's start).
///
/// Returns the still-unfulfilled sub-ranges (absolute offset, length) that
/// must fall through to the backend, and bumps `max_section` to the
/// highest section among every Write it touched (§4.2 step 3 / I7).
pub fn resolve_read(
    ids: &[RequestId],
    storage: &HashMap<RequestId, Request>,
    min_section: u64,
    base_offset: u64,
    range_offset: u64,
    range_size: usize,
    out: &mut [u8],
    max_section: &mut u64,
) -> Vec<(u64, usize)> {
    if range_size == 0 {
        return Vec::new();
    }
    let r0 = range_offset;
    let r1 = range_offset + range_size as u64;

    for (i, &id) in ids.iter().enumerate() {
        let req = &storage[&id];
        let Some(w) = req.as_write() else { continue };
        if req.section < min_section {
            continue;
        }
        if !w.intersects(range_offset, range_size) {
            continue;
        }
        *max_section = (*max_section).max(req.section);

        let w0 = w.offset;
        let w1 = w.end();
        let rest = &ids[i + 1..];

        if r0 >= w0 && r1 <= w1 {
            // Fully contained: read <= write.
            let src_start = (r0 - w0) as usize;
            copy_into(out, base_offset, r0, &w.buf[src_start..src_start + range_size]);
            return Vec::new();
        } else if r0 < w0 && r1 <= w1 {
            // Tail overlap: the write covers the tail of the read.
            let len = (r1 - w0) as usize;
            copy_into(out, base_offset, w0, &w.buf[..len]);
            let new_size = (w0 - r0) as usize;
            return resolve_read(rest, storage, min_section, base_offset, r0, new_size, out, max_section);
        } else if r0 >= w0 && r1 > w1 {
            // Head overlap: the write covers the head of the read.
            let src_start = (r0 - w0) as usize;
            let len = (w1 - r0) as usize;
            copy_into(out, base_offset, r0, &w.buf[src_start..src_start + len]);
            let new_size = (r1 - w1) as usize;
            return resolve_read(rest, storage, min_section, base_offset, w1, new_size, out, max_section);
        }
        // Write strictly inside read: r0 < w0 && r1 > w1.
        copy_into(out, base_offset, w0, &w.buf);
        let prefix_size = (w0 - r0) as usize;
        let suffix_offset = w1;
        let suffix_size = (r1 - w1) as usize;
        let mut gaps = resolve_read(rest, storage, min_section, base_offset, r0, prefix_size, out, max_section);
        let mut suffix_gaps =
            resolve_read(rest, storage, min_section, base_offset, suffix_offset, suffix_size, out, max_section);
        gaps.append(&mut suffix_gaps);
        return gaps;
    }

    vec![(range_offset, range_size)]
}

/// Outcome of consulting the resolver for a `pwrite` (§4.1).
pub enum MergeOutcome {
    /// The whole incoming range was absorbed into an existing request; no
    /// new request should be allocated.
    Merged,
    /// No single queued write at `floor_section` fully contains the
    /// incoming range; allocate a new Write at `section`.
    NotMerged { section: u64 },
}

/// Consult the resolver before allocating a new Write (§4.1, §4.2).
///
/// Only merges when every Write overlapping `[offset, offset+size)` sits
/// exactly at `floor_section` (the context's current section) and one of
/// them fully contains the incoming range — mutating a request that
/// belongs to a later section would retroactively rewrite data a barrier
/// may already have ordered ahead of it. Any overlap with a later section
/// instead bumps the target section (I7) without merging.
pub fn resolve_write_merge(
    ids: &[RequestId],
    storage: &mut HashMap<RequestId, Request>,
    floor_section: u64,
    offset: u64,
    size: usize,
    buf: &[u8],
) -> MergeOutcome {
    let mut bumped = floor_section;
    let mut candidate = None;

    for &id in ids {
        let req = &storage[&id];
        let Some(w) = req.as_write() else { continue };
        if req.section < floor_section || !w.intersects(offset, size) {
            continue;
        }
        bumped = bumped.max(req.section);
        if req.section == floor_section
            && candidate.is_none()
            && w.offset <= offset
            && w.end() >= offset + size as u64
        {
            candidate = Some(id);
        }
    }

    if bumped > floor_section {
        return MergeOutcome::NotMerged { section: bumped };
    }

    if let Some(id) = candidate {
        let req = storage.get_mut(&id).expect("candidate id is in storage");
        let w = req.as_write_mut().expect("candidate is a write");
        let start = (offset - w.offset) as usize;
        w.buf[start..start + size].copy_from_slice(buf);
        return MergeOutcome::Merged;
    }

    MergeOutcome::NotMerged { section: floor_section }
}
