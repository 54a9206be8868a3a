//! Hands out block segments to workers

use std::sync::atomic::{AtomicU64, Ordering};

/// One unit of work, a contiguous block range of at most `bpt` blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// position relative to the start of the copy
    pub index: u64,
    /// first input block (skip + index)
    pub iblk: u64,
    /// first output block (seek + index)
    pub oblk: u64,
    pub blocks: u32,
}

/// Wait free segment distributor
///
/// A single fetch-and-add on the position index is the only source of
/// segment boundaries, so no position is ever handed out twice.
#[derive(Debug, Default)]
pub struct Distributor {
    pos_index: AtomicU64,
}

impl Distributor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `(my_index, blocks)`, or `None` once `total` is reached
    pub fn next_segment(&self, bpt: u32, total: u64) -> Option<(u64, u32)> {
        let my_index = self.pos_index.fetch_add(bpt as u64, Ordering::SeqCst);
        if my_index >= total {
            return None;
        }
        let blocks = (total - my_index).min(bpt as u64) as u32;
        Some((my_index, blocks))
    }

    /// Like [Self::next_segment], with the skip and seek offsets applied
    pub fn next(&self, bpt: u32, total: u64, skip: u64, seek: u64) -> Option<Segment> {
        let (index, blocks) = self.next_segment(bpt, total)?;
        Some(Segment {
            index,
            iblk: skip + index,
            oblk: seek + index,
            blocks,
        })
    }

    /// Current position, may be past the end once workers finished
    pub fn position(&self) -> u64 {
        self.pos_index.load(Ordering::SeqCst)
    }
}
