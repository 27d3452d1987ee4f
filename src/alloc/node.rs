//! Free/allocated node headers, embedded in the mapping.

use std::{
    mem,
    sync::atomic::{AtomicU64, Ordering::SeqCst},
};

/// Header preceding every byte range handed out by the allocator.
///
/// The header lives inside the shared mapping, so all mutable fields
/// are atomics. `index` is the encoded address of the header itself;
/// it is written once when the node is carved and never changes, which
/// is what lets a bare payload pointer be turned back into an index.
#[repr(C)]
pub struct Node {
    /// Monotonic per-node counter; least significant bit zero means
    /// free, one means allocated.
    pub version: AtomicU64,
    /// Encoded chunk-address of this header.
    pub index: u64,
    /// Total size of the node in bytes, header included.
    pub size: AtomicU64,
    /// Free-list successor; the top bit is the logical-delete mark.
    pub next_index: AtomicU64,
}

/// Size of the node header in bytes.
pub const NODE_SIZE: usize = mem::size_of::<Node>();

impl Node {
    pub fn is_free(&self) -> bool {
        self.version.load(SeqCst) & 1 == 0
    }

    pub fn is_allocated(&self) -> bool {
        !self.is_free()
    }
}
