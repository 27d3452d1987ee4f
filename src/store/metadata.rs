//! Per-blob metadata records, living in the metadata chunk sequence.

use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU64, Ordering::SeqCst};

/// Lock-state bit for a single writer. The remaining value counts
/// readers: 0 idle, N > 0 means N readers.
pub const WRITE_FLAG: i32 = i32::MIN;

/// Metadata for one blob slot. Entry 0 of the metadata vector is
/// reserved: its `next_free_index` is the head of the free-slot list.
///
/// `next_free_index` drives the slot life cycle:
///
/// ```text
///   -1  live
///    0  tombstoned (no new locks; existing locks drain), or the
///       end-of-list marker when the slot sits on the free-slot list
///   >0  next free slot on the free-slot list
/// ```
///
/// A zero-filled slot therefore reads as deleted until it is published
/// by storing -1, which is always the last step of initialization.
#[repr(C)]
pub struct BlobMetadata {
    /// Requested size of the blob in bytes.
    pub size: AtomicU64,
    /// Encoded index of the current payload; swapping this word is the
    /// copy-on-write publish primitive.
    pub offset: AtomicU64,
    /// Reader/writer lock state.
    pub lock_state: AtomicI32,
    /// Slot life-cycle word, see above.
    pub next_free_index: AtomicI64,
}

impl Default for BlobMetadata {
    fn default() -> BlobMetadata {
        BlobMetadata {
            size: AtomicU64::new(0),
            offset: AtomicU64::new(0),
            lock_state: AtomicI32::new(0),
            next_free_index: AtomicI64::new(0),
        }
    }
}

impl BlobMetadata {
    /// Whether this slot holds no live blob: tombstoned, on the free
    /// list, or never initialized.
    pub fn is_deleted(&self) -> bool {
        self.next_free_index.load(SeqCst) != -1
    }

    /// Whether this slot is tombstoned, waiting for locks to drain.
    pub fn is_tombstone(&self) -> bool {
        self.next_free_index.load(SeqCst) == 0
    }

    /// Move a live slot to the tombstone state. Returns false if the
    /// slot is not live, which makes a second remove a no-op.
    pub fn set_tombstone(&self) -> bool {
        self.next_free_index.compare_exchange(-1, 0, SeqCst, SeqCst).is_ok()
    }
}
