//! Module `alloc` implement a lock-free allocator over a chunk
//! sequence.
//!
//! Free space is tracked by a singly-linked free list embedded in the
//! free nodes themselves, kept sorted by `(size, index)`. The list is
//! a variant of the [Harris lock-free linked list][harris]: a node is
//! logically deleted by setting the top bit of its published next
//! pointer, and physically unlinked later by whichever walk notices
//! the mark. Unlike Harris' setting, nodes here are recycled while
//! other threads may still be traversing them, so a node keeps its
//! next pointer intact through allocation and carries a version
//! counter whose parity tells free (even) from allocated (odd).
//!
//! Adjacent free blocks are not coalesced.
//!
//! [harris]: https://timharris.uk/papers/2001-disc.pdf

mod node;
mod shm;

pub use node::Node;
pub use shm::{ShmAllocator, Stats};

use crate::chunk::MARK_BIT;

/// Whether the top bit of a next pointer carries the delete mark.
#[inline]
pub(crate) fn is_marked(index: u64) -> bool {
    index & MARK_BIT != 0
}

/// Clear the delete mark.
#[inline]
pub(crate) fn unmarked(index: u64) -> u64 {
    index & !MARK_BIT
}

/// Set the delete mark.
#[inline]
pub(crate) fn marked(index: u64) -> u64 {
    index | MARK_BIT
}
