//! Module `buffer` define named, fixed-size byte regions and their
//! factories.
//!
//! Every higher layer reaches backing memory only through the
//! [BufferFactory] trait: [MmapFactory] maps files on disk, while
//! [HeapFactory] hands out process-local heap blocks registered by
//! name, so that two stores opened with the same names attach to the
//! same bytes the way two memory-map participants would.

use std::sync::Arc;

use crate::Result;

mod heap;
mod mmap;

pub use heap::HeapFactory;
pub use mmap::MmapFactory;

/// A named region of bytes. The backing bytes never move for the life
/// of the buffer object, which is what makes encoded indexes stable.
pub trait Buffer: Send + Sync {
    /// Name of this buffer, unique within its factory.
    fn to_name(&self) -> String;

    /// Size of the region in bytes.
    fn len(&self) -> usize;

    /// Pointer to the first byte of the region.
    fn as_ptr(&self) -> *mut u8;

    /// Best-effort flush of the region to its backing medium.
    fn flush(&self) -> Result<()>;
}

/// Factory for [Buffer] values. `create` either creates a fresh
/// zero-filled region or re-attaches to an existing one with the same
/// name, growing it to at least `size` bytes.
pub trait BufferFactory: Send + Sync {
    fn create(&self, name: &str, size: usize) -> Result<Arc<dyn Buffer>>;
}
