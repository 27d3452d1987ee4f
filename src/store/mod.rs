//! Module `store` implement the blob store: stable, versioned,
//! lockable handles over the allocator.
//!
//! A blob is a variable-sized byte range owned by the store and
//! addressed by a stable integer index. Metadata entries carry the
//! blob's payload offset, a reader/writer spin lock and a tombstone
//! word; removal is soft, outstanding readers keep the payload alive
//! until the last lock drains.

mod blob;
mod metadata;
mod object;

pub use blob::{BlobIter, BlobStore};
pub use metadata::BlobMetadata;
pub use object::{BlobMut, BlobRef};
