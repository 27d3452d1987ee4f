//! Shmbt implement a persistent, shared-memory blob store layered
//! with a copy-on-write, multi-version btree index. Threads, and
//! cooperating processes mapping the same backing files, can read and
//! write the store concurrently without a global lock.
//!
//! The package is organised as three engines, stacked:
//!
//! * [chunk] is a growable address space made of doubling-size,
//!   memory-mapped chunks, extended atomically and shared between
//!   participants. 64-bit encoded indexes into this space stay valid
//!   for the life of the store.
//! * [alloc] is a lock-free variable-size allocator over the chunks,
//!   built on a sorted free list with Harris-style logical deletion.
//! * [store] and [btree] provide stable, lockable blob handles over
//!   the allocator, and the copy-on-write btree built out of them.
//!   Every mutation clones its root-to-leaf path and commits by
//!   swapping a single head pointer, so readers always see atomic
//!   snapshots.
//!
//! Transactions are optimistic. A failed [commit][btree::Transaction::commit]
//! leaves the store exactly as it was and frees everything the
//! transaction allocated; callers retry at their discretion.

mod error;

pub mod alloc;
pub mod btree;
pub mod buffer;
pub mod chunk;
pub mod config;
pub mod store;
pub mod util;

pub use crate::alloc::ShmAllocator;
pub use crate::btree::{BPlusTree, Iter, Transaction, TreeStats};
pub use crate::buffer::{Buffer, BufferFactory, HeapFactory, MmapFactory};
pub use crate::chunk::{ChunkManager, ChunkedVector, INVALID_INDEX};
pub use crate::config::{Config, CHUNKSIZE};
pub use crate::error::{Error, Result};
pub use crate::store::{BlobMut, BlobRef, BlobStore};
pub use crate::util::Spinlock;
