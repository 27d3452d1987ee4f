//! The blob store proper: slot management, locking, removal.

use bytemuck::Pod;
use log::info;

use std::{
    cmp, mem, ptr,
    sync::atomic::Ordering::SeqCst,
    sync::Arc,
    thread,
};

use crate::{
    alloc::ShmAllocator,
    buffer::BufferFactory,
    chunk::{ChunkManager, ChunkedVector},
    err_at,
    store::{
        metadata::{BlobMetadata, WRITE_FLAG},
        object::{BlobMut, BlobRef},
    },
    Config, Error, Result,
};

/// BlobStore manages the storage and retrieval of blobs in a pair of
/// chunk sequences: payloads in the data sequence, a
/// [ChunkedVector] of [BlobMetadata] in the metadata sequence.
///
/// The store is safe for concurrent use from many threads, and for
/// cooperating stores attached to the same buffers.
pub struct BlobStore {
    name: String,
    spin: bool,
    allocator: ShmAllocator,
    metadata: ChunkedVector<BlobMetadata>,
}

impl BlobStore {
    /// Create a store, or re-attach to an existing one with the same
    /// configuration.
    pub fn create(factory: Arc<dyn BufferFactory>, config: Config) -> Result<BlobStore> {
        let data_chunks = ChunkManager::create(
            Arc::clone(&factory),
            &format!("{}_data", config.name),
            config.chunk_size,
            config.spin,
        )?;
        let allocator = ShmAllocator::create(data_chunks)?;
        let metadata: ChunkedVector<BlobMetadata> = ChunkedVector::create(
            factory,
            &format!("{}_metadata", config.name),
            config.chunk_size,
            config.spin,
        )?;
        if metadata.is_empty() {
            // slot 0 heads the free-slot list.
            metadata.resize(1)?;
        }

        let store = BlobStore {
            name: config.name.clone(),
            spin: config.spin,
            allocator,
            metadata,
        };
        info!(target: "store", "{:?}, opened with {} blobs", store.name, store.len());
        Ok(store)
    }

    /// Identify this store.
    #[inline]
    pub fn to_name(&self) -> String {
        self.name.clone()
    }

    /// Number of live blobs.
    pub fn len(&self) -> usize {
        let n = self.metadata.len().saturating_sub(1);
        n - self.free_slot_count()
    }

    /// Whether the store holds no live blobs.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of metadata slots whose blob was deleted.
    pub fn free_slot_count(&self) -> usize {
        (1..self.metadata.len())
            .filter(|i| match self.metadata_at(*i) {
                Some(md) => md.is_deleted(),
                None => false,
            })
            .count()
    }

    /// Store `value` as a new blob, returning an exclusive handle.
    pub fn insert<T: Pod>(&self, value: T) -> Result<BlobMut<T>> {
        let size = mem::size_of::<T>();
        let index = self.new_slot(size)?;
        let ptr = match self.raw_at(index) {
            Some((ptr, _)) => ptr as *mut T,
            None => panic!("fresh blob {} unreadable, call the programmer", index),
        };
        unsafe { ptr::write(ptr, value) };
        match self.get_mut(index) {
            Some(guard) => Ok(guard),
            None => err_at!(Fatal, msg: "fresh blob {} already removed", index),
        }
    }

    /// Store a zero-filled array of `n` elements of `T` as a new blob.
    /// The elements are reachable through
    /// [as_slice][BlobRef::as_slice] on the returned handle.
    pub fn insert_zeroed<T: Pod>(&self, n: usize) -> Result<BlobMut<T>> {
        let size = n * mem::size_of::<T>();
        let index = self.new_slot(size)?;
        match self.raw_at(index) {
            // recycled payload space may hold stale bytes.
            Some((ptr, _)) => unsafe { ptr::write_bytes(ptr, 0, size) },
            None => panic!("fresh blob {} unreadable, call the programmer", index),
        }
        match self.get_mut(index) {
            Some(guard) => Ok(guard),
            None => err_at!(Fatal, msg: "fresh blob {} already removed", index),
        }
    }

    /// Acquire a shared handle on blob `index`. Yields `None` when the
    /// blob is tombstoned, removed, or was never stored.
    pub fn get<T: Pod>(&self, index: usize) -> Option<BlobRef<T>> {
        BlobRef::acquire(self, index)
    }

    /// Acquire an exclusive handle on blob `index`.
    pub fn get_mut<T: Pod>(&self, index: usize) -> Option<BlobMut<T>> {
        BlobMut::acquire(self, index)
    }

    /// Remove blob `index`. The slot is tombstoned; the payload is
    /// freed and the slot recycled once the last outstanding lock
    /// drains. Removing twice is the same as removing once.
    pub fn remove(&self, index: usize) {
        let md = match self.metadata_at(index) {
            Some(md) => md,
            None => return,
        };
        if !md.set_tombstone() {
            return;
        }
        if md.lock_state.load(SeqCst) == 0 {
            self.finalize_remove(index);
        }
    }

    /// Requested size, in bytes, of blob `index`; 0 for dead slots.
    pub fn blob_size(&self, index: usize) -> usize {
        match self.metadata_at(index) {
            Some(md) if !md.is_deleted() => md.size.load(SeqCst) as usize,
            _ => 0,
        }
    }

    // Size regardless of tombstoning, for handles that outlive a
    // remove.
    pub(crate) fn blob_size_any(&self, index: usize) -> usize {
        match self.metadata_at(index) {
            Some(md) => md.size.load(SeqCst) as usize,
            None => 0,
        }
    }

    /// Compare-and-swap the payload offset of blob `index`. This is
    /// the primitive that atomically publishes a new payload under an
    /// unchanged blob index.
    pub fn compare_and_swap(&self, index: usize, expected: u64, new: u64) -> bool {
        match self.metadata_at(index) {
            Some(md) if !md.is_deleted() => {
                md.offset.compare_exchange(expected, new, SeqCst, SeqCst).is_ok()
            }
            _ => false,
        }
    }

    /// Copy blob `index` into a fresh blob of the same size, returning
    /// the new blob's index. Only safe while the caller holds a lock
    /// on `index`, which the handle API enforces.
    pub(crate) fn clone_blob(&self, index: usize) -> Result<usize> {
        let md = match self.metadata_at(index) {
            Some(md) => md,
            None => return err_at!(InvalidInput, msg: "clone of dead blob {}", index),
        };
        let size = md.size.load(SeqCst) as usize;
        let src = match self.allocator.to_ptr(md.offset.load(SeqCst)) {
            Some(src) => src,
            None => return err_at!(Fatal, msg: "blob {} payload unmapped", index),
        };
        let clone_index = self.new_slot(size)?;
        let dst = match self.raw_at(clone_index) {
            Some((ptr, _)) => ptr,
            None => panic!("fresh blob {} unreadable, call the programmer", clone_index),
        };
        unsafe { ptr::copy_nonoverlapping(src, dst, size) };
        Ok(clone_index)
    }

    /// Iterate the indexes of live blobs in ascending order.
    pub fn iter(&self) -> BlobIter {
        BlobIter { store: self, index: 1 }
    }

    /// Flush both chunk sequences to their backing media.
    pub fn flush(&self) -> Result<()> {
        self.allocator.flush()?;
        self.metadata.flush()
    }

    // Allocate payload space and a metadata slot for a blob of `size`
    // bytes. The slot is published (made live) as the last step.
    fn new_slot(&self, size: usize) -> Result<usize> {
        if size == 0 {
            return err_at!(InvalidInput, msg: "zero sized blob");
        }
        let index = self.find_free_slot()?;
        let ptr = match self.allocator.allocate(size) {
            Some(ptr) => ptr,
            None => return err_at!(Fatal, msg: "store {:?} out of space", self.name),
        };
        let md = match self.metadata_at(index) {
            Some(md) => md,
            None => panic!("lost metadata slot {}, call the programmer", index),
        };
        md.size.store(size as u64, SeqCst);
        md.offset.store(self.allocator.to_index(ptr), SeqCst);
        md.lock_state.store(0, SeqCst);
        md.next_free_index.store(-1, SeqCst);
        Ok(index)
    }

    // Pop a recycled slot off the free-slot list, or grow the
    // metadata vector by one entry.
    fn find_free_slot(&self) -> Result<usize> {
        let head_md = match self.metadata_at(0) {
            Some(md) => md,
            None => panic!("metadata slot 0 missing, call the programmer"),
        };
        loop {
            let head = head_md.next_free_index.load(SeqCst);
            if head == 0 {
                return self.metadata.push(BlobMetadata::default());
            }
            let md = match self.metadata_at(head as usize) {
                Some(md) => md,
                None => return err_at!(Fatal, msg: "free-slot list points at {}", head),
            };
            let next = md.next_free_index.load(SeqCst);
            if head_md.next_free_index.compare_exchange(head, next, SeqCst, SeqCst).is_ok() {
                return Ok(head as usize);
            }
        }
    }

    // Free the payload of a tombstoned blob and push its slot onto the
    // free-slot list. The write flag on the (tombstoned) blob is the
    // claim, so only one caller runs the body; a zeroed size marks a
    // slot whose payload was already freed, since an end-of-list slot
    // and a tombstoned slot both read 0 in `next_free_index`.
    fn finalize_remove(&self, index: usize) {
        let md = match self.metadata_at(index) {
            Some(md) => md,
            None => return,
        };
        if md.lock_state.compare_exchange(0, WRITE_FLAG, SeqCst, SeqCst).is_err() {
            // someone still holds a lock, or another finalizer won;
            // the last unlock comes back here.
            return;
        }
        if !md.is_tombstone() || md.size.load(SeqCst) == 0 {
            // recycled, or already finalized.
            md.lock_state.compare_exchange(WRITE_FLAG, 0, SeqCst, SeqCst).ok();
            return;
        }
        let offset = md.offset.load(SeqCst);
        md.size.store(0, SeqCst);
        self.allocator.deallocate_at(offset);

        // two-CAS push: link the slot, then swing the list head; on a
        // lost head race, revert the link and retry.
        let head_md = match self.metadata_at(0) {
            Some(head_md) => head_md,
            None => panic!("metadata slot 0 missing, call the programmer"),
        };
        loop {
            let head = head_md.next_free_index.load(SeqCst);
            if md.next_free_index.compare_exchange(0, head, SeqCst, SeqCst).is_err() {
                panic!("tombstone {} mutated while freeing, call the programmer", index);
            }
            if head_md.next_free_index.compare_exchange(head, index as i64, SeqCst, SeqCst).is_ok()
            {
                break;
            }
            md.next_free_index.store(0, SeqCst);
        }
        // a popper may have re-initialized the slot already; only undo
        // our own claim.
        md.lock_state.compare_exchange(WRITE_FLAG, 0, SeqCst, SeqCst).ok();
    }

    pub(crate) fn metadata_at(&self, index: usize) -> Option<&BlobMetadata> {
        let ptr = self.metadata.at(index)?;
        Some(unsafe { &*(ptr as *const BlobMetadata) })
    }

    // Payload pointer and offset of a live blob.
    pub(crate) fn raw_at(&self, index: usize) -> Option<(*mut u8, u64)> {
        let md = self.metadata_at(index)?;
        if md.is_deleted() || md.size.load(SeqCst) == 0 {
            return None;
        }
        let offset = md.offset.load(SeqCst);
        let ptr = self.allocator.to_ptr(offset)?;
        Some((ptr, offset))
    }

    pub(crate) fn acquire_read(&self, index: usize) -> bool {
        loop {
            let md = match self.metadata_at(index) {
                Some(md) => md,
                None => return false,
            };
            if md.is_deleted() {
                return false;
            }
            let state = md.lock_state.load(SeqCst);
            if state >= 0
                && md.lock_state.compare_exchange(state, state + 1, SeqCst, SeqCst).is_ok()
            {
                if md.is_deleted() {
                    // tombstoned between the check and the lock.
                    self.unlock(index);
                    return false;
                }
                return true;
            }
            self.spin_wait();
        }
    }

    pub(crate) fn acquire_write(&self, index: usize) -> bool {
        loop {
            let md = match self.metadata_at(index) {
                Some(md) => md,
                None => return false,
            };
            if md.is_deleted() {
                return false;
            }
            if md.lock_state.compare_exchange(0, WRITE_FLAG, SeqCst, SeqCst).is_ok() {
                if md.is_deleted() {
                    self.unlock(index);
                    return false;
                }
                return true;
            }
            self.spin_wait();
        }
    }

    // Add one more reader to an already reader-locked blob. Used by
    // handle clone, which must succeed even on a tombstoned blob.
    pub(crate) fn relock_read(&self, index: usize) {
        let md = match self.metadata_at(index) {
            Some(md) => md,
            None => panic!("relock of missing blob {}, call the programmer", index),
        };
        let old = md.lock_state.fetch_add(1, SeqCst);
        if old <= 0 {
            panic!("relock of unlocked blob {}, call the programmer", index);
        }
    }

    pub(crate) fn unlock(&self, index: usize) {
        let md = match self.metadata_at(index) {
            Some(md) => md,
            None => return,
        };
        loop {
            let state = md.lock_state.load(SeqCst);
            let new_state = cmp::max((state & !WRITE_FLAG) - 1, 0);
            if md.lock_state.compare_exchange(state, new_state, SeqCst, SeqCst).is_ok() {
                break;
            }
            self.spin_wait();
        }
        if md.is_tombstone() && md.lock_state.load(SeqCst) == 0 {
            self.finalize_remove(index);
        }
    }

    // Writer becomes the sole reader.
    pub(crate) fn downgrade_write(&self, index: usize) {
        let md = match self.metadata_at(index) {
            Some(md) => md,
            None => return,
        };
        loop {
            if md.lock_state.compare_exchange(WRITE_FLAG, 1, SeqCst, SeqCst).is_ok() {
                return;
            }
            self.spin_wait();
        }
    }

    // Sole reader becomes the writer. Spins until other readers of the
    // blob drain; callers only reach this through a handle they own.
    pub(crate) fn upgrade_read(&self, index: usize) {
        let md = match self.metadata_at(index) {
            Some(md) => md,
            None => return,
        };
        loop {
            if md.lock_state.compare_exchange(1, WRITE_FLAG, SeqCst, SeqCst).is_ok() {
                return;
            }
            self.spin_wait();
        }
    }

    fn spin_wait(&self) {
        if !self.spin {
            thread::yield_now();
        }
    }
}

/// Iterator over the live blob indexes of a store, ascending.
pub struct BlobIter<'a> {
    store: &'a BlobStore,
    index: usize,
}

impl<'a> Iterator for BlobIter<'a> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        loop {
            let index = self.index;
            let md = self.store.metadata_at(index)?;
            self.index += 1;
            if !md.is_deleted() {
                return Some(index);
            }
        }
    }
}

#[cfg(test)]
#[path = "blob_test.rs"]
mod blob_test;
