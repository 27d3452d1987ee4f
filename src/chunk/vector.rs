//! Append-only vector of fixed-size records over a chunk sequence.

use std::{
    marker::PhantomData,
    mem,
    sync::{
        atomic::{AtomicU64, Ordering::SeqCst},
        Arc,
    },
    thread,
};

use crate::{
    buffer::BufferFactory,
    chunk::{manager::HEADER_SIZE, ChunkManager},
    err_at, Error, Result,
};

/// ChunkedVector is an append-only, index-addressable vector of
/// fixed-size records, laid out over its own private [ChunkManager].
///
/// Chunk 0 of the sequence holds the manager's count word, then the
/// vector's element-count word, then elements; later chunks are all
/// elements. The element count is process-shared, so every participant
/// mapping the same buffers observes the same length.
///
/// `T` must be a plain shared-memory record: fixed size, alignment of
/// at most 8, and no drop glue. Elements are never dropped.
pub struct ChunkedVector<T> {
    chunks: ChunkManager,
    _marker: PhantomData<T>,
}

impl<T> ChunkedVector<T> {
    const ELEMENT_SIZE: usize = mem::size_of::<T>();

    /// Create a vector, or re-attach to an existing one with the same
    /// `name`. `chunk_size` is rounded up to a power of two and must
    /// leave room for at least one element in chunk 0.
    pub fn create(
        factory: Arc<dyn BufferFactory>,
        name: &str,
        chunk_size: usize,
        spin: bool,
    ) -> Result<ChunkedVector<T>> {
        assert!(mem::align_of::<T>() <= 8);
        let chunks = ChunkManager::create(factory, name, chunk_size, spin)?;
        if chunks.to_chunk_size() < HEADER_SIZE + Self::ELEMENT_SIZE {
            return err_at!(
                InvalidInput,
                msg: "chunk size {} too small for {} byte elements",
                chunks.to_chunk_size(), Self::ELEMENT_SIZE
            );
        }
        Ok(ChunkedVector { chunks, _marker: PhantomData })
    }

    /// Return number of elements in the vector.
    pub fn len(&self) -> usize {
        self.size_word().load(SeqCst) as usize
    }

    /// Return whether the vector is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Return the number of elements the loaded chunks can hold.
    pub fn capacity(&self) -> usize {
        (0..self.chunks.num_chunks()).map(|i| self.chunk_capacity(i)).sum()
    }

    /// Append `value`, returning its element index. The slot is
    /// published to concurrent readers once the write completes; until
    /// then readers of this index spin in [at][ChunkedVector::at].
    pub fn push(&self, value: T) -> Result<usize> {
        let index = self.size_word().fetch_add(1, SeqCst) as usize;
        let (chunk, offset) = self.locate(index);
        self.chunks.ensure_chunk(chunk)?;
        let ptr = match self.chunks.at_chunk(chunk, offset) {
            Some(ptr) => ptr as *mut T,
            None => panic!("chunk {} vanished while pushing, call the programmer", chunk),
        };
        unsafe { ptr.write(value) };
        Ok(index)
    }

    /// Remove the last element. Popping an empty vector is an error.
    pub fn pop(&self) -> Result<()> {
        loop {
            let size = self.size_word().load(SeqCst);
            if size == 0 {
                return err_at!(InvalidInput, msg: "pop on empty vector");
            }
            if self.size_word().compare_exchange(size, size - 1, SeqCst, SeqCst).is_ok() {
                return Ok(());
            }
        }
    }

    /// Return a pointer to element `index`, or `None` past the current
    /// length. May briefly spin while the local chunk list catches up
    /// with a concurrent push.
    pub fn at(&self, index: usize) -> Option<*mut T> {
        loop {
            if index >= self.len() {
                return None;
            }
            let (chunk, offset) = self.locate(index);
            match self.chunks.at_chunk(chunk, offset) {
                Some(ptr) => return Some(ptr as *mut T),
                // the pusher has bumped the size word but not yet
                // published the chunk.
                None => thread::yield_now(),
            }
        }
    }

    /// Eagerly materialize chunks for at least `n` elements.
    pub fn reserve(&self, n: usize) -> Result<()> {
        if n == 0 {
            return Ok(());
        }
        let (chunk, _) = self.locate(n - 1);
        self.chunks.ensure_chunk(chunk)?;
        Ok(())
    }

    /// Set the element count to `n`, growing chunks when extending.
    /// New slots expose whatever bytes the buffers already hold, which
    /// is all-zeroes for fresh chunks.
    pub fn resize(&self, n: usize) -> Result<()> {
        loop {
            let size = self.size_word().load(SeqCst);
            if (n as u64) > size {
                self.reserve(n)?;
            }
            if self.size_word().compare_exchange(size, n as u64, SeqCst, SeqCst).is_ok() {
                return Ok(());
            }
        }
    }

    /// Flush the backing chunk sequence.
    pub fn flush(&self) -> Result<()> {
        self.chunks.flush()
    }

    fn size_word(&self) -> &AtomicU64 {
        // element-count word lives at the start of chunk 0's usable
        // space, right after the manager's count word.
        match self.chunks.at_chunk(0, 0) {
            Some(ptr) => unsafe { &*(ptr as *const AtomicU64) },
            None => unreachable!(),
        }
    }

    // usable elements in chunk `i`; chunk 0 loses the size word.
    fn chunk_capacity(&self, chunk: usize) -> usize {
        let bytes = match chunk {
            0 => self.chunks.to_chunk_size() - HEADER_SIZE,
            i => self.chunks.to_chunk_size() << i,
        };
        bytes / Self::ELEMENT_SIZE
    }

    // map element index to (chunk, byte-offset-in-chunk).
    fn locate(&self, mut index: usize) -> (usize, usize) {
        let mut chunk = 0;
        loop {
            let cap = self.chunk_capacity(chunk);
            if index < cap {
                let shift = if chunk == 0 { HEADER_SIZE } else { 0 };
                return (chunk, shift + index * Self::ELEMENT_SIZE);
            }
            index -= cap;
            chunk += 1;
        }
    }
}

#[cfg(test)]
#[path = "vector_test.rs"]
mod vector_test;
