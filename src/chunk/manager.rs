//! Chunk sequences: doubling buffers behind one logical address space.

use log::debug;

use std::sync::{
    atomic::{AtomicU64, Ordering::SeqCst},
    Arc,
};

use crate::{
    buffer::{Buffer, BufferFactory},
    chunk::{chunk_of, encode_index, offset_of},
    config::MAX_CHUNKS,
    err_at,
    util::{next_power_of_two, Spinlock},
    Error, Result,
};

/// Size of the chunk-count word at the start of chunk 0.
pub const HEADER_SIZE: usize = 8;

/// ChunkManager maintains an ordered, lazily-loaded list of chunks and
/// translates encoded indexes into pointers.
///
/// Chunk `i` is named `<name>_<i>` and sized `chunk_size << i`. The
/// first [HEADER_SIZE] bytes of chunk 0 hold the shared chunk-count
/// word; offsets inside chunk 0 are transparently shifted past it. The
/// count word is split into two 32-bit halves, increments and
/// decrements, so that concurrent adders and removers compose; the
/// current count is `inc - dec`.
pub struct ChunkManager {
    name: String,
    chunk_size: usize,
    factory: Arc<dyn BufferFactory>,
    // chunk 0 is pinned here so the count word pointer stays valid.
    chunk0: Arc<dyn Buffer>,
    chunks: Spinlock<Vec<Arc<dyn Buffer>>>,
}

impl ChunkManager {
    /// Create a chunk sequence, or re-attach to an existing one with
    /// the same `name`. `chunk_size` is rounded up to a power of two.
    pub fn create(
        factory: Arc<dyn BufferFactory>,
        name: &str,
        chunk_size: usize,
        spin: bool,
    ) -> Result<ChunkManager> {
        let chunk_size = next_power_of_two(chunk_size);
        let chunk0 = factory.create(&format!("{}_0", name), chunk_size + HEADER_SIZE)?;

        let mgr = ChunkManager {
            name: name.to_string(),
            chunk_size,
            factory,
            chunks: Spinlock::new(vec![Arc::clone(&chunk0)], spin),
            chunk0,
        };

        // A fresh sequence has a zero count word; publish chunk 0.
        let w = mgr.count_word();
        w.compare_exchange(0, increment_count(0, 1), SeqCst, SeqCst).ok();

        let n = {
            let mut chunks = mgr.chunks.write();
            mgr.load_chunks_locked(&mut chunks)?
        };
        if n > 0 {
            debug!(target: "chunk", "{:?}, re-attached {} chunks", mgr.name, n + 1);
        }
        Ok(mgr)
    }

    /// Base chunk size of this sequence, in bytes.
    #[inline]
    pub fn to_chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Name prefix of this sequence.
    #[inline]
    pub fn to_name(&self) -> String {
        self.name.clone()
    }

    /// Current number of chunks, decoded from the shared count word.
    pub fn num_chunks(&self) -> usize {
        decode_count(self.count_word().load(SeqCst))
    }

    /// Sum of usable chunk sizes for the current chunk count.
    pub fn capacity(&self) -> usize {
        let n = self.num_chunks();
        (0..n).map(|i| self.chunk_size << i).sum()
    }

    /// Make sure chunk `chunk` exists, creating it and any chunks
    /// below it if necessary. Returns the chunk's start pointer, its
    /// usable size, and the number of chunks this call added to the
    /// shared count; at most one concurrent caller adds each chunk.
    pub fn ensure_chunk(&self, chunk: usize) -> Result<(*mut u8, usize, usize)> {
        loop {
            let encoded = self.count_word().load(SeqCst);
            let count = decode_count(encoded);
            if chunk < count {
                {
                    let chunks = self.chunks.read();
                    if chunk < chunks.len() {
                        return Ok((self.chunk_start(&chunks[chunk], chunk), self.chunk_size << chunk, 0));
                    }
                }
                // another participant published it; catch up locally.
                let mut chunks = self.chunks.write();
                self.load_chunks_locked(&mut chunks)?;
                continue;
            }
            if chunk >= MAX_CHUNKS {
                return err_at!(InvalidInput, msg: "chunk {} beyond {} chunks", chunk, MAX_CHUNKS);
            }
            let new_encoded = set_count(encoded, chunk + 1);
            if self.count_word().compare_exchange(encoded, new_encoded, SeqCst, SeqCst).is_ok() {
                let mut chunks = self.chunks.write();
                self.load_chunks_locked(&mut chunks)?;
                debug!(
                    target: "chunk",
                    "{:?}, grown to {} chunks, {} bytes", self.name, chunk + 1, self.capacity()
                );
                return Ok((
                    self.chunk_start(&chunks[chunk], chunk),
                    self.chunk_size << chunk,
                    chunk + 1 - count,
                ));
            }
        }
    }

    /// Remove the last chunk from the sequence. The backing buffer is
    /// detached locally; its file, if any, is left behind. A sequence
    /// never shrinks below one chunk.
    pub fn remove_chunk(&self) {
        loop {
            let encoded = self.count_word().load(SeqCst);
            let count = decode_count(encoded);
            if count <= 1 {
                return;
            }
            let new_encoded = decrement_count(encoded, 1);
            if self.count_word().compare_exchange(encoded, new_encoded, SeqCst, SeqCst).is_ok() {
                let mut chunks = self.chunks.write();
                while chunks.len() >= count {
                    chunks.pop();
                }
                return;
            }
        }
    }

    /// Resolve an encoded index to a pointer. Offsets in chunk 0 are
    /// shifted past the count word. Returns `None` when the chunk or
    /// the offset is out of range.
    pub fn at(&self, index: u64) -> Option<*mut u8> {
        let (chunk, offset) = (chunk_of(index), offset_of(index));
        loop {
            {
                let chunks = self.chunks.read();
                if chunk < chunks.len() {
                    let buf = &chunks[chunk];
                    let offset = if chunk == 0 { offset + HEADER_SIZE } else { offset };
                    if offset >= buf.len() {
                        return None;
                    }
                    return Some(unsafe { buf.as_ptr().add(offset) });
                }
            }
            if chunk >= self.num_chunks() {
                return None;
            }
            // chunk is published but not loaded locally yet.
            let mut chunks = self.chunks.write();
            if self.load_chunks_locked(&mut chunks).is_err() {
                return None;
            }
        }
    }

    /// Resolve (chunk, offset) to a pointer, same range rules as
    /// [at][ChunkManager::at].
    pub fn at_chunk(&self, chunk: usize, offset: usize) -> Option<*mut u8> {
        self.at(encode_index(chunk, offset))
    }

    /// Flush every loaded chunk to its backing medium.
    pub fn flush(&self) -> Result<()> {
        let chunks = self.chunks.read();
        for chunk in chunks.iter() {
            chunk.flush()?;
        }
        Ok(())
    }

    fn count_word(&self) -> &AtomicU64 {
        // the count word is the first 8 bytes of chunk 0, pinned by
        // self.chunk0 for the life of this manager.
        unsafe { &*(self.chunk0.as_ptr() as *const AtomicU64) }
    }

    fn chunk_start(&self, buf: &Arc<dyn Buffer>, chunk: usize) -> *mut u8 {
        let shift = if chunk == 0 { HEADER_SIZE } else { 0 };
        unsafe { buf.as_ptr().add(shift) }
    }

    fn load_chunks_locked(&self, chunks: &mut Vec<Arc<dyn Buffer>>) -> Result<usize> {
        let count = decode_count(self.count_word().load(SeqCst));
        let mut n_loaded = 0;
        while chunks.len() < count {
            let i = chunks.len();
            let name = format!("{}_{}", self.name, i);
            chunks.push(self.factory.create(&name, self.chunk_size << i)?);
            n_loaded += 1;
        }
        Ok(n_loaded)
    }
}

#[inline]
fn decode_count(encoded: u64) -> usize {
    ((encoded >> 32).wrapping_sub(encoded & 0xFFFFFFFF)) as usize
}

#[inline]
fn increment_count(encoded: u64, value: u64) -> u64 {
    (encoded.wrapping_add(value << 32) & 0xFFFFFFFF00000000) | (encoded & 0xFFFFFFFF)
}

#[inline]
fn decrement_count(encoded: u64, value: u64) -> u64 {
    (encoded & 0xFFFFFFFF00000000) | (encoded.wrapping_add(value) & 0xFFFFFFFF)
}

fn set_count(encoded: u64, count: usize) -> u64 {
    let current = decode_count(encoded);
    if current > count {
        decrement_count(encoded, (current - count) as u64)
    } else if current < count {
        increment_count(encoded, (count - current) as u64)
    } else {
        encoded
    }
}

#[cfg(test)]
#[path = "manager_test.rs"]
mod manager_test;
