//! The allocator proper: free-list search, allocate, deallocate,
//! chunk growth.

use log::{debug, error, info};

use std::{
    collections::HashSet,
    ptr,
    sync::atomic::{AtomicU32, AtomicU64, Ordering::SeqCst},
    thread,
};

use crate::{
    alloc::{
        is_marked, marked,
        node::{Node, NODE_SIZE},
        unmarked,
    },
    chunk::{encode_index, ChunkManager, INVALID_INDEX},
    err_at,
    util::align8,
    Error, Result,
};

/// Magic number identifying an initialized allocator state header.
pub const MAGIC: u32 = 0x12345678;

// Allocator state, at offset 8 of chunk 0 (right after the chunk-count
// word). Field order is part of the on-disk format.
#[repr(C)]
struct StateHeader {
    magic: AtomicU32,
    free_list_head: AtomicU64,
    num_chunks: AtomicU64,
}

const STATE_SIZE: usize = std::mem::size_of::<StateHeader>();

/// Lock-free variable-size allocator over a [ChunkManager].
///
/// Every returned region is preceded by a [Node] header whose version
/// is odd while allocated. There is no out-of-memory condition short
/// of the backing factory failing or the chunk ceiling: an allocation
/// larger than any free node grows the chunk sequence and retries.
pub struct ShmAllocator {
    chunks: ChunkManager,
}

impl ShmAllocator {
    /// Take ownership of a chunk sequence and initialize the allocator
    /// state in it, unless a previous participant already has.
    pub fn create(chunks: ChunkManager) -> Result<ShmAllocator> {
        if chunks.to_chunk_size() < STATE_SIZE + NODE_SIZE + 8 {
            return err_at!(
                InvalidInput,
                msg: "chunk size {} below allocator minimum", chunks.to_chunk_size()
            );
        }
        let allocator = ShmAllocator { chunks };
        allocator.initialize_state()?;
        Ok(allocator)
    }

    /// Allocate at least `bytes` of payload. Returns `None` only when
    /// the backing factory fails to grow the mapping.
    pub fn allocate(&self, bytes: usize) -> Option<*mut u8> {
        let bytes_needed = align8(NODE_SIZE + bytes);

        loop {
            if let Some(node) = self.allocate_from_free_list(bytes_needed) {
                let total = node.size.load(SeqCst) as usize;
                if total >= bytes_needed + NODE_SIZE + 8 {
                    self.split_node(node, bytes_needed, total);
                }
                let ptr = match self.chunks.at(node.index) {
                    Some(ptr) => ptr,
                    None => panic!("allocated node {:x} unmapped, call the programmer", node.index),
                };
                return Some(unsafe { ptr.add(NODE_SIZE) });
            }
            // no free node is big enough; grow by one chunk and retry.
            if let Err(err) = self.grow() {
                error!(target: "alloc", "{:?}, cannot grow: {}", self.chunks.to_name(), err);
                return None;
            }
        }
    }

    /// Release the allocation at `ptr`. Returns false when `ptr` is
    /// null or does not point at a live allocation; calling this twice
    /// on the same pointer is safe.
    pub fn deallocate(&self, ptr: *mut u8) -> bool {
        if ptr.is_null() {
            return false;
        }
        let node = unsafe { &*(ptr.sub(NODE_SIZE) as *const Node) };
        if !node.is_allocated() {
            return false;
        }
        self.deallocate_node(node)
    }

    /// Release the allocation whose payload lives at encoded `index`.
    pub fn deallocate_at(&self, index: u64) -> bool {
        match self.to_ptr(index) {
            Some(ptr) => self.deallocate(ptr),
            None => false,
        }
    }

    /// Payload capacity, in bytes, of the allocation at `ptr`.
    pub fn capacity_of(&self, ptr: *const u8) -> usize {
        if ptr.is_null() {
            return 0;
        }
        let node = unsafe { &*(ptr.sub(NODE_SIZE) as *const Node) };
        node.size.load(SeqCst) as usize - NODE_SIZE
    }

    /// Payload capacity, in bytes, of the allocation at encoded
    /// payload index.
    pub fn capacity_at(&self, index: u64) -> usize {
        match self.to_ptr(index) {
            Some(ptr) => self.capacity_of(ptr),
            None => 0,
        }
    }

    /// Encoded index of the payload at `ptr`.
    pub fn to_index(&self, ptr: *const u8) -> u64 {
        let node = unsafe { &*(ptr.sub(NODE_SIZE) as *const Node) };
        node.index + NODE_SIZE as u64
    }

    /// Pointer for an encoded payload index.
    pub fn to_ptr(&self, index: u64) -> Option<*mut u8> {
        if index == INVALID_INDEX {
            return None;
        }
        self.chunks.at(index)
    }

    /// Flush the backing chunk sequence.
    pub fn flush(&self) -> Result<()> {
        self.chunks.flush()
    }

    /// Total usable bytes across the current chunk count.
    pub fn capacity(&self) -> usize {
        self.chunks.capacity()
    }

    /// Walk the free list checking its invariants: strictly increasing
    /// `(size, index)` pairs, no cycles, even version on every
    /// unmarked node. Returns free-list statistics.
    pub fn validate(&self) -> Result<Stats> {
        let mut visited: HashSet<u64> = HashSet::new();
        let mut last_key: Option<(u64, u64)> = None;
        let mut stats = Stats::default();

        let mut next = self.state().free_list_head.load(SeqCst);
        while let Some(node) = self.node_at(unmarked(next)) {
            if !visited.insert(node.index) {
                return err_at!(Fatal, msg: "free list cycle at {:x}", node.index);
            }
            let node_next = node.next_index.load(SeqCst);
            if is_marked(node_next) {
                stats.n_marked += 1;
            } else {
                if node.is_allocated() {
                    return err_at!(Fatal, msg: "allocated node {:x} on free list", node.index);
                }
                let key = (node.size.load(SeqCst), node.index);
                if let Some(last) = last_key {
                    if last >= key {
                        return err_at!(Fatal, msg: "free list disorder at {:x}", node.index);
                    }
                }
                last_key = Some(key);
                stats.n_free += 1;
                stats.free_bytes += key.0 as usize;
            }
            next = node_next;
        }
        Ok(stats)
    }

    fn state(&self) -> &StateHeader {
        match self.chunks.at_chunk(0, 0) {
            Some(ptr) => unsafe { &*(ptr as *const StateHeader) },
            None => unreachable!(),
        }
    }

    fn node_at(&self, index: u64) -> Option<&Node> {
        if index == INVALID_INDEX {
            return None;
        }
        let ptr = self.chunks.at(index)?;
        Some(unsafe { &*(ptr as *const Node) })
    }

    fn initialize_state(&self) -> Result<()> {
        let state = self.state();
        loop {
            match state.magic.load(SeqCst) {
                MAGIC => {
                    // wait for the initializing participant to finish.
                    if state.num_chunks.load(SeqCst) == 0 {
                        thread::yield_now();
                        continue;
                    }
                    info!(
                        target: "alloc",
                        "{:?}, attached, {} chunks", self.chunks.to_name(),
                        state.num_chunks.load(SeqCst)
                    );
                    return Ok(());
                }
                0 if state.magic.compare_exchange(0, MAGIC, SeqCst, SeqCst).is_ok() => {
                    state.free_list_head.store(INVALID_INDEX, SeqCst);
                    let chunk_size = self.chunks.to_chunk_size();
                    let ptr = match self.chunks.at_chunk(0, STATE_SIZE) {
                        Some(ptr) => ptr,
                        None => unreachable!(),
                    };
                    let node = unsafe {
                        self.new_node(ptr, encode_index(0, STATE_SIZE), chunk_size - STATE_SIZE)
                    };
                    self.deallocate_node(node);
                    state.num_chunks.store(1, SeqCst);
                    info!(
                        target: "alloc",
                        "{:?}, initialized, {} free bytes", self.chunks.to_name(),
                        chunk_size - STATE_SIZE - NODE_SIZE
                    );
                    return Ok(());
                }
                0 => (),
                magic => return err_at!(InvalidFile, msg: "bad allocator magic {:x}", magic),
            }
        }
    }

    // Carve a fresh node at `ptr`. The node starts odd (allocated) so
    // that deallocate_node can insert it.
    unsafe fn new_node(&self, ptr: *mut u8, index: u64, size: usize) -> &Node {
        let node = ptr as *mut Node;
        ptr::write(
            node,
            Node {
                version: AtomicU64::new(1),
                index,
                size: AtomicU64::new(size as u64),
                next_index: AtomicU64::new(INVALID_INDEX),
            },
        );
        &*node
    }

    // Find, logically delete and unlink a free node of at least
    // `bytes_needed` total bytes. Returns the node with its version
    // bumped to odd, or None when no free node is big enough.
    fn allocate_from_free_list(&self, bytes_needed: usize) -> Option<&Node> {
        loop {
            let (left, right) = self.search(bytes_needed as u64, 0);
            let right = right?;

            let right_next = right.next_index.load(SeqCst);
            if is_marked(right_next) {
                continue;
            }
            // logically delete `right`.
            if right
                .next_index
                .compare_exchange(right_next, marked(right_next), SeqCst, SeqCst)
                .is_err()
            {
                continue;
            }
            // physically unlink; a failure here leaves the marked node
            // for a later search to clean out.
            let unlink = match left {
                Some(left) => left
                    .next_index
                    .compare_exchange(right.index, unmarked(right_next), SeqCst, SeqCst)
                    .is_ok(),
                None => self
                    .state()
                    .free_list_head
                    .compare_exchange(right.index, unmarked(right_next), SeqCst, SeqCst)
                    .is_ok(),
            };
            if !unlink {
                self.search(right.size.load(SeqCst), right.index);
            }
            right.version.fetch_add(1, SeqCst);
            return Some(right);
        }
    }

    // In-place split: keep `bytes_needed` bytes in `node`, carve the
    // remainder into a fresh free node right behind it.
    fn split_node(&self, node: &Node, bytes_needed: usize, total: usize) {
        let node_ptr = match self.chunks.at(node.index) {
            Some(ptr) => ptr,
            None => panic!("split of unmapped node {:x}, call the programmer", node.index),
        };
        let remainder = total - bytes_needed;
        let rest = unsafe {
            self.new_node(
                node_ptr.add(bytes_needed),
                node.index + bytes_needed as u64,
                remainder,
            )
        };
        self.deallocate_node(rest);
        node.size.store(bytes_needed as u64, SeqCst);
    }

    // Insert a node into the free list at its sorted position,
    // flipping its version to even. Inserting a node that is already
    // reachable is a no-op.
    fn deallocate_node(&self, node: &Node) -> bool {
        node.version.fetch_add(1, SeqCst);

        let (size, index) = (node.size.load(SeqCst), node.index);
        loop {
            let (left, right) = self.search(size, index);
            if let Some(right) = right {
                if right.index == index {
                    // already on the list; just clear our mark.
                    node.next_index.store(unmarked(node.next_index.load(SeqCst)), SeqCst);
                    return true;
                }
            }
            let right_index = right.map(|r| r.index).unwrap_or(INVALID_INDEX);
            node.next_index.store(right_index, SeqCst);
            let done = match left {
                Some(left) => left
                    .next_index
                    .compare_exchange(right_index, index, SeqCst, SeqCst)
                    .is_ok(),
                None => self
                    .state()
                    .free_list_head
                    .compare_exchange(right_index, index, SeqCst, SeqCst)
                    .is_ok(),
            };
            if done {
                return true;
            }
        }
    }

    // Harris search. Returns `(left, right)` where `right` is the
    // first unmarked node with `(size, index)` key at or above the
    // wanted key and `left` its last unmarked predecessor; `None`
    // stands for the list head / list end. Marked chains encountered
    // between the two are unlinked on the way.
    fn search(&self, size: u64, index: u64) -> (Option<&Node>, Option<&Node>) {
        'search: loop {
            let mut left: Option<&Node> = None;
            let mut left_next: u64 = self.state().free_list_head.load(SeqCst);

            let mut current: Option<&Node> = None;
            let mut current_next = left_next;
            // find left and right.
            let right = loop {
                if !is_marked(current_next) {
                    left = current;
                    left_next = current_next;
                }
                current = match self.node_at(unmarked(current_next)) {
                    Some(node) => Some(node),
                    None => break None,
                };
                let node = current.unwrap();
                current_next = node.next_index.load(SeqCst);
                if !is_marked(current_next)
                    && (node.size.load(SeqCst), node.index) >= (size, index)
                {
                    break current;
                }
            };
            let right_index = right.map(|r| r.index).unwrap_or(INVALID_INDEX);

            // adjacent: nothing to clean between left and right.
            if left_next == right_index {
                match right {
                    Some(r) if is_marked(r.next_index.load(SeqCst)) => continue 'search,
                    _ => return (left, right),
                }
            }
            // unlink the marked chain between left and right.
            let cleaned = match left {
                Some(left) => left
                    .next_index
                    .compare_exchange(left_next, right_index, SeqCst, SeqCst)
                    .is_ok(),
                None => self
                    .state()
                    .free_list_head
                    .compare_exchange(left_next, right_index, SeqCst, SeqCst)
                    .is_ok(),
            };
            if cleaned {
                match right {
                    Some(r) if is_marked(r.next_index.load(SeqCst)) => continue 'search,
                    _ => return (left, right),
                }
            }
        }
    }

    fn grow(&self) -> Result<()> {
        let state = self.state();
        let k = state.num_chunks.load(SeqCst) as usize;
        let (ptr, size, added) = self.chunks.ensure_chunk(k)?;
        if added > 0 {
            let node = unsafe { self.new_node(ptr, encode_index(k, 0), size) };
            self.deallocate_node(node);
            if state.num_chunks.compare_exchange(k as u64, (k + 1) as u64, SeqCst, SeqCst).is_err()
            {
                panic!("chunk {} grown twice, call the programmer", k);
            }
            debug!(
                target: "alloc",
                "{:?}, grown to chunk {}, {} bytes", self.chunks.to_name(), k, size
            );
        }
        Ok(())
    }
}

/// Free-list statistics, returned by [ShmAllocator::validate].
#[derive(Default, Debug)]
pub struct Stats {
    /// Number of unmarked nodes on the free list.
    pub n_free: usize,
    /// Number of logically deleted nodes still reachable.
    pub n_marked: usize,
    /// Total bytes held by unmarked free nodes, headers included.
    pub free_bytes: usize,
}

#[cfg(test)]
#[path = "shm_test.rs"]
mod shm_test;
