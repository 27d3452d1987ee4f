//! Heap-backed buffers, registered by name in a process-wide table.

use lazy_static::lazy_static;

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use crate::{buffer::Buffer, buffer::BufferFactory, err_at, Error, Result};

lazy_static! {
    static ref REGISTRY: Mutex<HashMap<String, Arc<HeapBuffer>>> = Mutex::new(HashMap::new());
}

/// A zero-filled heap block. Two `create` calls with the same name
/// return the same block, mimicking shared-memory attach semantics
/// without touching the file system.
pub struct HeapBuffer {
    name: String,
    size: usize,
    // u64 backing keeps the block 8-byte aligned for the atomics that
    // live inside chunks.
    block: Vec<u64>,
}

unsafe impl Send for HeapBuffer {}
unsafe impl Sync for HeapBuffer {}

impl HeapBuffer {
    fn new(name: &str, size: usize) -> HeapBuffer {
        let words = (size + 7) / 8;
        HeapBuffer {
            name: name.to_string(),
            size: words * 8,
            block: vec![0_u64; words],
        }
    }
}

impl Buffer for HeapBuffer {
    fn to_name(&self) -> String {
        self.name.clone()
    }

    fn len(&self) -> usize {
        self.size
    }

    fn as_ptr(&self) -> *mut u8 {
        self.block.as_ptr() as *mut u8
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Factory creating [HeapBuffer] values, for tests and for single
/// process stores that don't need persistence.
#[derive(Default)]
pub struct HeapFactory;

impl HeapFactory {
    pub fn new() -> HeapFactory {
        HeapFactory
    }

    /// Forget all registered buffers whose name starts with `prefix`.
    pub fn unlink(prefix: &str) {
        let mut registry = REGISTRY.lock().unwrap();
        registry.retain(|name, _| !name.starts_with(prefix));
    }
}

impl BufferFactory for HeapFactory {
    fn create(&self, name: &str, size: usize) -> Result<Arc<dyn Buffer>> {
        let mut registry = REGISTRY.lock().unwrap();
        match registry.get(name) {
            Some(buf) if buf.len() >= size => Ok(Arc::clone(buf) as Arc<dyn Buffer>),
            Some(buf) => err_at!(
                InvalidInput,
                msg: "buffer {} exists with {} bytes, {} requested", name, buf.len(), size
            ),
            None => {
                let buf = Arc::new(HeapBuffer::new(name, size));
                registry.insert(name.to_string(), Arc::clone(&buf));
                Ok(buf as Arc<dyn Buffer>)
            }
        }
    }
}

#[cfg(test)]
#[path = "heap_test.rs"]
mod heap_test;
