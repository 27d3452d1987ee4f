//! Memory-mapped file buffers.

use fs2::FileExt;
use log::debug;
use memmap2::MmapMut;

use std::{convert::TryFrom, fs, path, sync::Arc};

use crate::{buffer::Buffer, buffer::BufferFactory, err_at, Error, Result};

/// A buffer backed by one file on disk, mapped read-write.
///
/// Opening an existing file adopts `max(file size, requested size)`,
/// so re-attaching to a grown store picks up its full extent. Newly
/// grown bytes are zero-filled by the file system.
pub struct MmapBuffer {
    name: String,
    size: usize,
    ptr: *mut u8,

    _file: fs::File,
    map: MmapMut,
}

// The mapping is shared mutable memory. All mutation above this layer
// goes through atomics or per-blob locks.
unsafe impl Send for MmapBuffer {}
unsafe impl Sync for MmapBuffer {}

impl MmapBuffer {
    fn open(file_path: &path::Path, name: &str, size: usize) -> Result<MmapBuffer> {
        let file = {
            let mut opts = fs::OpenOptions::new();
            err_at!(
                IOError,
                opts.read(true).write(true).create(true).open(file_path),
                "open {:?}",
                file_path
            )?
        };

        let file_size = err_at!(IOError, file.metadata())?.len();
        let size = {
            let file_size = err_at!(FailConvert, usize::try_from(file_size))?;
            usize::max(size, file_size)
        };
        if file_size < size as u64 {
            err_at!(IOError, file.allocate(size as u64), "allocate {:?}", file_path)?;
            err_at!(IOError, file.set_len(size as u64), "set_len {:?}", file_path)?;
        }

        let mut map = err_at!(IOError, unsafe { MmapMut::map_mut(&file) })?;
        let ptr = map.as_mut_ptr();

        debug!(target: "buffer", "mapped {:?}, {} bytes", file_path, size);

        Ok(MmapBuffer {
            name: name.to_string(),
            size,
            ptr,
            _file: file,
            map,
        })
    }
}

impl Buffer for MmapBuffer {
    fn to_name(&self) -> String {
        self.name.clone()
    }

    fn len(&self) -> usize {
        self.size
    }

    fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    fn flush(&self) -> Result<()> {
        err_at!(IOError, self.map.flush())
    }
}

/// Factory creating [MmapBuffer] values, one file per buffer, under a
/// common directory.
pub struct MmapFactory {
    dir: path::PathBuf,
}

impl MmapFactory {
    /// Buffers shall be created as `<dir>/<name>` files. The directory
    /// is created if missing.
    pub fn new(dir: &path::Path) -> Result<MmapFactory> {
        err_at!(IOError, fs::create_dir_all(dir), "create dir {:?}", dir)?;
        Ok(MmapFactory { dir: dir.to_path_buf() })
    }

    /// Remove all buffer files whose name starts with `prefix`. Useful
    /// to clear a store's chunk sequences between test runs.
    pub fn unlink(&self, prefix: &str) -> Result<()> {
        let entries = err_at!(IOError, fs::read_dir(&self.dir))?;
        for entry in entries {
            let entry = err_at!(IOError, entry)?;
            match entry.file_name().to_str() {
                Some(name) if name.starts_with(prefix) => {
                    fs::remove_file(entry.path()).ok();
                }
                _ => (),
            }
        }
        Ok(())
    }
}

impl BufferFactory for MmapFactory {
    fn create(&self, name: &str, size: usize) -> Result<Arc<dyn Buffer>> {
        let file_path: path::PathBuf = [self.dir.as_os_str(), name.as_ref()].iter().collect();
        Ok(Arc::new(MmapBuffer::open(&file_path, name, size)?))
    }
}

#[cfg(test)]
#[path = "mmap_test.rs"]
mod mmap_test;
