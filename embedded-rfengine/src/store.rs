//! Object-store and platform collaborators.
//!
//! The engine never touches a filesystem directly; everything goes through
//! [`ObjectStore`] (open/read/write/seek/rename/remove/exists/size plus a
//! free-space probe) and [`HeapMonitor`] (the scratch-allocator headroom
//! probe behind the pre-flight checks). [`DirStore`] is the host-side
//! implementation: a flat directory with configurable storage and heap
//! budgets so tests can drive the pre-flight failures.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Existing object, read only.
    Read,
    /// Create or truncate, write only.
    Write,
    /// Create if missing, read and write in place.
    ReadWrite,
}

pub trait Object: io::Read + io::Write + io::Seek {}
impl<T: io::Read + io::Write + io::Seek> Object for T {}

pub trait ObjectStore {
    type Handle: Object;

    fn open(&mut self, path: &str, mode: OpenMode) -> Result<Self::Handle>;
    fn exists(&self, path: &str) -> bool;
    fn size(&self, path: &str) -> Result<u64>;
    fn remove(&mut self, path: &str) -> Result<()>;
    fn rename(&mut self, from: &str, to: &str) -> Result<()>;
    /// Bytes still available for new objects.
    fn free_space(&self) -> u64;
}

/// Scratch-allocator probe used by the load and per-node pre-flight checks.
pub trait HeapMonitor {
    fn free_heap(&self) -> usize;
}

/// Heap headroom required below a forest/tree load on top of the estimated
/// model footprint.
pub const LOAD_HEAP_HEADROOM: usize = 8000;
/// Heap headroom required while the tree builder appends nodes.
pub const NODE_HEAP_HEADROOM: usize = 5000;
/// Storage slack required beyond the serialized node payload.
pub const RELEASE_STORAGE_SLACK: u64 = 100;

/// Directory-rooted store. Engine paths are absolute ("/model_suffix") and
/// flat; they map to entries directly under the root.
#[derive(Debug)]
pub struct DirStore {
    root: PathBuf,
    capacity: u64,
    free_heap: usize,
}

impl DirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        DirStore {
            root: root.into(),
            capacity: 8 * 1024 * 1024,
            free_heap: 512 * 1024,
        }
    }

    /// Storage budget in bytes; `free_space` reports this minus usage.
    pub fn with_capacity(mut self, capacity: u64) -> Self {
        self.capacity = capacity;
        self
    }

    /// Heap headroom reported to the pre-flight checks.
    pub fn with_free_heap(mut self, free_heap: usize) -> Self {
        self.free_heap = free_heap;
        self
    }

    pub fn set_free_heap(&mut self, free_heap: usize) {
        self.free_heap = free_heap;
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }

    fn used_bytes(&self) -> u64 {
        let Ok(entries) = fs::read_dir(&self.root) else {
            return 0;
        };
        entries
            .flatten()
            .filter_map(|e| e.metadata().ok())
            .filter(|m| m.is_file())
            .map(|m| m.len())
            .sum()
    }
}

impl ObjectStore for DirStore {
    type Handle = fs::File;

    fn open(&mut self, path: &str, mode: OpenMode) -> Result<fs::File> {
        let full = self.resolve(path);
        let file = match mode {
            OpenMode::Read => fs::File::open(&full)?,
            OpenMode::Write => fs::File::create(&full)?,
            OpenMode::ReadWrite => fs::OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&full)?,
        };
        Ok(file)
    }

    fn exists(&self, path: &str) -> bool {
        self.resolve(path).is_file()
    }

    fn size(&self, path: &str) -> Result<u64> {
        Ok(fs::metadata(self.resolve(path))?.len())
    }

    fn remove(&mut self, path: &str) -> Result<()> {
        fs::remove_file(self.resolve(path))?;
        Ok(())
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<()> {
        fs::rename(self.resolve(from), self.resolve(to))?;
        Ok(())
    }

    fn free_space(&self) -> u64 {
        self.capacity.saturating_sub(self.used_bytes())
    }
}

impl HeapMonitor for DirStore {
    fn free_heap(&self) -> usize {
        self.free_heap
    }
}

/// Read the whole object behind `path`, mapping a short read to `Truncated`.
pub fn read_all<S: ObjectStore>(store: &mut S, path: &str) -> Result<Vec<u8>> {
    use std::io::Read;
    let mut handle = store.open(path, OpenMode::Read)?;
    let mut bytes = Vec::new();
    handle.read_to_end(&mut bytes)?;
    Ok(bytes)
}

/// Map an exact-read failure to the engine's `Truncated` kind.
pub fn read_exact_or_truncated<R: io::Read>(reader: &mut R, buf: &mut [u8]) -> Result<()> {
    reader.read_exact(buf).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            Error::Truncated
        } else {
            Error::Io(e)
        }
    })
}
