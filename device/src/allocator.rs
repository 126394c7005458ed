use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use snafu::ensure;
use tracing::debug;

use crate::error::{AllocationSnafu, Result};

/// Opaque handle to device memory.
///
/// Uses `RefCell` for interior mutability with runtime borrow checking.
/// Safe for single-threaded use (memory handles are !Send + !Sync).
#[derive(Debug)]
pub enum RawMemory {
    Host { data: RefCell<Box<[u8]>> },
}

impl RawMemory {
    /// Get the size of the allocation in bytes.
    pub fn size(&self) -> usize {
        match self {
            RawMemory::Host { data } => data.borrow().len(),
        }
    }
}

/// Options for memory allocation.
#[derive(Debug, Clone, Default)]
pub struct MemoryOptions {
    /// Whether to zero-initialize the memory.
    pub zero_init: bool,
}

pub trait Allocator: Send + Sync + std::fmt::Debug {
    fn alloc(&self, size: usize, options: &MemoryOptions) -> Result<RawMemory>;
    fn free(&self, _memory: RawMemory) {}
    fn synchronize(&self) -> Result<()> {
        Ok(())
    }
    fn name(&self) -> &str;
}

/// Allocator backed by host memory, used by the reference device.
///
/// An optional capacity emulates a device running out of memory.
#[derive(Debug, Default)]
pub struct HostAllocator {
    capacity: Option<usize>,
    in_use: AtomicUsize,
}

impl HostAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self { capacity: Some(capacity), in_use: AtomicUsize::new(0) }
    }

    /// Bytes currently handed out.
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }
}

impl Allocator for HostAllocator {
    fn alloc(&self, size: usize, _options: &MemoryOptions) -> Result<RawMemory> {
        if let Some(capacity) = self.capacity {
            let in_use = self.in_use.load(Ordering::Relaxed);
            ensure!(
                in_use + size <= capacity,
                AllocationSnafu { size, reason: format!("{in_use} of {capacity} bytes already in use") }
            );
        }
        self.in_use.fetch_add(size, Ordering::Relaxed);

        // Host memory is always zeroed; the option only matters for recycled blocks.
        let data = vec![0u8; size].into_boxed_slice();
        Ok(RawMemory::Host { data: RefCell::new(data) })
    }

    fn free(&self, memory: RawMemory) {
        self.in_use.fetch_sub(memory.size(), Ordering::Relaxed);
    }

    fn name(&self) -> &str {
        "HOST"
    }
}

/// Cache key for memory reuse in LRU allocator.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
struct CacheKey {
    size: usize,
}

/// LRU allocator that caches freed blocks for reuse.
#[derive(Debug)]
pub struct LruAllocator {
    inner: Box<dyn Allocator>,
    cache: Mutex<HashMap<CacheKey, Vec<RawMemory>>>,
    max_blocks_per_size: usize,
    name: String,
}

impl LruAllocator {
    pub fn new(inner: Box<dyn Allocator>) -> Self {
        Self::with_capacity(inner, 32)
    }

    pub fn with_capacity(inner: Box<dyn Allocator>, max_blocks_per_size: usize) -> Self {
        let name = inner.name().to_string();
        Self { inner, cache: Mutex::new(HashMap::new()), max_blocks_per_size, name }
    }

    fn take_cached(&self, size: usize) -> Option<RawMemory> {
        let key = CacheKey { size };
        let mut cache = self.cache.lock();
        let blocks = cache.get_mut(&key)?;
        let block = blocks.pop();
        if blocks.is_empty() {
            cache.remove(&key);
        }
        block
    }

    /// Return every cached block to the inner allocator.
    pub fn release_cached(&self) {
        let drained = std::mem::take(&mut *self.cache.lock());
        for memory in drained.into_values().flatten() {
            self.inner.free(memory);
        }
    }
}

impl Allocator for LruAllocator {
    fn alloc(&self, size: usize, options: &MemoryOptions) -> Result<RawMemory> {
        if let Some(memory) = self.take_cached(size) {
            if options.zero_init {
                let RawMemory::Host { data } = &memory;
                data.borrow_mut().fill(0);
            }
            return Ok(memory);
        }

        // Cached blocks stay cached on failure; callers evict with `release_cached`.
        self.inner.alloc(size, options).inspect_err(|_| {
            debug!(size, allocator = %self.name, "allocation failed");
        })
    }

    fn free(&self, memory: RawMemory) {
        let key = CacheKey { size: memory.size() };

        let mut cache = self.cache.lock();
        let blocks = cache.entry(key).or_default();
        if blocks.len() < self.max_blocks_per_size {
            blocks.push(memory);
        } else {
            drop(cache);
            self.inner.free(memory);
        }
    }

    fn synchronize(&self) -> Result<()> {
        self.inner.synchronize()
    }

    fn name(&self) -> &str {
        &self.name
    }
}
