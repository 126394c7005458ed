use std::cell::RefCell;
use std::marker::PhantomData;
use std::rc::{Rc, Weak};
use std::sync::Arc;

use snafu::ensure;

use crate::allocator::{Allocator, MemoryOptions, RawMemory};
use crate::error::{InvalidViewSnafu, MemoryReleasedSnafu, Result, SizeMismatchSnafu};

/// Allocation shared by every view into it; returned to the allocator on drop.
#[derive(Debug)]
struct MemoryData {
    raw: RawMemory,
    allocator: Arc<dyn Allocator>,
}

impl MemoryData {
    fn raw(&self) -> &RawMemory {
        &self.raw
    }
}

impl Drop for MemoryData {
    fn drop(&mut self) {
        let raw = std::mem::replace(&mut self.raw, RawMemory::Host { data: RefCell::new(Box::default()) });
        self.allocator.free(raw);
    }
}

/// Handle to a region of device memory, possibly a view into a larger allocation.
///
/// This type is `!Send + !Sync`: memory is bound and dispatched from a single thread.
#[derive(Debug, Clone)]
pub struct DeviceMemory {
    data: Rc<MemoryData>,
    /// Offset into the base allocation (in bytes).
    offset: usize,
    /// Size of this view (in bytes).
    size: usize,
    _not_send_sync: PhantomData<Rc<()>>,
}

impl DeviceMemory {
    /// Allocate `size` bytes from `allocator`.
    pub fn allocate(allocator: Arc<dyn Allocator>, size: usize, options: MemoryOptions) -> Result<Self> {
        let raw = allocator.alloc(size, &options)?;
        let data = Rc::new(MemoryData { raw, allocator });
        Ok(Self { data, offset: 0, size, _not_send_sync: PhantomData })
    }

    /// Create a view into this memory.
    pub fn view(&self, offset: usize, size: usize) -> Result<Self> {
        ensure!(offset + size <= self.size, InvalidViewSnafu { offset, size, memory_size: self.size });

        Ok(Self { data: Rc::clone(&self.data), offset: self.offset + offset, size, _not_send_sync: PhantomData })
    }

    /// Get the size of this view in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Get the offset of this view in bytes.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Get the allocator backing this memory.
    pub fn allocator(&self) -> &dyn Allocator {
        &*self.data.allocator
    }

    /// Whether two handles refer to the same allocation.
    pub fn same_allocation(&self, other: &DeviceMemory) -> bool {
        Rc::ptr_eq(&self.data, &other.data)
    }

    /// A handle that does not keep the allocation alive.
    pub fn downgrade(&self) -> WeakDeviceMemory {
        WeakDeviceMemory { data: Rc::downgrade(&self.data), offset: self.offset, size: self.size }
    }

    /// Copy data from host memory into this region.
    pub fn copyin(&self, src: &[u8]) -> Result<()> {
        let expected = self.size;
        let actual = src.len();
        ensure!(expected == actual, SizeMismatchSnafu { expected, actual });

        match self.data.raw() {
            RawMemory::Host { data } => {
                data.borrow_mut()[self.offset..self.offset + self.size].copy_from_slice(src);
                Ok(())
            }
        }
    }

    /// Copy data from this region to host memory.
    pub fn copyout(&self, dst: &mut [u8]) -> Result<()> {
        let expected = self.size;
        let actual = dst.len();
        ensure!(expected == actual, SizeMismatchSnafu { expected, actual });

        match self.data.raw() {
            RawMemory::Host { data } => {
                dst.copy_from_slice(&data.borrow()[self.offset..self.offset + self.size]);
                Ok(())
            }
        }
    }

    /// Run `f` over the bytes of this region.
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        match self.data.raw() {
            RawMemory::Host { data } => f(&data.borrow()[self.offset..self.offset + self.size]),
        }
    }

    /// Run `f` over the bytes of this region, mutably.
    pub fn with_bytes_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        match self.data.raw() {
            RawMemory::Host { data } => f(&mut data.borrow_mut()[self.offset..self.offset + self.size]),
        }
    }
}

/// Non-owning handle obtained from [`DeviceMemory::downgrade`].
#[derive(Debug, Clone)]
pub struct WeakDeviceMemory {
    data: Weak<MemoryData>,
    offset: usize,
    size: usize,
}

impl WeakDeviceMemory {
    /// Reacquire the memory, failing if its owner already released it.
    pub fn upgrade(&self) -> Result<DeviceMemory> {
        let data = self.data.upgrade().ok_or_else(|| MemoryReleasedSnafu.build())?;
        Ok(DeviceMemory { data, offset: self.offset, size: self.size, _not_send_sync: PhantomData })
    }

    pub fn size(&self) -> usize {
        self.size
    }
}
