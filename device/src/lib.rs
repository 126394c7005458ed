//! Device-side model for kiln: what an accelerator can do, how tensors are laid out in its memory,
//! and the memory handles that back them.
//!
//! - [`GpuInfo`]: read-only capability description (vendor, work-group and image limits, storage types)
//! - [`TensorDescriptor`] / [`StorageType`]: logical shape and physical layout of a tensor
//! - [`Tensor`]: device memory paired with a descriptor, owned or borrowed
//! - [`Allocator`]: memory allocation, with [`HostAllocator`] backing the reference device

pub mod allocator;
pub mod descriptor;
pub mod error;
pub mod gpu_info;
pub mod layout;
pub mod memory;
pub mod observer;
pub mod shape;
pub mod tensor;


pub use allocator::{Allocator, HostAllocator, LruAllocator, MemoryOptions, RawMemory};
pub use descriptor::{StorageType, TensorDescriptor};
pub use error::{Error, Result};
pub use gpu_info::{GpuApi, GpuInfo, GpuVendor};
pub use layout::TensorLayout;
pub use memory::{DeviceMemory, WeakDeviceMemory};
pub use observer::{AllocationEvent, DispatchEvent, ExecutionObserver};
pub use shape::{Bhwc, Bhwdc, align_by_n, divide_round_up};
pub use tensor::{DeviceContext, Ownership, Tensor, create_tensor_shared_image2d_buffer};
