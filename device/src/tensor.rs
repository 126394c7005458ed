//! Tensors: device memory paired with a descriptor.
//!
//! A tensor either owns its allocation or borrows memory owned by the caller; the mode is fixed at
//! construction. Borrowed tensors hold a weak handle and never release the memory themselves.

use std::sync::Arc;

use kiln_dtype::DataType;
use snafu::ensure;
use tracing::debug;

use crate::allocator::{Allocator, HostAllocator, LruAllocator, MemoryOptions};
use crate::error::{AllocationSnafu, Result, ShapeSnafu, UnsupportedConfigurationSnafu, UnsupportedStorageSnafu};
use crate::gpu_info::GpuInfo;
use crate::layout::TensorLayout;
use crate::memory::{DeviceMemory, WeakDeviceMemory};
use crate::observer::{AllocationEvent, ExecutionObserver};
use crate::shape::{Bhwdc, align_by_n};
use crate::{StorageType, TensorDescriptor};

/// Device a tensor is created against: capabilities, allocator and an optional observer.
#[derive(Clone)]
pub struct DeviceContext {
    pub info: Arc<GpuInfo>,
    pub allocator: Arc<dyn Allocator>,
    pub observer: Option<Arc<dyn ExecutionObserver>>,
}

impl DeviceContext {
    pub fn new(info: GpuInfo, allocator: Arc<dyn Allocator>) -> Self {
        Self { info: Arc::new(info), allocator, observer: None }
    }

    /// Context backed by host memory with block reuse.
    pub fn host(info: GpuInfo) -> Self {
        Self::new(info, Arc::new(LruAllocator::new(Box::new(HostAllocator::new()))))
    }

    pub fn with_observer(mut self, observer: Arc<dyn ExecutionObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    fn check_storage(&self, descriptor: &TensorDescriptor) -> Result<()> {
        let (storage, data_type) = (descriptor.storage_type, descriptor.data_type);
        ensure!(
            self.info.is_storage_supported(storage, data_type),
            UnsupportedStorageSnafu { storage, data_type, device: self.info.to_string() }
        );
        Ok(())
    }
}

impl std::fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceContext")
            .field("info", &self.info)
            .field("allocator", &self.allocator.name())
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

/// Who releases a tensor's memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// The tensor allocated the memory and releases it on drop.
    Owned,
    /// The memory belongs to the caller.
    Borrowed,
}

#[derive(Debug)]
enum Backing {
    Owned(DeviceMemory),
    Borrowed(WeakDeviceMemory),
}

/// Device tensor. Move-only.
#[derive(Debug)]
pub struct Tensor {
    backing: Backing,
    descriptor: TensorDescriptor,
    layout: TensorLayout,
}

impl Tensor {
    /// Allocate a tensor laid out per the descriptor, uploading its host data if it has any.
    pub fn create_from_descriptor(descriptor: &TensorDescriptor, context: &DeviceContext) -> Result<Self> {
        descriptor.validate_shape()?;
        context.check_storage(descriptor)?;

        let layout = TensorLayout::new(descriptor);
        layout.validate_limits(&context.info)?;

        let size = layout.size_in_bytes();
        let memory = DeviceMemory::allocate(Arc::clone(&context.allocator), size, MemoryOptions { zero_init: true })?;
        debug!(shape = %descriptor.shape, storage = %descriptor.storage_type, size, "allocated tensor");
        if let Some(observer) = &context.observer {
            observer.on_allocation(&AllocationEvent { size, storage_type: descriptor.storage_type });
        }

        let mut tensor = Self { backing: Backing::Owned(memory), descriptor: descriptor.without_data(), layout };
        if !descriptor.data.is_empty() {
            tensor.upload_descriptor_data(descriptor)?;
        }
        Ok(tensor)
    }

    /// Wrap caller-owned memory without allocating.
    pub fn create_shared(context: &DeviceContext, memory: &DeviceMemory, descriptor: &TensorDescriptor) -> Result<Self> {
        descriptor.validate_shape()?;
        context.check_storage(descriptor)?;

        let layout = TensorLayout::new(descriptor);
        layout.validate_limits(&context.info)?;
        Self::borrowed(memory, descriptor, layout)
    }

    /// Build a 2D image view over buffer memory with a pre-validated row pitch.
    pub(crate) fn shared_image2d(
        memory: &DeviceMemory,
        descriptor: &TensorDescriptor,
        row_pitch: usize,
    ) -> Result<Self> {
        let layout = TensorLayout::with_row_pitch(descriptor, row_pitch);
        Self::borrowed(memory, descriptor, layout)
    }

    fn borrowed(memory: &DeviceMemory, descriptor: &TensorDescriptor, layout: TensorLayout) -> Result<Self> {
        let size = layout.size_in_bytes();
        ensure!(
            memory.size() >= size,
            AllocationSnafu { size, reason: format!("shared memory holds only {} bytes", memory.size()) }
        );
        let memory = memory.view(0, size)?;
        Ok(Self { backing: Backing::Borrowed(memory.downgrade()), descriptor: descriptor.without_data(), layout })
    }

    pub fn ownership(&self) -> Ownership {
        match self.backing {
            Backing::Owned(_) => Ownership::Owned,
            Backing::Borrowed(_) => Ownership::Borrowed,
        }
    }

    /// Device memory backing the tensor.
    pub fn memory(&self) -> Result<DeviceMemory> {
        match &self.backing {
            Backing::Owned(memory) => Ok(memory.clone()),
            Backing::Borrowed(memory) => memory.upgrade(),
        }
    }

    /// Underlying buffer memory, which 2D images can be created over.
    pub fn memory_for_writing(&self) -> Result<DeviceMemory> {
        self.memory()
    }

    pub fn descriptor(&self) -> &TensorDescriptor {
        &self.descriptor
    }

    pub fn layout(&self) -> &TensorLayout {
        &self.layout
    }

    pub fn shape(&self) -> Bhwdc {
        self.descriptor.shape
    }

    pub fn width(&self) -> usize {
        self.descriptor.shape.w
    }

    pub fn height(&self) -> usize {
        self.descriptor.shape.h
    }

    pub fn depth(&self) -> usize {
        self.descriptor.shape.d
    }

    pub fn channels(&self) -> usize {
        self.descriptor.shape.c
    }

    pub fn slices(&self) -> usize {
        self.descriptor.slices()
    }

    pub fn batch(&self) -> usize {
        self.descriptor.shape.b
    }

    pub fn data_type(&self) -> DataType {
        self.descriptor.data_type
    }

    pub fn storage_type(&self) -> StorageType {
        self.descriptor.storage_type
    }

    /// Bytes the tensor spans in device memory.
    pub fn memory_size_in_bytes(&self) -> usize {
        self.layout.size_in_bytes()
    }

    /// Copy the descriptor's host data into device memory.
    pub fn upload_descriptor_data(&mut self, descriptor: &TensorDescriptor) -> Result<()> {
        ensure!(
            descriptor.shape == self.descriptor.shape && descriptor.data_type == self.descriptor.data_type,
            ShapeSnafu {
                reason: format!(
                    "cannot upload {} {} data into {} {} tensor",
                    descriptor.shape, descriptor.data_type, self.descriptor.shape, self.descriptor.data_type
                )
            }
        );
        let packed = self.layout.pack(&descriptor.data)?;
        self.memory()?.view(0, packed.len())?.copyin(&packed)
    }

    /// Read the tensor back into `descriptor`, replacing its shape, types and data.
    pub fn to_descriptor(&self, descriptor: &mut TensorDescriptor) -> Result<()> {
        let mut packed = vec![0u8; self.layout.size_in_bytes()];
        self.memory()?.view(0, packed.len())?.copyout(&mut packed)?;

        *descriptor = self.descriptor.without_data();
        descriptor.data = self.layout.unpack(&packed)?;
        Ok(())
    }

    /// Upload flat BHWDC floats, converting to the tensor's data type.
    pub fn write_f32(&mut self, values: &[f32]) -> Result<()> {
        let mut descriptor = self.descriptor.without_data();
        descriptor.upload_f32(values)?;
        self.upload_descriptor_data(&descriptor)
    }

    /// Download the tensor as flat BHWDC floats.
    pub fn read_f32(&self) -> Result<Vec<f32>> {
        let mut descriptor = self.descriptor.clone();
        self.to_descriptor(&mut descriptor)?;
        Ok(descriptor.to_f32())
    }
}

/// Create a 2D image tensor over existing buffer memory without reallocating.
///
/// Image rows are padded to `width_pixel_alignment` pixels, which must be a non-zero multiple of the
/// device's pitch alignment. Fails if the buffer is too small for the padded rows.
pub fn create_tensor_shared_image2d_buffer(
    context: &DeviceContext,
    memory: &DeviceMemory,
    descriptor: &TensorDescriptor,
    width_pixel_alignment: usize,
) -> Result<Tensor> {
    descriptor.validate_shape()?;
    ensure!(
        descriptor.storage_type.is_texture_2d(),
        UnsupportedConfigurationSnafu {
            reason: format!("shared image2d view requires a 2D texture storage, got {}", descriptor.storage_type)
        }
    );
    let device_alignment = context.info.image_pitch_alignment;
    ensure!(
        width_pixel_alignment > 0 && width_pixel_alignment % device_alignment.max(1) == 0,
        UnsupportedConfigurationSnafu {
            reason: format!(
                "width alignment {width_pixel_alignment} is not a multiple of device pitch alignment {device_alignment}"
            )
        }
    );
    context.check_storage(descriptor)?;

    let row_pitch = align_by_n(descriptor.shape.w * descriptor.shape.b, width_pixel_alignment);
    let layout = TensorLayout::with_row_pitch(descriptor, row_pitch);
    layout.validate_limits(&context.info)?;
    debug!(shape = %descriptor.shape, row_pitch, "creating shared image2d view over buffer");

    Tensor::shared_image2d(memory, descriptor, row_pitch)
}
