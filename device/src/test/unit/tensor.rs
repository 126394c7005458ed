use std::sync::Arc;

use kiln_dtype::DataType;
use parking_lot::Mutex;

use crate::{
    AllocationEvent, Bhwdc, DeviceContext, DeviceMemory, ExecutionObserver, GpuInfo, HostAllocator, MemoryOptions,
    Ownership, StorageType, Tensor, TensorDescriptor, create_tensor_shared_image2d_buffer,
};

fn context() -> DeviceContext {
    DeviceContext::host(GpuInfo::generic())
}

fn iota(n: usize) -> Vec<f32> {
    (0..n).map(|i| i as f32 * 0.5 - 3.0).collect()
}

#[test]
fn test_create_from_descriptor_uploads_data() {
    let shape = Bhwdc::new(1, 2, 3, 1, 5);
    let mut descriptor = TensorDescriptor::new(DataType::Float32, StorageType::Texture2D, shape);
    descriptor.upload_f32(&iota(shape.elements())).unwrap();

    let tensor = Tensor::create_from_descriptor(&descriptor, &context()).unwrap();
    assert_eq!(tensor.ownership(), Ownership::Owned);
    assert_eq!(tensor.slices(), 2);
    assert_eq!(tensor.read_f32().unwrap(), iota(shape.elements()));
}

#[test]
fn test_zero_dimension_is_shape_error() {
    let descriptor = TensorDescriptor::new(DataType::Float32, StorageType::Buffer, Bhwdc::new(1, 0, 3, 1, 5));
    assert!(matches!(Tensor::create_from_descriptor(&descriptor, &context()), Err(crate::Error::Shape { .. })));
}

#[test]
fn test_single_texture_rejects_wide_channels() {
    let descriptor = TensorDescriptor::new(DataType::Float32, StorageType::SingleTexture2D, Bhwdc::new(1, 2, 2, 1, 5));
    assert!(matches!(Tensor::create_from_descriptor(&descriptor, &context()), Err(crate::Error::Shape { .. })));
}

#[test]
fn test_unsupported_storage() {
    let info = GpuInfo::builder().storage_types([StorageType::Buffer].into_iter().collect()).build();
    let context = DeviceContext::host(info);
    let descriptor = TensorDescriptor::new(DataType::Float32, StorageType::Texture3D, Bhwdc::new(1, 2, 2, 1, 4));

    let err = Tensor::create_from_descriptor(&descriptor, &context).unwrap_err();
    assert!(err.is_unsupported());
}

#[test]
fn test_allocation_failure() {
    let context = DeviceContext::new(GpuInfo::generic(), Arc::new(HostAllocator::with_capacity(64)));
    let descriptor = TensorDescriptor::new(DataType::Float32, StorageType::Buffer, Bhwdc::new(1, 4, 4, 1, 4));
    assert!(matches!(Tensor::create_from_descriptor(&descriptor, &context), Err(crate::Error::Allocation { .. })));
}

#[test]
fn test_upload_shape_mismatch() {
    let descriptor = TensorDescriptor::new(DataType::Float32, StorageType::Buffer, Bhwdc::new(1, 2, 2, 1, 4));
    let mut tensor = Tensor::create_from_descriptor(&descriptor, &context()).unwrap();

    let mut other = TensorDescriptor::new(DataType::Float32, StorageType::Buffer, Bhwdc::new(1, 2, 2, 1, 3));
    other.upload_f32(&iota(12)).unwrap();
    assert!(matches!(tensor.upload_descriptor_data(&other), Err(crate::Error::Shape { .. })));
}

#[test]
fn test_shared_tensor_is_borrowed() {
    let context = context();
    let descriptor = TensorDescriptor::new(DataType::Float32, StorageType::Buffer, Bhwdc::new(1, 1, 2, 1, 4));
    let memory = DeviceMemory::allocate(context.allocator.clone(), 32, MemoryOptions::default()).unwrap();

    let mut tensor = Tensor::create_shared(&context, &memory, &descriptor).unwrap();
    assert_eq!(tensor.ownership(), Ownership::Borrowed);
    tensor.write_f32(&iota(8)).unwrap();
    drop(tensor);

    // The caller's memory outlives the tensor and keeps its contents.
    let mut out = [0u8; 32];
    memory.copyout(&mut out).unwrap();
    assert_eq!(DataType::Float32.decode(&out), iota(8));
}

#[test]
fn test_shared_tensor_after_owner_release() {
    let context = context();
    let descriptor = TensorDescriptor::new(DataType::Float32, StorageType::Buffer, Bhwdc::new(1, 1, 2, 1, 4));
    let memory = DeviceMemory::allocate(context.allocator.clone(), 32, MemoryOptions::default()).unwrap();
    let tensor = Tensor::create_shared(&context, &memory, &descriptor).unwrap();

    drop(memory);
    assert!(matches!(tensor.read_f32(), Err(crate::Error::MemoryReleased)));
}

#[test]
fn test_shared_tensor_too_small() {
    let context = context();
    let descriptor = TensorDescriptor::new(DataType::Float32, StorageType::Buffer, Bhwdc::new(1, 1, 2, 1, 4));
    let memory = DeviceMemory::allocate(context.allocator.clone(), 16, MemoryOptions::default()).unwrap();
    assert!(matches!(Tensor::create_shared(&context, &memory, &descriptor), Err(crate::Error::Allocation { .. })));
}

#[test]
fn test_image2d_over_buffer_tensor() {
    let context = DeviceContext::host(GpuInfo::builder().image_pitch_alignment(4).build());
    let shape = Bhwdc::new(1, 3, 5, 1, 4);

    // Buffer large enough for rows padded from 5 to 8 pixels.
    let buffer_descriptor = TensorDescriptor::new(DataType::Float32, StorageType::Buffer, Bhwdc::new(1, 1, 24, 1, 4));
    let buffer = Tensor::create_from_descriptor(&buffer_descriptor, &context).unwrap();

    let image_descriptor = TensorDescriptor::new(DataType::Float32, StorageType::Texture2D, shape);
    let memory = buffer.memory_for_writing().unwrap();
    let mut image = create_tensor_shared_image2d_buffer(&context, &memory, &image_descriptor, 8).unwrap();
    assert_eq!(image.ownership(), Ownership::Borrowed);
    assert_eq!(image.layout().row_pitch, 8);

    image.write_f32(&iota(shape.elements())).unwrap();
    assert_eq!(image.read_f32().unwrap(), iota(shape.elements()));

    // Second row starts at the padded pitch inside the buffer.
    let raw = buffer.read_f32().unwrap();
    assert_eq!(raw[8 * 4..8 * 4 + 4], iota(shape.elements())[5 * 4..5 * 4 + 4]);
}

#[test]
fn test_image2d_alignment_rules() {
    let context = DeviceContext::host(GpuInfo::builder().image_pitch_alignment(4).build());
    let memory = DeviceMemory::allocate(context.allocator.clone(), 1024, MemoryOptions::default()).unwrap();
    let descriptor = TensorDescriptor::new(DataType::Float32, StorageType::Texture2D, Bhwdc::new(1, 3, 5, 1, 4));

    let misaligned = create_tensor_shared_image2d_buffer(&context, &memory, &descriptor, 6);
    assert!(matches!(misaligned, Err(crate::Error::UnsupportedConfiguration { .. })));

    let zero = create_tensor_shared_image2d_buffer(&context, &memory, &descriptor, 0);
    assert!(matches!(zero, Err(crate::Error::UnsupportedConfiguration { .. })));

    let buffer_storage = TensorDescriptor { storage_type: StorageType::Buffer, ..descriptor.clone() };
    let wrong_storage = create_tensor_shared_image2d_buffer(&context, &memory, &buffer_storage, 4);
    assert!(matches!(wrong_storage, Err(crate::Error::UnsupportedConfiguration { .. })));

    // 3 rows of 64 padded pixels need 3072 bytes.
    let too_small = create_tensor_shared_image2d_buffer(&context, &memory, &descriptor, 64);
    assert!(matches!(too_small, Err(crate::Error::Allocation { .. })));
}

#[derive(Default)]
struct RecordingObserver {
    allocations: Mutex<Vec<AllocationEvent>>,
}

impl ExecutionObserver for RecordingObserver {
    fn on_allocation(&self, event: &AllocationEvent) {
        self.allocations.lock().push(event.clone());
    }
}

#[test]
fn test_observer_sees_allocations() {
    let observer = Arc::new(RecordingObserver::default());
    let context = context().with_observer(observer.clone());
    let descriptor = TensorDescriptor::new(DataType::Float16, StorageType::Texture3D, Bhwdc::new(1, 2, 2, 2, 5));
    let _tensor = Tensor::create_from_descriptor(&descriptor, &context).unwrap();

    let allocations = observer.allocations.lock();
    let expected = AllocationEvent { size: descriptor.memory_size_in_bytes(), storage_type: StorageType::Texture3D };
    assert_eq!(*allocations, vec![expected]);
}
