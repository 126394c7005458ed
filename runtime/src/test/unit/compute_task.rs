use std::sync::Arc;

use kiln_codegen::ops::{create_elementwise, create_softmax1x1};
use kiln_codegen::{ElementwiseOp, ElementwiseOperand, GpuOperation, OperationDef};
use kiln_device::{Bhwc, GpuInfo, StorageType, Tensor};
use kiln_dtype::CalculationsPrecision;

use crate::test::helpers::*;
use crate::device::{Launch, LaunchTensor, Program};
use crate::{CommandQueue, ComputeTask, Error, HostQueue};

const SHAPE: Bhwc = Bhwc::new(1, 2, 2, 6);

fn softmax(storage: StorageType) -> GpuOperation {
    let definition = OperationDef::uniform(CalculationsPrecision::F32, storage, 1, 1);
    create_softmax1x1(definition, &GpuInfo::generic(), SHAPE).unwrap()
}

fn tensor(device: &crate::Device, storage: StorageType, values: Option<&[f32]>) -> Tensor {
    let descriptor = match values {
        Some(values) => descriptor(storage, SHAPE, values),
        None => empty(storage, SHAPE),
    };
    Tensor::create_from_descriptor(&descriptor, device.context()).unwrap()
}

fn assert_binding<T: std::fmt::Debug>(result: crate::Result<T>, needle: &str) {
    match result {
        Err(Error::Binding { reason }) => assert!(reason.contains(needle), "unexpected reason: {reason}"),
        other => panic!("expected a binding error containing {needle:?}, got {other:?}"),
    }
}

#[test]
fn test_lifecycle_runs_softmax() {
    let device = device();
    let values = ramp(24);
    let (src, dst) = (tensor(&device, StorageType::Buffer, Some(&values[..])), tensor(&device, StorageType::Buffer, None));

    let mut task = ComputeTask::init(softmax(StorageType::Buffer));
    assert!(!task.is_compiled());
    task.bind(&[&src], &[&dst]).unwrap();
    task.compile(&device).unwrap();
    assert!(task.is_compiled());
    task.update_params().unwrap();
    assert_eq!(task.grid_size(), Some([2, 2, 2]));

    let mut queue = HostQueue::new();
    task.encode(&mut queue).unwrap();
    assert_eq!(queue.pending(), 1);
    queue.finish().unwrap();
    assert_eq!((queue.pending(), queue.completed()), (0, 1));

    assert_close(&dst.read_f32().unwrap(), &softmax_reference(&values, 6), 1e-5);
}

#[test]
fn test_set_tensor_rejects_out_of_range_index() {
    let device = device();
    let mut task = ComputeTask::init(softmax(StorageType::Buffer));
    let src = tensor(&device, StorageType::Buffer, None);
    assert_binding(task.set_src_tensor(&src, 1), "out of range");
    assert_binding(task.set_dst_tensor(&src, 3), "out of range");
}

#[test]
fn test_set_tensor_rejects_storage_mismatch() {
    let device = device();
    let mut task = ComputeTask::init(softmax(StorageType::Buffer));
    let texture = tensor(&device, StorageType::Texture2D, None);
    assert_binding(task.set_src_tensor(&texture, 0), "expects Buffer");
}

#[test]
fn test_bind_requires_every_slot() {
    let device = device();
    let mut task = ComputeTask::init(softmax(StorageType::Buffer));
    let src = tensor(&device, StorageType::Buffer, None);
    assert_binding(task.bind(&[&src], &[]), "declares 1 sources and 1 destinations");
}

#[test]
fn test_update_params_requires_bound_tensors() {
    let device = device();
    let mut task = ComputeTask::init(softmax(StorageType::Buffer));
    task.set_src_tensor(&tensor(&device, StorageType::Buffer, None), 0).unwrap();
    assert_binding(task.update_params(), "destination 0 is not bound");
}

#[test]
fn test_encode_requires_compilation() {
    let device = device();
    let (src, dst) = (tensor(&device, StorageType::Buffer, None), tensor(&device, StorageType::Buffer, None));
    let mut task = ComputeTask::init(softmax(StorageType::Buffer));
    task.bind(&[&src], &[&dst]).unwrap();
    task.update_params().unwrap();
    assert_binding(task.encode(&mut HostQueue::new()), "is not compiled");
}

#[test]
fn test_rebinding_makes_params_stale() {
    let device = device();
    let values = ramp(24);
    let (src, dst) = (tensor(&device, StorageType::Buffer, Some(&values[..])), tensor(&device, StorageType::Buffer, None));
    let mut task = ComputeTask::init(softmax(StorageType::Buffer));
    task.bind(&[&src], &[&dst]).unwrap();
    task.compile(&device).unwrap();
    task.update_params().unwrap();

    let doubled: Vec<f32> = values.iter().map(|v| v * 2.0).collect();
    let other = tensor(&device, StorageType::Buffer, Some(&doubled[..]));
    task.set_src_tensor(&other, 0).unwrap();
    assert_eq!(task.grid_size(), None);
    assert_binding(task.encode(&mut HostQueue::new()), "stale");

    task.update_params().unwrap();
    let mut queue = HostQueue::new();
    task.encode(&mut queue).unwrap();
    queue.finish().unwrap();
    assert_close(&dst.read_f32().unwrap(), &softmax_reference(&doubled, 6), 1e-5);
}

#[test]
fn test_encode_indirect_matches_encode() {
    let device = device();
    let values = ramp(24);
    let src = tensor(&device, StorageType::Buffer, Some(&values[..]));
    let (direct, indirect) = (tensor(&device, StorageType::Buffer, None), tensor(&device, StorageType::Buffer, None));

    let mut queue = HostQueue::new();
    let mut first = ComputeTask::init(softmax(StorageType::Buffer));
    first.bind(&[&src], &[&direct]).unwrap();
    first.compile(&device).unwrap();
    first.update_params().unwrap();
    first.encode(&mut queue).unwrap();

    let mut second = ComputeTask::init(softmax(StorageType::Buffer));
    second.bind(&[&src], &[&indirect]).unwrap();
    second.compile(&device).unwrap();
    second.update_params().unwrap();
    second.encode_indirect(&mut queue).unwrap();

    assert_eq!(queue.pending(), 2);
    queue.finish().unwrap();
    assert_eq!(direct.read_f32().unwrap(), indirect.read_f32().unwrap());
}

#[test]
fn test_observer_sees_each_dispatch() {
    let (device, observer) = observed_device();
    let shape = Bhwc::new(1, 3, 5, 8);
    let definition = OperationDef::uniform(CalculationsPrecision::F32, StorageType::Buffer, 1, 1);
    let op = create_elementwise(definition, &GpuInfo::generic(), ElementwiseOp::Square, ElementwiseOperand::None).unwrap();
    let work_group = op.work_group_size();
    let src = Tensor::create_from_descriptor(&descriptor(StorageType::Buffer, shape, &ramp(120)), device.context()).unwrap();
    let dst = Tensor::create_from_descriptor(&empty(StorageType::Buffer, shape), device.context()).unwrap();

    let mut task = ComputeTask::init(op);
    task.bind(&[&src], &[&dst]).unwrap();
    task.compile(&device).unwrap();
    task.update_params().unwrap();
    let mut queue = HostQueue::new();
    task.encode(&mut queue).unwrap();
    task.encode(&mut queue).unwrap();
    queue.finish().unwrap();

    let dispatches = observer.dispatches.lock();
    assert_eq!(dispatches.len(), 2);
    assert_eq!(dispatches[0].name, "elementwise");
    assert_eq!(dispatches[0].grid_size, [5, 3, 2]);
    assert_eq!(dispatches[0].work_group_size, work_group);
}

#[test]
fn test_failed_compile_leaves_task_uncompiled() {
    let info = GpuInfo::builder().local_memory_size(4).build();
    let device = crate::Device::host(info);
    let mut task = ComputeTask::init(softmax(StorageType::Buffer));

    let err = task.compile(&device).unwrap_err();
    assert!(matches!(err, Error::Compilation { .. }), "{err}");
    assert!(!task.is_compiled());
    assert!(device.cache().is_empty());
}

#[test]
fn test_queue_trait_object_dispatches_in_order() {
    let device = device();
    let values = ramp(24);
    let src = tensor(&device, StorageType::Buffer, Some(&values[..]));
    let (middle, last) = (tensor(&device, StorageType::Buffer, None), tensor(&device, StorageType::Buffer, None));

    let mut first = ComputeTask::init(softmax(StorageType::Buffer));
    first.bind(&[&src], &[&middle]).unwrap();
    let mut second = ComputeTask::init(softmax(StorageType::Buffer));
    second.bind(&[&middle], &[&last]).unwrap();

    let mut queue = HostQueue::new();
    let queue: &mut dyn CommandQueue = &mut queue;
    for task in [&mut first, &mut second] {
        task.compile(&device).unwrap();
        task.update_params().unwrap();
        task.encode(queue).unwrap();
    }
    queue.finish().unwrap();

    let once = softmax_reference(&values, 6);
    assert_close(&last.read_f32().unwrap(), &softmax_reference(&once, 6), 1e-5);
}

#[test]
fn test_update_params_rejects_source_smaller_than_compiled() {
    let device = device();
    let shape = Bhwc::new(1, 2, 2, 8);
    let definition = OperationDef::uniform(CalculationsPrecision::F32, StorageType::Buffer, 1, 1);
    let op = create_softmax1x1(definition, &GpuInfo::generic(), shape).unwrap();
    let src = Tensor::create_from_descriptor(&descriptor(StorageType::Buffer, Bhwc::new(1, 1, 1, 8), &ramp(8)), device.context())
        .unwrap();
    let dst = Tensor::create_from_descriptor(&empty(StorageType::Buffer, shape), device.context()).unwrap();

    let mut task = ComputeTask::init(op);
    task.bind(&[&src], &[&dst]).unwrap();
    task.compile(&device).unwrap();
    assert_binding(task.update_params(), "does not cover");
    assert_eq!(task.grid_size(), None);
    assert_binding(task.encode(&mut HostQueue::new()), "stale");
}

#[test]
fn test_update_params_rejects_unexpected_broadcast() {
    let device = device();
    let definition = OperationDef::uniform(CalculationsPrecision::F32, StorageType::Buffer, 2, 1);
    let op = create_elementwise(definition, &GpuInfo::generic(), ElementwiseOp::Add, ElementwiseOperand::Tensor).unwrap();
    let (src, dst) = (tensor(&device, StorageType::Buffer, Some(&ramp(24)[..])), tensor(&device, StorageType::Buffer, None));
    let single = Bhwc { c: 1, ..SHAPE };
    let second = Tensor::create_from_descriptor(&descriptor(StorageType::Buffer, single, &ramp(4)), device.context()).unwrap();

    let mut task = ComputeTask::init(op);
    task.bind(&[&src, &second], &[&dst]).unwrap();
    assert_binding(task.update_params(), "the kernel reads 6");
}

#[test]
fn test_encode_fails_once_bound_tensor_is_dropped() {
    let device = device();
    let src = tensor(&device, StorageType::Buffer, Some(&ramp(24)[..]));
    let dst = tensor(&device, StorageType::Buffer, None);
    let mut task = ComputeTask::init(softmax(StorageType::Buffer));
    task.bind(&[&src], &[&dst]).unwrap();
    task.compile(&device).unwrap();
    task.update_params().unwrap();

    drop(dst);
    let mut queue = HostQueue::new();
    assert_binding(task.encode(&mut queue), "was released");
    assert_eq!(queue.pending(), 0);
}

/// Keeps dispatches for inspection without running them.
#[derive(Default)]
struct RecordingQueue {
    dispatches: Vec<(Arc<dyn Program>, Launch)>,
}

impl CommandQueue for RecordingQueue {
    fn dispatch(&mut self, program: Arc<dyn Program>, launch: Launch) -> crate::Result<()> {
        self.dispatches.push((program, launch));
        Ok(())
    }

    fn finish(&mut self) -> crate::Result<()> {
        Ok(())
    }
}

#[test]
fn test_host_program_reports_reads_past_the_tensor() {
    let device = device();
    let (src, dst) = (tensor(&device, StorageType::Buffer, Some(&ramp(24)[..])), tensor(&device, StorageType::Buffer, None));
    let mut task = ComputeTask::init(softmax(StorageType::Buffer));
    task.bind(&[&src], &[&dst]).unwrap();
    task.compile(&device).unwrap();
    task.update_params().unwrap();
    let mut queue = RecordingQueue::default();
    task.encode(&mut queue).unwrap();
    let (program, mut launch) = queue.dispatches.pop().unwrap();

    let small = Tensor::create_from_descriptor(&descriptor(StorageType::Buffer, Bhwc::new(1, 1, 1, 6), &ramp(6)), device.context())
        .unwrap();
    launch.tensors.insert("src_tensor".into(), LaunchTensor { memory: small.memory().unwrap(), layout: *small.layout() });

    let err = program.execute(&launch).unwrap_err();
    assert!(matches!(&err, Error::Execution { reason } if reason.contains("outside")), "{err}");
}
