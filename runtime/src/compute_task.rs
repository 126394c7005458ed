//! Execution of one operation: bind tensors, compile, fill arguments, dispatch.
//!
//! ```text
//! init -> bind / set_*_tensor -> compile -> update_params -> encode -> (queue) finish
//! ```
//!
//! Tensors can be rebound at any time; rebinding marks the parameters stale until the next
//! [`ComputeTask::update_params`].

use std::collections::BTreeMap;
use std::sync::Arc;

use kiln_codegen::{GpuObject, GpuOperation};
use kiln_device::{
    Bhwdc, DeviceMemory, DispatchEvent, ExecutionObserver, MemoryOptions, Tensor, TensorDescriptor, TensorLayout,
    WeakDeviceMemory,
};
use smallvec::SmallVec;
use snafu::{OptionExt, ensure};
use tracing::debug;

use crate::binder::ArgumentBinder;
use crate::device::{Device, Launch, LaunchBuffer, LaunchTensor, Program};
use crate::error::{BindingSnafu, Error, Result};
use crate::queue::{CommandQueue, HostQueue};

/// A bound slot. The task never keeps the tensor's memory alive on its own.
#[derive(Debug, Clone)]
struct BoundTensor {
    memory: WeakDeviceMemory,
    layout: TensorLayout,
}

impl BoundTensor {
    fn new(tensor: &Tensor) -> Result<Self> {
        Ok(Self { memory: tensor.memory()?.downgrade(), layout: *tensor.layout() })
    }

    fn launch(&self, name: &str) -> Result<LaunchTensor> {
        let memory = self
            .memory
            .upgrade()
            .map_err(|_| binding(format!("{name} was released after binding")))?;
        Ok(LaunchTensor { memory, layout: self.layout })
    }
}

/// Constant objects uploaded at compile time.
#[derive(Debug, Default)]
struct Resources {
    tensors: BTreeMap<String, Tensor>,
    buffers: BTreeMap<String, LaunchBuffer>,
}

/// Compiled program plus uploaded constants.
#[derive(Debug)]
struct Compiled {
    program: Arc<dyn Program>,
    resources: Resources,
}

/// Grid and argument values computed by [`ComputeTask::update_params`].
#[derive(Debug, Clone)]
struct Params {
    grid: [usize; 3],
    binder: ArgumentBinder,
}

/// Recorded dispatches, replayed onto a queue in order.
#[derive(Debug, Default)]
pub struct IndirectCommandBuffer {
    commands: Vec<(Arc<dyn Program>, Launch)>,
}

impl IndirectCommandBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, program: Arc<dyn Program>, launch: Launch) {
        self.commands.push((program, launch));
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Enqueue every recorded dispatch.
    pub fn execute(self, queue: &mut dyn CommandQueue) -> Result<()> {
        for (program, launch) in self.commands {
            queue.dispatch(program, launch)?;
        }
        Ok(())
    }
}

fn binding(reason: impl Into<String>) -> Error {
    Error::Binding { reason: reason.into() }
}

/// One operation prepared for dispatch on one device.
pub struct ComputeTask {
    operation: GpuOperation,
    src: SmallVec<[Option<BoundTensor>; 2]>,
    dst: SmallVec<[Option<BoundTensor>; 1]>,
    compiled: Option<Compiled>,
    params: Option<Params>,
    observer: Option<Arc<dyn ExecutionObserver>>,
}

impl std::fmt::Debug for ComputeTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputeTask")
            .field("operation", &self.operation.name())
            .field("src", &self.src)
            .field("dst", &self.dst)
            .field("compiled", &self.compiled)
            .field("params", &self.params)
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

impl ComputeTask {
    /// Take ownership of `operation`; nothing is bound or compiled yet.
    pub fn init(operation: GpuOperation) -> Self {
        let definition = operation.definition();
        let src = std::iter::repeat_n(None, definition.src_tensors.len()).collect();
        let dst = std::iter::repeat_n(None, definition.dst_tensors.len()).collect();
        Self { operation, src, dst, compiled: None, params: None, observer: None }
    }

    pub fn operation(&self) -> &GpuOperation {
        &self.operation
    }

    pub fn is_compiled(&self) -> bool {
        self.compiled.is_some()
    }

    /// Grid of the last [`ComputeTask::update_params`], if still current.
    pub fn grid_size(&self) -> Option<[usize; 3]> {
        self.params.as_ref().map(|params| params.grid)
    }

    /// Translate, compile and upload constant objects. On failure the task stays uncompiled.
    pub fn compile(&mut self, device: &Device) -> Result<()> {
        let program = device.program(&self.operation)?;

        let mut resources = Resources::default();
        for (name, object) in self.operation.args().objects() {
            match object {
                GpuObject::Buffer { data_type, data } => {
                    let options = MemoryOptions { zero_init: false };
                    let memory = DeviceMemory::allocate(Arc::clone(&device.context().allocator), data.len(), options)?;
                    memory.copyin(data)?;
                    resources.buffers.insert(name.to_string(), LaunchBuffer { memory, data_type: *data_type });
                }
                GpuObject::Tensor(descriptor) => {
                    let tensor = Tensor::create_from_descriptor(descriptor, device.context())?;
                    resources.tensors.insert(name.to_string(), tensor);
                }
            }
        }

        debug!(
            operation = self.operation.name(),
            buffers = resources.buffers.len(),
            tensors = resources.tensors.len(),
            "compiled task"
        );
        self.compiled = Some(Compiled { program, resources });
        self.observer = device.context().observer.clone();
        Ok(())
    }

    fn check_slot(declared: Option<&TensorDescriptor>, tensor: &Tensor, role: &str, index: usize) -> Result<()> {
        let declared =
            declared.with_context(|| BindingSnafu { reason: format!("{role} index {index} is out of range") })?;
        ensure!(
            declared.storage_type == tensor.storage_type() && declared.data_type == tensor.data_type(),
            BindingSnafu {
                reason: format!(
                    "{role} {index} expects {} {}, got {} {}",
                    declared.storage_type,
                    declared.data_type,
                    tensor.storage_type(),
                    tensor.data_type()
                )
            }
        );
        Ok(())
    }

    pub fn set_src_tensor(&mut self, tensor: &Tensor, index: usize) -> Result<()> {
        Self::check_slot(self.operation.definition().src_tensors.get(index), tensor, "source", index)?;
        self.src[index] = Some(BoundTensor::new(tensor)?);
        self.params = None;
        Ok(())
    }

    pub fn set_dst_tensor(&mut self, tensor: &Tensor, index: usize) -> Result<()> {
        Self::check_slot(self.operation.definition().dst_tensors.get(index), tensor, "destination", index)?;
        self.dst[index] = Some(BoundTensor::new(tensor)?);
        self.params = None;
        Ok(())
    }

    /// Bind every slot at once; the counts must match the definition exactly.
    pub fn bind(&mut self, src: &[&Tensor], dst: &[&Tensor]) -> Result<()> {
        ensure!(
            src.len() == self.src.len() && dst.len() == self.dst.len(),
            BindingSnafu {
                reason: format!(
                    "{} declares {} sources and {} destinations, got {} and {}",
                    self.operation.name(),
                    self.src.len(),
                    self.dst.len(),
                    src.len(),
                    dst.len()
                )
            }
        );
        for (index, tensor) in src.iter().enumerate() {
            self.set_src_tensor(tensor, index)?;
        }
        for (index, tensor) in dst.iter().enumerate() {
            self.set_dst_tensor(tensor, index)?;
        }
        Ok(())
    }

    fn shapes(slots: &[Option<BoundTensor>], role: &str) -> Result<Vec<Bhwdc>> {
        slots
            .iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.as_ref()
                    .map(|bound| bound.layout.shape)
                    .with_context(|| BindingSnafu { reason: format!("{role} {index} is not bound") })
            })
            .collect()
    }

    /// Recompute the grid and the shape-dependent arguments from the bound tensors.
    ///
    /// Fails with [`Error::Binding`] when the bound shapes do not fit the generated kernel.
    pub fn update_params(&mut self) -> Result<()> {
        let src = Self::shapes(&self.src, "source")?;
        let dst = Self::shapes(&self.dst, "destination")?;
        self.operation.check_bound_shapes(&src, &dst).map_err(|source| binding(source.to_string()))?;

        let mut binder = ArgumentBinder::new(self.operation.args());
        self.operation.bind_arguments(&mut binder, &src).map_err(|source| match source {
            kiln_codegen::Error::UnknownArgument { .. } | kiln_codegen::Error::ArgumentKind { .. } => {
                binding(source.to_string())
            }
            source => Error::Codegen { source },
        })?;
        let grid = self.operation.grid_size(&dst);
        debug!(operation = self.operation.name(), ?grid, "updated params");
        self.params = Some(Params { grid, binder });
        Ok(())
    }

    fn launch(&self) -> Result<(Arc<dyn Program>, Launch)> {
        let compiled = self.compiled.as_ref().with_context(|| BindingSnafu {
            reason: format!("{} is not compiled", self.operation.name()),
        })?;
        let params = self.params.as_ref().with_context(|| BindingSnafu {
            reason: format!("{} params are stale, call update_params after binding", self.operation.name()),
        })?;
        let unresolved = params.binder.unresolved();
        ensure!(
            unresolved.is_empty(),
            BindingSnafu { reason: format!("unresolved arguments: {}", unresolved.join(", ")) }
        );

        let mut tensors = BTreeMap::new();
        let src = self.operation.src_names().iter().zip(&self.src);
        let slots = src.chain(self.operation.dst_names().iter().zip(&self.dst));
        for (name, slot) in slots {
            let bound = slot.as_ref().with_context(|| BindingSnafu { reason: format!("{name} is not bound") })?;
            tensors.insert(name.clone(), bound.launch(name)?);
        }
        for (name, tensor) in &compiled.resources.tensors {
            tensors.insert(name.clone(), LaunchTensor { memory: tensor.memory()?, layout: *tensor.layout() });
        }

        let launch = Launch {
            grid: params.grid,
            work_group: self.operation.work_group_size(),
            tensors,
            buffers: compiled.resources.buffers.clone(),
            ints: params.binder.ints(),
            floats: params.binder.floats(),
        };
        Ok((Arc::clone(&compiled.program), launch))
    }

    fn notify(&self, launch: &Launch) {
        if let Some(observer) = &self.observer {
            observer.on_dispatch(&DispatchEvent {
                name: self.operation.name().to_string(),
                grid_size: launch.grid,
                work_group_size: launch.work_group,
            });
        }
    }

    /// Enqueue the dispatch.
    pub fn encode(&self, queue: &mut dyn CommandQueue) -> Result<()> {
        let (program, launch) = self.launch()?;
        debug!(operation = self.operation.name(), grid = ?launch.grid, work_group = ?launch.work_group, "dispatch");
        self.notify(&launch);
        queue.dispatch(program, launch)
    }

    /// Record the dispatch into an indirect command buffer, then execute it on `queue`.
    pub fn encode_indirect(&self, queue: &mut dyn CommandQueue) -> Result<()> {
        let (program, launch) = self.launch()?;
        self.notify(&launch);
        let mut commands = IndirectCommandBuffer::new();
        commands.record(program, launch);
        debug!(operation = self.operation.name(), commands = commands.len(), "indirect dispatch");
        commands.execute(queue)
    }
}

/// Run `operation` once: create tensors from the descriptors, bind, compile, dispatch, wait and
/// read every destination back into `dst`.
pub fn execute_operation(
    device: &Device,
    operation: GpuOperation,
    src: &[TensorDescriptor],
    dst: &mut [TensorDescriptor],
) -> Result<()> {
    let context = device.context();
    let src_tensors =
        src.iter().map(|desc| Tensor::create_from_descriptor(desc, context)).collect::<Result<Vec<_>, _>>()?;
    let dst_tensors = dst
        .iter()
        .map(|desc| Tensor::create_from_descriptor(&desc.without_data(), context))
        .collect::<Result<Vec<_>, _>>()?;

    let mut task = ComputeTask::init(operation);
    task.bind(&src_tensors.iter().collect::<Vec<_>>(), &dst_tensors.iter().collect::<Vec<_>>())?;
    task.compile(device)?;
    task.update_params()?;

    let mut queue = HostQueue::new();
    task.encode(&mut queue)?;
    queue.finish()?;

    for (tensor, descriptor) in dst_tensors.iter().zip(dst.iter_mut()) {
        tensor.to_descriptor(descriptor)?;
    }
    Ok(())
}
