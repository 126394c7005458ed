//! Whole-model execution on one device.

use std::collections::BTreeMap;

use kiln_device::Tensor;
use kiln_schedule::{GpuModel, ValueId};
use snafu::OptionExt;
use tracing::debug;

use crate::compute_task::ComputeTask;
use crate::device::Device;
use crate::error::{ExecutionSnafu, Result};
use crate::queue::{CommandQueue, HostQueue};

fn tensor<'a>(tensors: &'a BTreeMap<ValueId, Tensor>, id: ValueId) -> Result<&'a Tensor> {
    tensors.get(&id).with_context(|| ExecutionSnafu { reason: format!("value {id} has no descriptor") })
}

/// Run every kernel of `model` in order and return the model outputs.
///
/// One tensor is created per described value. All kernels are encoded onto a single queue that is
/// finished once, after which the outputs are read back in flat BHWC order.
pub fn execute_model(
    device: &Device,
    model: &GpuModel,
    inputs: &BTreeMap<ValueId, Vec<f32>>,
) -> Result<BTreeMap<ValueId, Vec<f32>>> {
    let mut tensors = BTreeMap::new();
    for (id, descriptor) in &model.descriptors {
        tensors.insert(*id, Tensor::create_from_descriptor(&descriptor.without_data(), device.context())?);
    }
    for id in &model.inputs {
        let values = inputs.get(id).with_context(|| ExecutionSnafu { reason: format!("input {id} was not provided") })?;
        let tensor = tensors
            .get_mut(id)
            .with_context(|| ExecutionSnafu { reason: format!("value {id} has no descriptor") })?;
        tensor.write_f32(values)?;
    }

    let mut queue = HostQueue::new();
    let mut tasks = Vec::with_capacity(model.nodes.len());
    for node in &model.nodes {
        let src = node.inputs.iter().map(|id| tensor(&tensors, *id)).collect::<Result<Vec<_>>>()?;
        let dst = node.outputs.iter().map(|id| tensor(&tensors, *id)).collect::<Result<Vec<_>>>()?;

        let mut task = ComputeTask::init(node.operation.clone());
        task.bind(&src, &dst)?;
        task.compile(device)?;
        task.update_params()?;
        task.encode(&mut queue)?;
        tasks.push(task);
    }
    debug!(kernels = tasks.len(), cached_programs = device.cache().len(), "encoded model");
    queue.finish()?;

    let mut outputs = BTreeMap::new();
    for id in &model.outputs {
        outputs.insert(*id, tensor(&tensors, *id)?.read_f32()?);
    }
    Ok(outputs)
}
