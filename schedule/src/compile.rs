//! Graph compilation: fusion first, then one kernel per remaining node.

use std::collections::{BTreeMap, BTreeSet};

use kiln_codegen::ops::{
    create_depthwise_convolution2d, create_elementwise, create_reduce_mean_channels, create_softmax1x1,
};
use kiln_codegen::{ElementwiseOp, ElementwiseOperand, GpuOperation, OperationDef};
use kiln_device::{Bhwdc, GpuInfo, StorageType, TensorDescriptor};
use kiln_dtype::CalculationsPrecision;
use smallvec::SmallVec;
use snafu::{OptionExt, ensure};
use tracing::debug;

use crate::error::{MissingDescriptorSnafu, Result, UnsupportedOperationSnafu};
use crate::fusion::{FusionMatch, try_mean_stddev_normalization};
use crate::graph::{Attributes, Graph, Node, OperationType, ValueId};

/// Tensor descriptor for each graph value, keyed by value id.
pub type Descriptors = BTreeMap<ValueId, TensorDescriptor>;

/// One compiled kernel and the graph values it reads and writes.
#[derive(Debug, Clone)]
pub struct GpuNode {
    pub name: String,
    pub operation: GpuOperation,
    pub inputs: SmallVec<[ValueId; 2]>,
    pub outputs: SmallVec<[ValueId; 1]>,
}

/// Kernels replacing a set of graph nodes.
#[derive(Debug, Clone, Default)]
pub struct GpuSubgraph {
    pub nodes: Vec<GpuNode>,
}

/// Compiled graph, in execution order.
#[derive(Debug, Clone)]
pub struct GpuModel {
    pub nodes: Vec<GpuNode>,
    pub inputs: Vec<ValueId>,
    pub outputs: Vec<ValueId>,
    pub descriptors: Descriptors,
}

/// Descriptors for every value of `graph` in one storage type at the precision's data type.
pub fn uniform_descriptors(graph: &Graph, precision: CalculationsPrecision, storage: StorageType) -> Descriptors {
    graph
        .values()
        .iter()
        .map(|value| {
            let descriptor = TensorDescriptor::new(precision.storage_data_type(), storage, Bhwdc::from(value.shape));
            (value.id, descriptor)
        })
        .collect()
}

pub(crate) fn operation_def(
    precision: CalculationsPrecision,
    descriptors: &Descriptors,
    inputs: &[ValueId],
    outputs: &[ValueId],
) -> Result<OperationDef> {
    let lookup = |id: &ValueId| {
        descriptors.get(id).map(TensorDescriptor::without_data).context(MissingDescriptorSnafu { id: *id })
    };
    let src = inputs.iter().map(lookup).collect::<Result<Vec<_>>>()?;
    let dst = outputs.iter().map(lookup).collect::<Result<Vec<_>>>()?;
    Ok(OperationDef::new(precision, src, dst))
}

fn elementwise_op(operation: OperationType) -> Option<ElementwiseOp> {
    match operation {
        OperationType::Add => Some(ElementwiseOp::Add),
        OperationType::Sub => Some(ElementwiseOp::Sub),
        OperationType::Mul => Some(ElementwiseOp::Mul),
        OperationType::Square => Some(ElementwiseOp::Square),
        OperationType::Rsqrt => Some(ElementwiseOp::Rsqrt),
        _ => None,
    }
}

/// Compile one node on its own.
pub fn select_operation(
    graph: &Graph,
    node: &Node,
    gpu_info: &GpuInfo,
    precision: CalculationsPrecision,
    descriptors: &Descriptors,
) -> Result<GpuNode> {
    let definition = operation_def(precision, descriptors, &node.inputs, &node.outputs)?;
    let src_shape = graph.value(node.inputs[0])?.shape;
    let dst_shape = graph.value(node.output())?.shape;
    let unsupported = |reason: &'static str| UnsupportedOperationSnafu { operation: node.operation, node: node.id, reason };

    let operation = match (node.operation, &node.attributes) {
        (OperationType::Softmax, Attributes::None) => create_softmax1x1(definition, gpu_info, src_shape)?,
        (OperationType::DepthwiseConvolution, Attributes::DepthwiseConvolution(attr)) => {
            create_depthwise_convolution2d(gpu_info, definition, attr)?
        }
        (OperationType::Mean, attributes) => {
            ensure!(attributes.reduces_channels_only(), unsupported("only channel means have a kernel"));
            create_reduce_mean_channels(definition, gpu_info, src_shape)?
        }
        (operation, attributes) => {
            let op = elementwise_op(operation).context(unsupported("no kernel for these attributes"))?;
            let operand = match (attributes, node.inputs.len()) {
                (Attributes::None, 1) if op.is_unary() => ElementwiseOperand::None,
                (Attributes::None, 2) if !op.is_unary() => {
                    // Only the second operand may broadcast a single channel.
                    ensure!(src_shape.c == dst_shape.c, unsupported("first operand broadcasting over one channel"));
                    ElementwiseOperand::Tensor
                }
                (Attributes::Scalar(value), 1) if !op.is_unary() => ElementwiseOperand::Scalar(*value),
                (Attributes::Linear(values), 1) if !op.is_unary() => {
                    // A per-channel constant cannot widen a single-channel input.
                    ensure!(
                        src_shape.c == dst_shape.c && values.len() == dst_shape.c,
                        unsupported("linear operand needs one value per input channel")
                    );
                    ElementwiseOperand::Linear(values.clone())
                }
                _ => return unsupported("operand combination").fail(),
            };
            create_elementwise(definition, gpu_info, op, operand)?
        }
    };

    debug!(node = %node.id, operation = %node.operation, kernel = operation.name(), "selected operation");
    Ok(GpuNode {
        name: format!("{}:{}", operation.name(), node.id),
        operation,
        inputs: node.inputs.clone(),
        outputs: node.outputs.clone(),
    })
}

/// Compile every node of `graph`, fusing normalization motifs where they match.
pub fn compile_graph(
    graph: &Graph,
    gpu_info: &GpuInfo,
    precision: CalculationsPrecision,
    descriptors: &Descriptors,
) -> Result<GpuModel> {
    let mut consumed = BTreeSet::new();
    let mut nodes = Vec::new();

    for node in graph.nodes() {
        if consumed.contains(&node.id) {
            continue;
        }
        if node.operation == OperationType::Mean {
            let attempt =
                try_mean_stddev_normalization(gpu_info, precision, graph, node.id, descriptors, &mut consumed)?;
            if let FusionMatch::Fused(subgraph) = attempt {
                nodes.extend(subgraph.nodes);
                continue;
            }
        }
        nodes.push(select_operation(graph, node, gpu_info, precision, descriptors)?);
        consumed.insert(node.id);
    }

    debug!(nodes = graph.nodes().len(), kernels = nodes.len(), "compiled graph");
    Ok(GpuModel { nodes, inputs: graph.inputs(), outputs: graph.outputs(), descriptors: descriptors.clone() })
}
