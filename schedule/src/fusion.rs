//! Fusion of the mean/standard-deviation normalization motif into one kernel.
//!
//! ```text
//!       input
//!       /    \
//!      |    mean
//!       \    /
//!        sub
//!       /    \
//!      |   square (or mul of centred by itself)
//!      |      |
//!      |     mean
//!      |      |
//!      |     add (variance bias)
//!      |      |
//!      |    rsqrt
//!      |      |
//!      |    [mul gamma]
//!       \    /
//!        mul
//!         |
//!    [mul gamma] [add beta]
//! ```
//!
//! Every intermediate edge must have exactly the consumers drawn above and must not be a graph
//! output. A rejected match leaves the graph and the consumed set untouched.

use std::collections::BTreeSet;

use kiln_codegen::Linear;
use kiln_codegen::ops::{create_layer_normalization, create_mean_stddev_normalization};
use kiln_codegen::{GpuOperation, NormalizationParams};
use kiln_device::GpuInfo;
use kiln_dtype::CalculationsPrecision;
use smallvec::{SmallVec, smallvec};
use tracing::debug;

use crate::compile::{Descriptors, GpuNode, GpuSubgraph, operation_def};
use crate::error::Result;
use crate::graph::{Graph, Node, NodeId, OperationType, Value, ValueId};

/// Outcome of a fusion attempt.
#[derive(Debug, Clone)]
pub enum FusionMatch {
    Fused(GpuSubgraph),
    /// The motif is not present at this node; the reason names the first failed check.
    NoMatch(&'static str),
}

impl FusionMatch {
    pub fn is_fused(&self) -> bool {
        matches!(self, Self::Fused(_))
    }
}

/// Matched normalization motif.
#[derive(Debug)]
struct Motif {
    input: ValueId,
    output: ValueId,
    variance_bias: f32,
    scale: Option<Linear>,
    shift: Option<Linear>,
    nodes: Vec<NodeId>,
}

type Reject = &'static str;

struct Walk<'g> {
    graph: &'g Graph,
    consumed: &'g BTreeSet<NodeId>,
    nodes: Vec<NodeId>,
}

impl<'g> Walk<'g> {
    fn new(graph: &'g Graph, consumed: &'g BTreeSet<NodeId>) -> Self {
        Self { graph, consumed, nodes: Vec::new() }
    }

    // Ids reachable from values are always in range.
    fn node(&self, id: NodeId) -> &'g Node {
        &self.graph.nodes()[id.0]
    }

    fn value(&self, id: ValueId) -> &'g Value {
        &self.graph.values()[id.0]
    }

    fn absorb(&mut self, node: &'g Node) -> Result<(), Reject> {
        if self.consumed.contains(&node.id) || self.nodes.contains(&node.id) {
            return Err("node_already_consumed");
        }
        self.nodes.push(node.id);
        Ok(())
    }

    fn intermediate_consumers(&self, id: ValueId) -> Result<SmallVec<[&'g Node; 2]>, Reject> {
        let value = self.value(id);
        if value.is_graph_output {
            return Err("intermediate_is_graph_output");
        }
        Ok(value.consumers.iter().map(|consumer| self.node(*consumer)).collect())
    }

    fn sole_consumer(&self, id: ValueId, reason: Reject) -> Result<&'g Node, Reject> {
        match self.intermediate_consumers(id)?.as_slice() {
            [node] => Ok(*node),
            _ => Err(reason),
        }
    }

    /// Optional affine node consuming `value` alone, with a per-channel constant of `channels` values.
    fn affine(&self, value: ValueId, operation: OperationType, channels: usize) -> Option<(&'g Node, &'g Linear)> {
        let node = self.sole_consumer(value, "").ok()?;
        let linear = node.attributes.linear()?;
        let fits = node.operation == operation
            && node.inputs.as_slice() == [value]
            && linear.len() == channels
            && !self.consumed.contains(&node.id);
        fits.then_some((node, linear))
    }

    fn run(mut self, first: &'g Node) -> Result<Motif, Reject> {
        if first.operation != OperationType::Mean || !first.attributes.reduces_channels_only() || first.inputs.len() != 1 {
            return Err("first_node_not_channel_mean");
        }
        self.absorb(first)?;
        let input = first.inputs[0];
        let mean = first.output();
        let channels = self.value(input).shape.c;

        let sub = self.sole_consumer(mean, "mean_consumers")?;
        if sub.operation != OperationType::Sub || sub.inputs.as_slice() != [input, mean] {
            return Err("sub_operands");
        }
        self.absorb(sub)?;
        let centred = sub.output();

        let consumers = self.intermediate_consumers(centred)?;
        let [a, b] = consumers.as_slice() else {
            return Err("centred_consumers");
        };
        let is_square = |node: &Node| match node.operation {
            OperationType::Square => node.inputs.as_slice() == [centred],
            OperationType::Mul => node.inputs.as_slice() == [centred, centred],
            _ => false,
        };
        let (square, last) = match (is_square(*a), is_square(*b)) {
            (true, false) => (*a, *b),
            (false, true) => (*b, *a),
            _ => return Err("square_missing"),
        };
        self.absorb(square)?;

        let variance = self.sole_consumer(square.output(), "square_consumers")?;
        if variance.operation != OperationType::Mean
            || !variance.attributes.reduces_channels_only()
            || variance.inputs.as_slice() != [square.output()]
        {
            return Err("variance_not_channel_mean");
        }
        self.absorb(variance)?;

        let bias = self.sole_consumer(variance.output(), "variance_consumers")?;
        let variance_bias = match (bias.operation, bias.attributes.scalar()) {
            (OperationType::Add, Some(value)) if bias.inputs.as_slice() == [variance.output()] => value,
            _ => return Err("variance_bias_not_scalar_add"),
        };
        if !variance_bias.is_finite() || variance_bias < 0.0 {
            return Err("variance_bias_value");
        }
        self.absorb(bias)?;

        let rsqrt = self.sole_consumer(bias.output(), "bias_consumers")?;
        if rsqrt.operation != OperationType::Rsqrt || rsqrt.inputs.as_slice() != [bias.output()] {
            return Err("rsqrt_missing");
        }
        self.absorb(rsqrt)?;

        let mut inv = rsqrt.output();
        let mut pre_scale = None;
        let mut next = self.sole_consumer(inv, "rsqrt_consumers")?;
        if next.id != last.id {
            let linear = next.attributes.linear().ok_or("rsqrt_consumers")?;
            if next.operation != OperationType::Mul || next.inputs.as_slice() != [inv] {
                return Err("rsqrt_consumers");
            }
            if linear.len() != channels {
                return Err("scale_length");
            }
            self.absorb(next)?;
            pre_scale = Some(linear.clone());
            inv = next.output();
            next = self.sole_consumer(inv, "scaled_rsqrt_consumers")?;
        }

        let operands = last.inputs.as_slice();
        let multiplies = operands == [centred, inv] || operands == [inv, centred];
        if next.id != last.id || last.operation != OperationType::Mul || !multiplies {
            return Err("final_mul_operands");
        }
        self.absorb(last)?;

        let mut output = last.output();
        let mut post_scale = None;
        if let Some((node, linear)) = self.affine(output, OperationType::Mul, channels) {
            self.absorb(node)?;
            post_scale = Some(linear.clone());
            output = node.output();
        }
        let mut shift = None;
        if let Some((node, linear)) = self.affine(output, OperationType::Add, channels) {
            self.absorb(node)?;
            shift = Some(linear.clone());
            output = node.output();
        }

        let scale = match (pre_scale, post_scale) {
            (Some(pre), Some(post)) => Some(pre.iter().zip(&post).map(|(a, b)| a * b).collect()),
            (pre, post) => pre.or(post),
        };
        Ok(Motif { input, output, variance_bias, scale, shift, nodes: self.nodes })
    }
}

/// Try to fuse the normalization motif rooted at the channel mean `first_node_id`.
///
/// On success every absorbed node id is added to `consumed`. A missing motif is a normal
/// [`FusionMatch::NoMatch`], not an error.
pub fn try_mean_stddev_normalization(
    gpu_info: &GpuInfo,
    precision: CalculationsPrecision,
    graph: &Graph,
    first_node_id: NodeId,
    descriptors: &Descriptors,
    consumed: &mut BTreeSet<NodeId>,
) -> Result<FusionMatch> {
    let first = graph.node(first_node_id)?;
    let motif = match Walk::new(graph, consumed).run(first) {
        Ok(motif) => motif,
        Err(reason) => {
            debug!(node = %first_node_id, reason, "mean/stddev normalization fusion rejected");
            return Ok(FusionMatch::NoMatch(reason));
        }
    };

    let definition = operation_def(precision, descriptors, &[motif.input], &[motif.output])?;
    let shape = graph.value(motif.input)?.shape;
    let params = NormalizationParams { variance_bias: motif.variance_bias, two_step: true };
    let operation: GpuOperation = if motif.scale.is_none() && motif.shift.is_none() {
        create_mean_stddev_normalization(definition, gpu_info, shape, params)?
    } else {
        let scale = motif.scale.unwrap_or_else(|| vec![1.0; shape.c]);
        let shift = motif.shift.unwrap_or_else(|| vec![0.0; shape.c]);
        create_layer_normalization(definition, gpu_info, shape, params, &scale, &shift)?
    };

    debug!(
        node = %first_node_id,
        absorbed = motif.nodes.len(),
        operation = operation.name(),
        "fused mean/stddev normalization"
    );
    consumed.extend(motif.nodes.iter().copied());
    let node = GpuNode {
        name: format!("{}:{}", operation.name(), first_node_id),
        operation,
        inputs: smallvec![motif.input],
        outputs: smallvec![motif.output],
    };
    Ok(FusionMatch::Fused(GpuSubgraph { nodes: vec![node] }))
}
