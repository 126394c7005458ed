//! Computation graph: nodes applying one primitive each, connected through values.
//!
//! Node and value ids are dense indices. Every value has at most one producer; values without a
//! producer are graph inputs. A value may additionally be marked as a graph output, in which case it
//! stays observable after execution and fusion must not swallow it.

use kiln_codegen::Linear;
use kiln_codegen::ops::DepthwiseConvolution2DAttributes;
use kiln_device::Bhwc;
use smallvec::SmallVec;
use snafu::{OptionExt, ensure};

use crate::error::{InvalidGraphSnafu, Result, UnknownNodeSnafu, UnknownValueSnafu};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(pub usize);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "n{}", self.0)
    }
}

impl std::fmt::Display for ValueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum OperationType {
    Add,
    Sub,
    Mul,
    Square,
    Rsqrt,
    Mean,
    Softmax,
    DepthwiseConvolution,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, strum::Display)]
pub enum Axis {
    Batch,
    Height,
    Width,
    Channels,
}

/// Per-node attributes.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Attributes {
    #[default]
    None,
    /// Axes a `Mean` reduces over.
    Reduce { axes: SmallVec<[Axis; 4]> },
    /// Constant second operand of an elementwise node.
    Scalar(f32),
    /// Per-channel constant second operand of an elementwise node.
    Linear(Linear),
    DepthwiseConvolution(DepthwiseConvolution2DAttributes),
}

impl Attributes {
    pub fn reduce(axes: impl IntoIterator<Item = Axis>) -> Self {
        Self::Reduce { axes: axes.into_iter().collect() }
    }

    /// Whether these are the attributes of a reduction over channels only.
    pub fn reduces_channels_only(&self) -> bool {
        matches!(self, Self::Reduce { axes } if axes.as_slice() == [Axis::Channels])
    }

    pub fn scalar(&self) -> Option<f32> {
        match self {
            Self::Scalar(value) => Some(*value),
            _ => None,
        }
    }

    pub fn linear(&self) -> Option<&Linear> {
        match self {
            Self::Linear(values) => Some(values),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: NodeId,
    pub operation: OperationType,
    pub attributes: Attributes,
    pub inputs: SmallVec<[ValueId; 2]>,
    pub outputs: SmallVec<[ValueId; 1]>,
}

impl Node {
    /// The single output every node in this graph model has.
    pub fn output(&self) -> ValueId {
        self.outputs[0]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Value {
    pub id: ValueId,
    pub shape: Bhwc,
    pub producer: Option<NodeId>,
    pub consumers: SmallVec<[NodeId; 2]>,
    pub is_graph_output: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Graph {
    nodes: Vec<Node>,
    values: Vec<Value>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a graph input of the given shape.
    pub fn add_input(&mut self, shape: Bhwc) -> ValueId {
        self.new_value(shape, None)
    }

    /// Append a node reading `inputs` and producing one new value of `output_shape`.
    pub fn add_node(
        &mut self,
        operation: OperationType,
        attributes: Attributes,
        inputs: &[ValueId],
        output_shape: Bhwc,
    ) -> Result<(NodeId, ValueId)> {
        ensure!(!inputs.is_empty(), InvalidGraphSnafu { reason: format!("{operation} node without inputs") });
        for input in inputs {
            self.value(*input)?;
        }

        let id = NodeId(self.nodes.len());
        let output = self.new_value(output_shape, Some(id));
        for input in inputs {
            let consumers = &mut self.values[input.0].consumers;
            // A node reading the same value twice is still one consumer.
            if !consumers.contains(&id) {
                consumers.push(id);
            }
        }
        self.nodes.push(Node {
            id,
            operation,
            attributes,
            inputs: inputs.iter().copied().collect(),
            outputs: SmallVec::from_elem(output, 1),
        });
        Ok((id, output))
    }

    pub fn mark_output(&mut self, id: ValueId) -> Result<()> {
        self.values.get_mut(id.0).context(UnknownValueSnafu { id })?.is_graph_output = true;
        Ok(())
    }

    pub fn node(&self, id: NodeId) -> Result<&Node> {
        self.nodes.get(id.0).context(UnknownNodeSnafu { id })
    }

    pub fn value(&self, id: ValueId) -> Result<&Value> {
        self.values.get(id.0).context(UnknownValueSnafu { id })
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Values no node produces.
    pub fn inputs(&self) -> Vec<ValueId> {
        self.values.iter().filter(|value| value.producer.is_none()).map(|value| value.id).collect()
    }

    pub fn outputs(&self) -> Vec<ValueId> {
        self.values.iter().filter(|value| value.is_graph_output).map(|value| value.id).collect()
    }

    fn new_value(&mut self, shape: Bhwc, producer: Option<NodeId>) -> ValueId {
        let id = ValueId(self.values.len());
        self.values.push(Value { id, shape, producer, consumers: SmallVec::new(), is_graph_output: false });
        id
    }
}
