//! Graph model and compilation for kiln.
//!
//! # Module Organization
//!
//! - [`graph`] - Nodes, values and their producer/consumer links
//! - [`fusion`] - Mean/standard-deviation normalization motif matching
//! - [`compile`] - Per-node kernel selection and whole-graph compilation
//!
//! ```ignore
//! let descriptors = uniform_descriptors(&graph, CalculationsPrecision::F32, StorageType::Buffer);
//! let model = compile_graph(&graph, &GpuInfo::adreno(), CalculationsPrecision::F32, &descriptors)?;
//! ```

pub mod compile;
pub mod error;
pub mod fusion;
pub mod graph;


pub use compile::{Descriptors, GpuModel, GpuNode, GpuSubgraph, compile_graph, select_operation, uniform_descriptors};
pub use error::{Error, Result};
pub use fusion::{FusionMatch, try_mean_stddev_normalization};
pub use graph::{Attributes, Axis, Graph, Node, NodeId, OperationType, Value, ValueId};
