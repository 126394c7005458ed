//! Error types for graph compilation.

use snafu::Snafu;

use crate::graph::{NodeId, OperationType, ValueId};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// Graph structure does not hold together.
    #[snafu(display("invalid graph: {reason}"))]
    InvalidGraph { reason: String },

    #[snafu(display("unknown node {id}"))]
    UnknownNode { id: NodeId },

    #[snafu(display("unknown value {id}"))]
    UnknownValue { id: ValueId },

    /// No descriptor was supplied for a value an operation reads or writes.
    #[snafu(display("no tensor descriptor for value {id}"))]
    MissingDescriptor { id: ValueId },

    /// Node type or attribute combination without a kernel.
    #[snafu(display("unsupported operation {operation} at node {node}: {reason}"))]
    UnsupportedOperation { operation: OperationType, node: NodeId, reason: String },

    /// Kernel generation failed.
    #[snafu(context(false), display("codegen error: {source}"))]
    Codegen { source: kiln_codegen::Error },
}
