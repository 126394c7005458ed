//! Error types for runtime execution.

use snafu::Snafu;

/// Result type for runtime operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors that can occur while compiling, binding or dispatching an operation.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// The device compiler rejected the kernel source.
    #[snafu(display("compilation of '{name}' failed: {reason}"))]
    Compilation { name: String, reason: String },

    /// Tensor or argument binding does not match what the operation declares.
    #[snafu(display("binding error: {reason}"))]
    Binding { reason: String },

    /// A dispatched program failed on the device.
    #[snafu(display("execution error: {reason}"))]
    Execution { reason: String },

    #[snafu(context(false), display("codegen error: {source}"))]
    Codegen { source: kiln_codegen::Error },

    #[snafu(context(false), display("device error: {source}"))]
    Device { source: kiln_device::Error },

    #[snafu(context(false), display("schedule error: {source}"))]
    Schedule { source: kiln_schedule::Error },
}
