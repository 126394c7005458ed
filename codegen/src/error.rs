//! Error types for kernel generation.

use snafu::Snafu;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors that can occur while building an operation.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// Malformed shape attributes, reported before any code is generated.
    #[snafu(display("invalid shape: {reason}"))]
    Shape { reason: String },

    /// Storage type, precision and device combination not implemented.
    #[snafu(display("unsupported configuration: {reason}"))]
    UnsupportedConfiguration { reason: String },

    /// Argument name not declared by the operation.
    #[snafu(display("unknown argument '{name}'"))]
    UnknownArgument { name: String },

    /// Argument declared with a different kind.
    #[snafu(display("argument '{name}' is not a {expected}"))]
    ArgumentKind { name: String, expected: &'static str },

    /// Error from the device layer.
    #[snafu(context(false), display("device error: {source}"))]
    Device { source: kiln_device::Error },
}
