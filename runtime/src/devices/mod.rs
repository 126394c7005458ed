//! Device implementations.

pub mod host;

pub use host::{HostCompiler, HostProgram};
