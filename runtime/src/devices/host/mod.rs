//! Host reference device.
//!
//! The compiler checks translated source the way a driver front end would reject it, and the
//! program emulates the kernel with per-work-group lane loops over tensors in their device layouts.

mod compiler;
mod program;

pub use compiler::HostCompiler;
pub use program::HostProgram;
