//! Execution of generated kernels for kiln.
//!
//! A [`ComputeTask`] owns one [`GpuOperation`](kiln_codegen::GpuOperation), binds tensors to its
//! slots, compiles it through a [`Device`] and encodes dispatches onto a [`CommandQueue`].
//! [`execute_model`] runs a whole compiled graph.
//!
//! # Devices
//!
//! [`Device::host`] builds the reference device: kernel source is checked by
//! [`devices::HostCompiler`] and replayed in host memory by [`devices::HostProgram`].
//!
//! ```ignore
//! let device = Device::host(GpuInfo::adreno());
//! let mut task = ComputeTask::init(operation);
//! task.bind(&[&src], &[&dst])?;
//! task.compile(&device)?;
//! task.update_params()?;
//! let mut queue = HostQueue::new();
//! task.encode(&mut queue)?;
//! queue.finish()?;
//! ```

pub mod binder;
pub mod compute_task;
pub mod device;
pub mod devices;
pub mod error;
pub mod model;
pub mod queue;


pub use binder::ArgumentBinder;
pub use compute_task::{ComputeTask, IndirectCommandBuffer, execute_operation};
pub use device::{Compiler, Device, KernelSource, Launch, LaunchBuffer, LaunchTensor, Program, ProgramCache};
pub use error::{Error, Result};
pub use model::execute_model;
pub use queue::{CommandQueue, HostQueue};
