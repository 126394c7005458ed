//! Devices: a tensor context, a kernel compiler and the cache of compiled programs.
//!
//! A [`Compiler`] turns translated kernel source into a [`Program`]; programs are looked up in the
//! device's [`ProgramCache`] by source text so identical kernels compile once per device.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use kiln_codegen::backend::{entry_point, translate};
use kiln_codegen::{GpuOperation, KernelParameter, OperationKind};
use kiln_device::{DeviceContext, DeviceMemory, GpuApi, GpuInfo, TensorLayout};
use kiln_dtype::{CalculationsPrecision, DataType};
use parking_lot::Mutex;
use tracing::debug;

use crate::devices::host::HostCompiler;
use crate::error::Result;

/// Translated kernel plus everything a compiler needs to know about it.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelSource {
    pub name: String,
    pub code: String,
    pub entry_point: &'static str,
    pub api: GpuApi,
    pub precision: CalculationsPrecision,
    pub kind: OperationKind,
    pub work_group_size: [usize; 3],
    pub parameters: Vec<KernelParameter>,
}

impl KernelSource {
    /// Translate `operation` for `api`.
    pub fn new(operation: &GpuOperation, api: GpuApi) -> Self {
        Self {
            name: operation.name().to_string(),
            code: translate(operation, api),
            entry_point: entry_point(api),
            api,
            precision: operation.definition().precision,
            kind: *operation.kind(),
            work_group_size: operation.work_group_size(),
            parameters: operation.kernel_parameters(),
        }
    }

    /// Whether the kernel declares a parameter called `name`.
    pub fn declares(&self, name: &str) -> bool {
        self.parameters.iter().any(|parameter| match parameter {
            KernelParameter::Tensor { name: declared, .. }
            | KernelParameter::Buffer { name: declared }
            | KernelParameter::Int { name: declared }
            | KernelParameter::Float { name: declared } => declared == name,
        })
    }
}

/// Tensor memory bound to a kernel parameter.
#[derive(Debug, Clone)]
pub struct LaunchTensor {
    pub memory: DeviceMemory,
    pub layout: TensorLayout,
}

/// Constant buffer bound to a kernel parameter.
#[derive(Debug, Clone)]
pub struct LaunchBuffer {
    pub memory: DeviceMemory,
    pub data_type: DataType,
}

/// One dispatch: geometry plus every bound parameter, keyed by parameter name.
#[derive(Debug, Clone, Default)]
pub struct Launch {
    pub grid: [usize; 3],
    pub work_group: [usize; 3],
    pub tensors: BTreeMap<String, LaunchTensor>,
    pub buffers: BTreeMap<String, LaunchBuffer>,
    pub ints: BTreeMap<String, i32>,
    pub floats: BTreeMap<String, f32>,
}

/// A compiled, executable kernel.
pub trait Program: Send + Sync + std::fmt::Debug {
    fn execute(&self, launch: &Launch) -> Result<()>;

    /// Kernel name (for debugging/profiling).
    fn name(&self) -> &str;
}

/// Turns translated kernel source into an executable program.
pub trait Compiler: Send + Sync + std::fmt::Debug {
    fn compile(&self, source: &KernelSource) -> Result<Box<dyn Program>>;
}

/// Compiled programs of one device, keyed by translated source.
#[derive(Debug, Default)]
pub struct ProgramCache {
    programs: Mutex<HashMap<String, Arc<dyn Program>>>,
}

impl ProgramCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached program for `source`, compiling it on a miss.
    pub fn get_or_compile(&self, source: &KernelSource, compiler: &dyn Compiler) -> Result<Arc<dyn Program>> {
        if let Some(program) = self.programs.lock().get(&source.code) {
            debug!(name = %source.name, "program cache hit");
            return Ok(Arc::clone(program));
        }

        let program: Arc<dyn Program> = Arc::from(compiler.compile(source)?);
        let mut programs = self.programs.lock();
        let program = programs.entry(source.code.clone()).or_insert(program);
        Ok(Arc::clone(program))
    }

    pub fn len(&self) -> usize {
        self.programs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.programs.lock().clear();
    }
}

/// A compilation and execution unit: tensor context, compiler and program cache.
#[derive(Debug)]
pub struct Device {
    context: DeviceContext,
    compiler: Arc<dyn Compiler>,
    cache: ProgramCache,
}

impl Device {
    pub fn new(context: DeviceContext, compiler: Arc<dyn Compiler>) -> Self {
        Self { context, compiler, cache: ProgramCache::new() }
    }

    /// Reference device emulating `info` in host memory.
    pub fn host(info: GpuInfo) -> Self {
        let context = DeviceContext::host(info);
        let compiler = Arc::new(HostCompiler::new(Arc::clone(&context.info)));
        Self::new(context, compiler)
    }

    pub fn context(&self) -> &DeviceContext {
        &self.context
    }

    pub fn info(&self) -> &GpuInfo {
        &self.context.info
    }

    pub fn cache(&self) -> &ProgramCache {
        &self.cache
    }

    /// Translate and compile `operation` for this device's API, through the cache.
    pub fn program(&self, operation: &GpuOperation) -> Result<Arc<dyn Program>> {
        let source = KernelSource::new(operation, self.info().api);
        self.cache.get_or_compile(&source, &*self.compiler)
    }
}
