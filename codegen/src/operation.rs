//! Compiled operations and their definitions.

use kiln_device::{Bhwdc, GpuInfo, StorageType, TensorDescriptor};
use kiln_dtype::{CalculationsPrecision, DataType};
use smallvec::SmallVec;
use snafu::ensure;

use crate::arguments::{Arguments, ArgumentsBinder, GpuObject};
use crate::error::{Result, ShapeSnafu, UnsupportedConfigurationSnafu};
use crate::reduce::mask_for_last_plane;

/// Precision plus one descriptor per source and destination slot.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationDef {
    pub precision: CalculationsPrecision,
    pub src_tensors: SmallVec<[TensorDescriptor; 2]>,
    pub dst_tensors: SmallVec<[TensorDescriptor; 1]>,
}

impl OperationDef {
    pub fn new(
        precision: CalculationsPrecision,
        src_tensors: impl IntoIterator<Item = TensorDescriptor>,
        dst_tensors: impl IntoIterator<Item = TensorDescriptor>,
    ) -> Self {
        Self { precision, src_tensors: src_tensors.into_iter().collect(), dst_tensors: dst_tensors.into_iter().collect() }
    }

    /// `src_count` sources and `dst_count` destinations, all in `storage` with the precision's data type.
    pub fn uniform(precision: CalculationsPrecision, storage: StorageType, src_count: usize, dst_count: usize) -> Self {
        let slot = TensorDescriptor::slot(precision.storage_data_type(), storage);
        Self::new(precision, std::iter::repeat_n(slot.clone(), src_count), std::iter::repeat_n(slot, dst_count))
    }

    pub fn primary_data_type(&self) -> DataType {
        self.src_tensors.first().map_or(self.precision.storage_data_type(), |src| src.data_type)
    }

    /// Check slot counts and that every slot can live on the device at this precision.
    pub(crate) fn validate(&self, info: &GpuInfo, src_count: usize, dst_count: usize) -> Result<()> {
        ensure!(
            self.src_tensors.len() == src_count && self.dst_tensors.len() == dst_count,
            ShapeSnafu {
                reason: format!(
                    "expected {src_count} source and {dst_count} destination slots, got {} and {}",
                    self.src_tensors.len(),
                    self.dst_tensors.len()
                )
            }
        );
        ensure!(
            !self.precision.needs_fp16() || info.supports_fp16,
            UnsupportedConfigurationSnafu { reason: format!("{} precision needs fp16 support on {info}", self.precision) }
        );
        for slot in self.src_tensors.iter().chain(&self.dst_tensors) {
            ensure!(
                info.is_storage_supported(slot.storage_type, slot.data_type),
                UnsupportedConfigurationSnafu {
                    reason: format!("{} {} tensors are not supported on {info}", slot.storage_type, slot.data_type)
                }
            );
        }
        Ok(())
    }
}

/// How constant depthwise weights are stored on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum WeightsStorage {
    Buffer,
    Texture2D,
}

/// Where a depthwise convolution reads its weights from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WeightsSource {
    /// Packed at construction into the `weights` object.
    Constant(WeightsStorage),
    /// Second source tensor of shape (1, kernel_y, kernel_x, channels).
    Dynamic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DepthwiseConvParams {
    /// Kernel size as (x, y, z).
    pub kernel: [usize; 3],
    pub strides: [usize; 3],
    pub dilations: [usize; 3],
    /// Padding prepended along (x, y, z).
    pub padding: [usize; 3],
    pub channel_multiplier: usize,
    pub weights: WeightsSource,
    pub is_3d: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormalizationParams {
    pub variance_bias: f32,
    /// Compute the variance from centred squares rather than `E[x^2] - mean^2`.
    pub two_step: bool,
}

impl Default for NormalizationParams {
    fn default() -> Self {
        Self { variance_bias: 1.0e-8, two_step: true }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ElementwiseOp {
    Add,
    Sub,
    Mul,
    Square,
    Rsqrt,
}

impl ElementwiseOp {
    pub const fn is_unary(self) -> bool {
        matches!(self, Self::Square | Self::Rsqrt)
    }

    pub fn apply(self, a: f32, b: f32) -> f32 {
        match self {
            Self::Add => a + b,
            Self::Sub => a - b,
            Self::Mul => a * b,
            Self::Square => a * a,
            Self::Rsqrt => 1.0 / a.sqrt(),
        }
    }
}

/// Second operand of a binary elementwise operation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SecondOperand {
    None,
    /// Second source tensor. With `broadcast` the kernel reads channel 0 of a 1-channel tensor for
    /// every slice, otherwise it reads the same slice as the first source.
    Tensor { broadcast: bool },
    /// Runtime scalar argument `scalar`.
    Scalar(f32),
    /// Per-channel constant in the `linear` object.
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ElementwiseParams {
    pub op: ElementwiseOp,
    pub operand: SecondOperand,
}

/// Closed set of supported primitives, each with its own parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OperationKind {
    DepthwiseConv(DepthwiseConvParams),
    Softmax1x1,
    MeanStdDevNormalization(NormalizationParams),
    /// Normalization followed by per-channel `scale` and `shift` objects.
    LayerNormalization(NormalizationParams),
    Elementwise(ElementwiseParams),
    /// Mean over channels into a 1-channel tensor.
    ReduceMean,
}

impl OperationKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::DepthwiseConv(params) if params.is_3d => "depthwise_conv3d",
            Self::DepthwiseConv(_) => "depthwise_conv2d",
            Self::Softmax1x1 => "softmax1x1",
            Self::MeanStdDevNormalization(_) => "mean_stddev_normalization",
            Self::LayerNormalization(_) => "layer_normalization",
            Self::Elementwise(_) => "elementwise",
            Self::ReduceMean => "reduce_mean",
        }
    }

    /// Whether the kernel reduces channel slices across one work group.
    pub fn uses_group_reduction(&self) -> bool {
        matches!(
            self,
            Self::Softmax1x1 | Self::MeanStdDevNormalization(_) | Self::LayerNormalization(_) | Self::ReduceMean
        )
    }
}

/// One kernel parameter as the backend declares it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelParameter {
    Tensor { name: String, storage: StorageType },
    Buffer { name: String },
    Int { name: String },
    Float { name: String },
}

/// A generated kernel: source text, launch geometry and named arguments.
///
/// Source and work-group size never change after construction. Shape-dependent scalars are
/// filled through [`GpuOperation::bind_arguments`] before each dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct GpuOperation {
    pub(crate) definition: OperationDef,
    pub(crate) kind: OperationKind,
    pub(crate) code: String,
    pub(crate) work_group_size: [usize; 3],
    pub(crate) args: Arguments,
    pub(crate) src_names: SmallVec<[String; 2]>,
    pub(crate) dst_names: SmallVec<[String; 1]>,
}

impl GpuOperation {
    pub(crate) fn new(definition: OperationDef, kind: OperationKind) -> Self {
        Self {
            definition,
            kind,
            code: String::new(),
            work_group_size: [1, 1, 1],
            args: Arguments::new(),
            src_names: SmallVec::new(),
            dst_names: SmallVec::new(),
        }
    }

    pub(crate) fn add_src_tensor(&mut self, name: &str) {
        self.src_names.push(name.to_string());
    }

    pub(crate) fn add_dst_tensor(&mut self, name: &str) {
        self.dst_names.push(name.to_string());
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn definition(&self) -> &OperationDef {
        &self.definition
    }

    pub fn kind(&self) -> &OperationKind {
        &self.kind
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn work_group_size(&self) -> [usize; 3] {
        self.work_group_size
    }

    pub fn args(&self) -> &Arguments {
        &self.args
    }

    pub fn src_names(&self) -> &[String] {
        &self.src_names
    }

    pub fn dst_names(&self) -> &[String] {
        &self.dst_names
    }

    /// Iteration space in work items for the given destination shapes.
    pub fn grid_size(&self, dst: &[Bhwdc]) -> [usize; 3] {
        let Some(dst) = dst.first() else { return [1, 1, 1] };
        match self.kind {
            OperationKind::DepthwiseConv(_) | OperationKind::Elementwise(_) => {
                [dst.w * dst.b, dst.h * dst.d, dst.slices()]
            }
            OperationKind::Softmax1x1 => [dst.slices(), dst.w * dst.b, dst.h],
            OperationKind::MeanStdDevNormalization(_)
            | OperationKind::LayerNormalization(_)
            | OperationKind::ReduceMean => [self.work_group_size[0], dst.w * dst.b, dst.h],
        }
    }

    /// Recompute the shape-dependent arguments from the current source shapes.
    pub fn bind_arguments(&self, binder: &mut dyn ArgumentsBinder, src: &[Bhwdc]) -> Result<()> {
        if !self.kind.uses_group_reduction() {
            return Ok(());
        }
        let channels = src.first().map_or(0, |shape| shape.c);
        ensure!(channels > 0, ShapeSnafu { reason: format!("{} needs a source tensor with channels", self.name()) });

        let mask = mask_for_last_plane(channels);
        for (name, value) in ["mask_x", "mask_y", "mask_z", "mask_w"].into_iter().zip(mask) {
            binder.set_float(name, value)?;
        }
        if !matches!(self.kind, OperationKind::Softmax1x1) {
            binder.set_float("inv_channels", 1.0 / channels as f32)?;
        }
        Ok(())
    }

    /// Check the shapes of the tensors bound to the slots against the kernel's iteration space.
    ///
    /// Sources must cover the destination in batch, width, height and depth, except where the
    /// kernel clamps its reads (depthwise convolution spatial axes). Channel counts must be the ones
    /// the generated source reads and writes.
    pub fn check_bound_shapes(&self, src: &[Bhwdc], dst: &[Bhwdc]) -> Result<()> {
        ensure!(
            src.len() == self.src_names.len() && dst.len() == self.dst_names.len(),
            ShapeSnafu {
                reason: format!(
                    "{} reads {} sources and writes {} destinations, got {} and {}",
                    self.name(),
                    self.src_names.len(),
                    self.dst_names.len(),
                    src.len(),
                    dst.len()
                )
            }
        );
        let (Some(input), Some(output)) = (src.first(), dst.first()) else { return Ok(()) };
        let shape_error = |reason: String| ShapeSnafu { reason: format!("{}: {reason}", self.name()) }.fail();
        let covers = |name: &str, shape: &Bhwdc| {
            if shape.b < output.b || shape.w < output.w || shape.h < output.h || shape.d < output.d {
                return shape_error(format!("{name} {shape} does not cover destination {output}"));
            }
            Ok(())
        };

        match self.kind {
            OperationKind::Softmax1x1
            | OperationKind::MeanStdDevNormalization(_)
            | OperationKind::LayerNormalization(_) => {
                covers(&self.src_names[0], input)?;
                if input.c != output.c {
                    return shape_error(format!("source has {} channels, destination {}", input.c, output.c));
                }
            }
            OperationKind::ReduceMean => {
                covers(&self.src_names[0], input)?;
                if output.c != 1 {
                    return shape_error(format!("destination must have 1 channel, got {}", output.c));
                }
            }
            OperationKind::Elementwise(params) => {
                covers(&self.src_names[0], input)?;
                if input.c != output.c {
                    return shape_error(format!("source has {} channels, destination {}", input.c, output.c));
                }
                if let (SecondOperand::Tensor { broadcast }, Some(second)) = (params.operand, src.get(1)) {
                    covers(&self.src_names[1], second)?;
                    let expected = if broadcast { 1 } else { output.c };
                    if second.c != expected {
                        return shape_error(format!(
                            "{} has {} channels, the kernel reads {expected}",
                            self.src_names[1], second.c
                        ));
                    }
                }
            }
            OperationKind::DepthwiseConv(params) => {
                if input.b < output.b {
                    return shape_error(format!("source batch {} is smaller than destination {}", input.b, output.b));
                }
                if input.c * params.channel_multiplier != output.c {
                    return shape_error(format!(
                        "{} source channels times multiplier {} do not give {} destination channels",
                        input.c, params.channel_multiplier, output.c
                    ));
                }
                if let (WeightsSource::Dynamic, Some(weights)) = (params.weights, src.get(1)) {
                    let expected = Bhwdc::new(1, params.kernel[1], params.kernel[0], 1, output.c);
                    if *weights != expected {
                        return shape_error(format!("weights tensor is {weights}, expected {expected}"));
                    }
                }
            }
        }
        Ok(())
    }

    /// Parameters the backend declares for the entry point, tensors first.
    pub fn kernel_parameters(&self) -> Vec<KernelParameter> {
        let tensors = self
            .src_names
            .iter()
            .zip(&self.definition.src_tensors)
            .chain(self.dst_names.iter().zip(&self.definition.dst_tensors))
            .map(|(name, slot)| KernelParameter::Tensor { name: name.clone(), storage: slot.storage_type });
        let objects = self.args.objects().map(|(name, object)| match object {
            GpuObject::Buffer { .. } => KernelParameter::Buffer { name: name.to_string() },
            GpuObject::Tensor(descriptor) => {
                KernelParameter::Tensor { name: name.to_string(), storage: descriptor.storage_type }
            }
        });
        let scalars = self.args.scalar_names().map(|name| {
            if self.args.is_int(name) {
                KernelParameter::Int { name: name.to_string() }
            } else {
                KernelParameter::Float { name: name.to_string() }
            }
        });
        tensors.chain(objects).chain(scalars).collect()
    }

    /// Names `args.<name>` may refer to.
    pub fn is_argument_declared(&self, name: &str) -> bool {
        self.args.is_declared(name) || self.src_names.iter().chain(&self.dst_names).any(|tensor| tensor == name)
    }
}
