//! Reference execution of generated kernels.
//!
//! Every kernel kind is replayed the way its source runs: reduction kernels loop over the lanes of
//! one work group and combine the lane partials with the same staged reduction the source emits;
//! per-pixel kernels loop over the grid. Scalars come from the launch, never from the operation, so
//! an unbound or stale argument shows up in the results.
//!
//! Channels past the logical channel count read as zero and are never written.

use kiln_codegen::{
    DepthwiseConvParams, ElementwiseParams, NormalizationParams, OperationKind, ReduceOp, SecondOperand, WeightsSource,
    WeightsStorage, reduce_group,
};
use kiln_device::{Bhwdc, DeviceMemory, TensorLayout};
use snafu::{OptionExt, ensure};
use tracing::trace;

use crate::device::{KernelSource, Launch, LaunchBuffer, LaunchTensor, Program};
use crate::error::{ExecutionSnafu, Result};

type Float4 = [f32; 4];

fn dot(a: Float4, b: Float4) -> f32 {
    a.iter().zip(b).map(|(a, b)| a * b).sum()
}

/// Host copy of one bound tensor in its device layout.
struct TensorData {
    layout: TensorLayout,
    bytes: Vec<u8>,
}

impl TensorData {
    fn load(name: &str, tensor: &LaunchTensor) -> Result<Self> {
        let bytes = tensor.memory.with_bytes(|bytes| bytes.to_vec());
        let needed = tensor.layout.size_in_bytes();
        ensure!(
            bytes.len() >= needed,
            ExecutionSnafu { reason: format!("{name} holds {} bytes, its layout needs {needed}", bytes.len()) }
        );
        Ok(Self { layout: tensor.layout, bytes })
    }

    fn shape(&self) -> Bhwdc {
        self.layout.shape
    }

    /// Byte range of element `c` of pixel (b, x, y, d), failing outside the tensor.
    fn element_range(&self, b: usize, x: usize, y: usize, d: usize, c: usize) -> Result<std::ops::Range<usize>> {
        let shape = self.layout.shape;
        ensure!(
            b < shape.b && x < shape.w && y < shape.h && d < shape.d,
            ExecutionSnafu { reason: format!("pixel (b={b}, x={x}, y={y}, d={d}) is outside a {shape} tensor") }
        );
        let offset = self.layout.element_offset(b, x, y, d, c);
        let range = offset..offset + self.layout.data_type.size();
        ensure!(
            range.end <= self.bytes.len(),
            ExecutionSnafu { reason: format!("element at byte {offset} is past the {} bytes held", self.bytes.len()) }
        );
        Ok(range)
    }

    fn read(&self, b: usize, x: usize, y: usize, d: usize, c: usize) -> Result<f32> {
        if c >= self.layout.shape.c {
            return Ok(0.0);
        }
        let range = self.element_range(b, x, y, d, c)?;
        Ok(self.layout.data_type.read_f32(&self.bytes[range]))
    }

    fn read_slice(&self, b: usize, x: usize, y: usize, d: usize, s: usize) -> Result<Float4> {
        let mut values = [0.0; 4];
        for (lane, value) in values.iter_mut().enumerate() {
            *value = self.read(b, x, y, d, s * 4 + lane)?;
        }
        Ok(values)
    }

    fn write_slice(&mut self, b: usize, x: usize, y: usize, d: usize, s: usize, value: Float4) -> Result<()> {
        for (lane, value) in value.into_iter().enumerate() {
            let c = s * 4 + lane;
            if c >= self.layout.shape.c {
                break;
            }
            let range = self.element_range(b, x, y, d, c)?;
            self.layout.data_type.write_f32(value, &mut self.bytes[range]);
        }
        Ok(())
    }

    fn store(&self, memory: &DeviceMemory) -> Result<()> {
        Ok(memory.copyin(&self.bytes)?)
    }
}

/// Host copy of a constant buffer as 4-lane entries.
struct BufferData {
    name: String,
    values: Vec<f32>,
}

impl BufferData {
    fn load(name: &str, buffer: &LaunchBuffer) -> Self {
        let values = buffer.memory.with_bytes(|bytes| buffer.data_type.decode(bytes));
        Self { name: name.to_string(), values }
    }

    fn read(&self, entry: usize) -> Result<Float4> {
        let lanes = self.values.get(entry * 4..entry * 4 + 4).with_context(|| ExecutionSnafu {
            reason: format!("{} has no entry {entry}", self.name),
        })?;
        Ok([lanes[0], lanes[1], lanes[2], lanes[3]])
    }
}

/// Named lookups into one launch.
struct Bindings<'a> {
    launch: &'a Launch,
}

impl Bindings<'_> {
    fn tensor(&self, name: &str) -> Result<TensorData> {
        let tensor = self
            .launch
            .tensors
            .get(name)
            .with_context(|| ExecutionSnafu { reason: format!("tensor {name} is not bound") })?;
        TensorData::load(name, tensor)
    }

    fn dst_memory(&self) -> Result<&DeviceMemory> {
        let tensor = self
            .launch
            .tensors
            .get("dst_tensor")
            .with_context(|| ExecutionSnafu { reason: "tensor dst_tensor is not bound" })?;
        Ok(&tensor.memory)
    }

    fn buffer(&self, name: &str) -> Result<BufferData> {
        let buffer = self
            .launch
            .buffers
            .get(name)
            .with_context(|| ExecutionSnafu { reason: format!("buffer {name} is not bound") })?;
        Ok(BufferData::load(name, buffer))
    }

    fn int(&self, name: &str) -> Result<usize> {
        let value = *self
            .launch
            .ints
            .get(name)
            .with_context(|| ExecutionSnafu { reason: format!("int argument {name} is not bound") })?;
        usize::try_from(value)
            .ok()
            .with_context(|| ExecutionSnafu { reason: format!("int argument {name} is negative: {value}") })
    }

    /// Like [`Bindings::int`], for arguments only 3D kernels declare.
    fn int_or(&self, name: &str, default: usize) -> Result<usize> {
        if self.launch.ints.contains_key(name) { self.int(name) } else { Ok(default) }
    }

    fn float(&self, name: &str) -> Result<f32> {
        self.launch
            .floats
            .get(name)
            .copied()
            .with_context(|| ExecutionSnafu { reason: format!("float argument {name} is not bound") })
    }

    fn mask(&self) -> Result<Float4> {
        Ok([self.float("mask_x")?, self.float("mask_y")?, self.float("mask_z")?, self.float("mask_w")?])
    }

    fn ensure_grid(&self, needed: [usize; 3]) -> Result<()> {
        let grid = self.launch.grid;
        ensure!(
            grid.iter().zip(needed).all(|(grid, needed)| *grid >= needed),
            ExecutionSnafu { reason: format!("grid {grid:?} does not cover {needed:?}") }
        );
        Ok(())
    }
}

/// Lane partials and the mask of the slice each lane visits, for one pixel of a reduction kernel.
struct GroupPixel<'a> {
    src: &'a TensorData,
    mask: Float4,
    lanes: usize,
    b: usize,
    x: usize,
    y: usize,
}

impl GroupPixel<'_> {
    fn slices(&self) -> usize {
        self.src.shape().slices()
    }

    fn mask_for(&self, s: usize) -> Float4 {
        if s + 1 == self.slices() { self.mask } else { [1.0; 4] }
    }

    fn slice(&self, s: usize) -> Result<Float4> {
        self.src.read_slice(self.b, self.x, self.y, 0, s)
    }

    /// Run `body` for every slice a lane visits, then reduce the lane values across the group.
    fn reduce(&self, init: f32, op: ReduceOp, mut body: impl FnMut(f32, usize) -> Result<f32>) -> Result<f32> {
        let partials = (0..self.lanes)
            .map(|tid| (tid..self.slices()).step_by(self.lanes).try_fold(init, &mut body))
            .collect::<Result<Vec<f32>>>()?;
        Ok(reduce_group(&partials, op)?)
    }
}

/// A program of the host device: the kernel source it was compiled from, replayed on launch.
#[derive(Debug, Clone)]
pub struct HostProgram {
    source: KernelSource,
}

impl HostProgram {
    pub fn new(source: KernelSource) -> Self {
        Self { source }
    }

    pub fn source(&self) -> &KernelSource {
        &self.source
    }

    fn for_each_pixel(shape: Bhwdc, mut f: impl FnMut(usize, usize, usize) -> Result<()>) -> Result<()> {
        for b in 0..shape.b {
            for y in 0..shape.h {
                for x in 0..shape.w {
                    f(b, x, y)?;
                }
            }
        }
        Ok(())
    }

    fn group_lanes(launch: &Launch) -> usize {
        launch.work_group[0].max(1)
    }

    fn softmax(&self, bindings: &Bindings<'_>) -> Result<()> {
        let src = bindings.tensor("src_tensor")?;
        let mut dst = bindings.tensor("dst_tensor")?;
        let shape = dst.shape();
        bindings.ensure_grid([shape.slices(), shape.w * shape.b, shape.h])?;
        let mask = bindings.mask()?;
        let lanes = Self::group_lanes(bindings.launch);

        Self::for_each_pixel(shape, |b, x, y| {
            let pixel = GroupPixel { src: &src, mask, lanes, b, x, y };
            let first = src.read(b, x, y, 0, 0)?;
            let maximum = pixel.reduce(first, ReduceOp::Max, |acc, s| {
                let (mask_a, values) = (pixel.mask_for(s), pixel.slice(s)?);
                Ok((0..4).map(|i| values[i] * mask_a[i] + (1.0 - mask_a[i]) * values[0]).fold(acc, f32::max))
            })?;
            let sum = pixel.reduce(0.0, ReduceOp::Sum, |acc, s| {
                Ok(acc + dot(pixel.mask_for(s), pixel.slice(s)?.map(|v| (v - maximum).exp())))
            })?;
            let inv = 1.0 / sum;
            for s in 0..shape.slices() {
                dst.write_slice(b, x, y, 0, s, pixel.slice(s)?.map(|v| (v - maximum).exp() * inv))?;
            }
            Ok(())
        })?;
        dst.store(bindings.dst_memory()?)
    }

    fn normalization(&self, bindings: &Bindings<'_>, params: NormalizationParams, affine: bool) -> Result<()> {
        let src = bindings.tensor("src_tensor")?;
        let mut dst = bindings.tensor("dst_tensor")?;
        let shape = dst.shape();
        let lanes = Self::group_lanes(bindings.launch);
        bindings.ensure_grid([lanes, shape.w * shape.b, shape.h])?;
        let mask = bindings.mask()?;
        let inv_channels = bindings.float("inv_channels")?;
        let variance_bias = bindings.float("variance_bias")?;
        let scale_shift = if affine { Some((bindings.buffer("scale")?, bindings.buffer("shift")?)) } else { None };

        Self::for_each_pixel(shape, |b, x, y| {
            let pixel = GroupPixel { src: &src, mask, lanes, b, x, y };
            let sum = pixel.reduce(0.0, ReduceOp::Sum, |acc, s| Ok(acc + dot(pixel.mask_for(s), pixel.slice(s)?)))?;
            let mean = sum * inv_channels;
            let variance = if params.two_step {
                let sum_diff_sq = pixel.reduce(0.0, ReduceOp::Sum, |acc, s| {
                    let mask_a = pixel.mask_for(s);
                    let values = pixel.slice(s)?;
                    let diff: Float4 = std::array::from_fn(|i| (values[i] - mean) * mask_a[i]);
                    Ok(acc + dot(diff, diff))
                })?;
                sum_diff_sq * inv_channels
            } else {
                let sum_sq = pixel.reduce(0.0, ReduceOp::Sum, |acc, s| {
                    Ok(acc + dot(pixel.mask_for(s), pixel.slice(s)?.map(|v| v * v)))
                })?;
                sum_sq * inv_channels - mean * mean
            };
            let stddev_inv = 1.0 / (variance + variance_bias).sqrt();

            for s in 0..src.shape().slices() {
                let mut result = pixel.slice(s)?.map(|v| (v - mean) * stddev_inv);
                if let Some((scale, shift)) = &scale_shift {
                    let (scale, shift) = (scale.read(s)?, shift.read(s)?);
                    result = std::array::from_fn(|i| result[i] * scale[i] + shift[i]);
                }
                dst.write_slice(b, x, y, 0, s, result)?;
            }
            Ok(())
        })?;
        dst.store(bindings.dst_memory()?)
    }

    fn reduce_mean(&self, bindings: &Bindings<'_>) -> Result<()> {
        let src = bindings.tensor("src_tensor")?;
        let mut dst = bindings.tensor("dst_tensor")?;
        let shape = dst.shape();
        let lanes = Self::group_lanes(bindings.launch);
        bindings.ensure_grid([lanes, shape.w * shape.b, shape.h])?;
        let mask = bindings.mask()?;
        let inv_channels = bindings.float("inv_channels")?;

        Self::for_each_pixel(shape, |b, x, y| {
            let pixel = GroupPixel { src: &src, mask, lanes, b, x, y };
            let sum = pixel.reduce(0.0, ReduceOp::Sum, |acc, s| Ok(acc + dot(pixel.mask_for(s), pixel.slice(s)?)))?;
            dst.write_slice(b, x, y, 0, 0, [sum * inv_channels, 0.0, 0.0, 0.0])
        })?;
        dst.store(bindings.dst_memory()?)
    }

    fn elementwise(&self, bindings: &Bindings<'_>, params: ElementwiseParams) -> Result<()> {
        let src = bindings.tensor("src_tensor")?;
        let mut dst = bindings.tensor("dst_tensor")?;
        let shape = dst.shape();
        bindings.ensure_grid([shape.w * shape.b, shape.h * shape.d, shape.slices()])?;

        let (second, broadcast) = match params.operand {
            SecondOperand::Tensor { broadcast } => (Some(bindings.tensor("second_tensor")?), broadcast),
            _ => (None, false),
        };
        let scalar = match params.operand {
            SecondOperand::Scalar(_) => bindings.float("scalar")?,
            _ => 0.0,
        };
        let linear = match params.operand {
            SecondOperand::Linear => Some(bindings.buffer("linear")?),
            _ => None,
        };

        Self::for_each_pixel(shape, |b, x, y| {
            for d in 0..shape.d {
                for s in 0..shape.slices() {
                    let in0 = src.read_slice(b, x, y, d, s)?;
                    let in1 = match (&second, &linear) {
                        (Some(second), _) if broadcast => [second.read(b, x, y, d, 0)?; 4],
                        (Some(second), _) => second.read_slice(b, x, y, d, s)?,
                        (None, Some(linear)) => linear.read(s)?,
                        (None, None) => [scalar; 4],
                    };
                    let result = std::array::from_fn(|i| params.op.apply(in0[i], in1[i]));
                    dst.write_slice(b, x, y, d, s, result)?;
                }
            }
            Ok(())
        })?;
        dst.store(bindings.dst_memory()?)
    }

    fn depthwise(&self, bindings: &Bindings<'_>, params: DepthwiseConvParams) -> Result<()> {
        let src = bindings.tensor("src_tensor")?;
        let mut dst = bindings.tensor("dst_tensor")?;
        let shape = dst.shape();
        bindings.ensure_grid([shape.w * shape.b, shape.h * shape.d, shape.slices()])?;

        let kernel = [bindings.int("kernel_size_x")?, bindings.int("kernel_size_y")?, bindings.int_or("kernel_size_z", 1)?];
        let stride = [bindings.int("stride_x")?, bindings.int("stride_y")?, bindings.int_or("stride_z", 1)?];
        let padding = [bindings.int("padding_x")?, bindings.int("padding_y")?, bindings.int_or("padding_z", 0)?];
        let dilation = [bindings.int("dilation_x")?, bindings.int("dilation_y")?, bindings.int_or("dilation_z", 1)?];
        let multiplier = bindings.int("ch_multiplier")?.max(1);
        let biases = bindings.buffer("biases")?;
        let weights = match params.weights {
            WeightsSource::Dynamic => Weights::Tensor(bindings.tensor("weights_tensor")?),
            WeightsSource::Constant(WeightsStorage::Buffer) => Weights::Buffer(bindings.buffer("weights")?),
            WeightsSource::Constant(WeightsStorage::Texture2D) => Weights::Texture(bindings.tensor("weights")?),
        };
        let accumulator = self.source.precision.accumulator_data_type();
        let source = src.shape();
        let area = kernel.iter().product::<usize>();

        let coordinate = |out: usize, k: usize, axis: usize, extent: usize| {
            let c = (out * stride[axis] + k * dilation[axis]) as isize - padding[axis] as isize;
            usize::try_from(c).ok().filter(|c| *c < extent)
        };

        Self::for_each_pixel(shape, |b, x, y| {
            for z in 0..shape.d {
                for s in 0..shape.slices() {
                    let mut r = [0.0f32; 4];
                    for kz in 0..kernel[2] {
                        let Some(z_c) = coordinate(z, kz, 2, source.d) else { continue };
                        for ky in 0..kernel[1] {
                            let Some(y_c) = coordinate(y, ky, 1, source.h) else { continue };
                            for kx in 0..kernel[0] {
                                let Some(x_c) = coordinate(x, kx, 0, source.w) else { continue };
                                let src_final: Float4 = if multiplier == 1 {
                                    src.read_slice(b, x_c, y_c, z_c, s)?
                                } else {
                                    let mut values = [0.0; 4];
                                    for (i, value) in values.iter_mut().enumerate() {
                                        *value = src.read(b, x_c, y_c, z_c, (s * 4 + i) / multiplier)?;
                                    }
                                    values
                                };
                                let position = (kz * kernel[1] + ky) * kernel[0] + kx;
                                let f = match &weights {
                                    Weights::Tensor(tensor) => tensor.read_slice(0, kx, ky, 0, s)?,
                                    Weights::Buffer(buffer) => buffer.read(s * area + position)?,
                                    Weights::Texture(texture) => texture.read_slice(0, position, s, 0, 0)?,
                                };
                                for i in 0..4 {
                                    r[i] = accumulator.round(r[i] + accumulator.round(src_final[i] * f[i]));
                                }
                            }
                        }
                    }
                    let bias = biases.read(s)?;
                    dst.write_slice(b, x, y, z, s, std::array::from_fn(|i| r[i] + bias[i]))?;
                }
            }
            Ok(())
        })?;
        dst.store(bindings.dst_memory()?)
    }
}

enum Weights {
    Tensor(TensorData),
    Buffer(BufferData),
    Texture(TensorData),
}

impl Program for HostProgram {
    fn execute(&self, launch: &Launch) -> Result<()> {
        trace!(name = %self.source.name, grid = ?launch.grid, work_group = ?launch.work_group, "host dispatch");
        let bindings = Bindings { launch };
        match self.source.kind {
            OperationKind::Softmax1x1 => self.softmax(&bindings),
            OperationKind::MeanStdDevNormalization(params) => self.normalization(&bindings, params, false),
            OperationKind::LayerNormalization(params) => self.normalization(&bindings, params, true),
            OperationKind::ReduceMean => self.reduce_mean(&bindings),
            OperationKind::Elementwise(params) => self.elementwise(&bindings, params),
            OperationKind::DepthwiseConv(params) => self.depthwise(&bindings, params),
        }
    }

    fn name(&self) -> &str {
        &self.source.name
    }
}
