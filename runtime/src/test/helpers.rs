//! Tensors, devices and float references shared by the runtime tests.

use std::sync::Arc;

use kiln_codegen::ops::DepthwiseConvolution2DAttributes;
use kiln_codegen::{GpuOperation, Ohwdi, Weights};
use kiln_device::{Bhwc, Bhwdc, DispatchEvent, ExecutionObserver, GpuInfo, StorageType, TensorDescriptor};
use kiln_dtype::DataType;
use kiln_schedule::{Attributes, Axis, Graph, OperationType, ValueId};
use parking_lot::Mutex;

use crate::{Device, execute_operation};

pub const VARIANCE_BIAS: f32 = 1.0e-5;

pub fn device() -> Device {
    Device::host(GpuInfo::generic())
}

/// Deterministic values in [-3, 3] without long runs of equal numbers.
pub fn ramp(len: usize) -> Vec<f32> {
    (0..len).map(|i| ((i * 7 + 3) % 13) as f32 * 0.5 - 3.0).collect()
}

pub fn descriptor(storage: StorageType, shape: impl Into<Bhwdc>, values: &[f32]) -> TensorDescriptor {
    let mut descriptor = TensorDescriptor::new(DataType::Float32, storage, shape.into());
    descriptor.upload_f32(values).unwrap();
    descriptor
}

pub fn empty(storage: StorageType, shape: impl Into<Bhwdc>) -> TensorDescriptor {
    TensorDescriptor::new(DataType::Float32, storage, shape.into())
}

/// Run `operation` once on `device` and return the destination as flat floats.
pub fn run(device: &Device, operation: GpuOperation, src: &[TensorDescriptor], dst: TensorDescriptor) -> Vec<f32> {
    let mut dst = [dst];
    execute_operation(device, operation, src, &mut dst).unwrap();
    dst[0].to_f32()
}

pub fn assert_close(actual: &[f32], expected: &[f32], tolerance: f32) {
    assert_eq!(actual.len(), expected.len(), "length mismatch");
    for (index, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!((a - e).abs() <= tolerance, "element {index}: got {a}, expected {e}\nactual:   {actual:?}\nexpected: {expected:?}");
    }
}

pub fn softmax_reference(values: &[f32], channels: usize) -> Vec<f32> {
    values
        .chunks(channels)
        .flat_map(|pixel| {
            let max = pixel.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let sum: f32 = pixel.iter().map(|v| (v - max).exp()).sum();
            pixel.iter().map(move |v| (v - max).exp() / sum).collect::<Vec<_>>()
        })
        .collect()
}

pub fn normalization_reference(values: &[f32], channels: usize, affine: Option<(&[f32], &[f32])>) -> Vec<f32> {
    values
        .chunks(channels)
        .flat_map(|pixel| {
            let mean = pixel.iter().sum::<f32>() / channels as f32;
            let variance = pixel.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / channels as f32;
            let inv = 1.0 / (variance + VARIANCE_BIAS).sqrt();
            pixel
                .iter()
                .enumerate()
                .map(|(c, v)| {
                    let normalized = (v - mean) * inv;
                    affine.map_or(normalized, |(scale, shift)| normalized * scale[c] + shift[c])
                })
                .collect::<Vec<_>>()
        })
        .collect()
}

pub fn channel_mean_reference(values: &[f32], channels: usize) -> Vec<f32> {
    values.chunks(channels).map(|pixel| pixel.iter().sum::<f32>() / channels as f32).collect()
}

/// Direct 2D depthwise convolution over flat BHWC input.
pub fn depthwise_reference(src: &[f32], shape: Bhwc, attr: &DepthwiseConvolution2DAttributes) -> Vec<f32> {
    let out = attr.output_shape(shape).unwrap();
    let weights = attr.weights.shape;
    let (stride, dilation, padding) = (attr.strides, attr.dilations, attr.padding_prepended);
    let mut dst = Vec::with_capacity(out.b * out.h * out.w * out.c);
    for b in 0..out.b {
        for y in 0..out.h {
            for x in 0..out.w {
                for d in 0..out.c {
                    let mut sum = attr.bias.get(d).copied().unwrap_or(0.0);
                    for ky in 0..weights.h {
                        for kx in 0..weights.w {
                            let sy = (y as i32 * stride.h + ky as i32 * dilation.h) - padding.h;
                            let sx = (x as i32 * stride.w + kx as i32 * dilation.w) - padding.w;
                            if sy < 0 || sx < 0 || sy >= shape.h as i32 || sx >= shape.w as i32 {
                                continue;
                            }
                            let channel = d / weights.o;
                            let value = src[((b * shape.h + sy as usize) * shape.w + sx as usize) * shape.c + channel];
                            sum += value * attr.weights.data[weights.linear_index(d % weights.o, ky, kx, channel)];
                        }
                    }
                    dst.push(sum);
                }
            }
        }
    }
    dst
}

/// Direct 3D depthwise convolution with unit strides and dilations over flat BHWDC input.
pub fn depthwise3d_reference(src: &[f32], shape: Bhwdc, weights: &Weights<Ohwdi>, padding: [usize; 3]) -> Vec<f32> {
    let k = weights.shape;
    let out = Bhwdc::new(
        shape.b,
        shape.h + 2 * padding[1] + 1 - k.h,
        shape.w + 2 * padding[0] + 1 - k.w,
        shape.d + 2 * padding[2] + 1 - k.d,
        k.o * k.i,
    );
    let mut dst = vec![0.0; out.elements()];
    for b in 0..out.b {
        for y in 0..out.h {
            for x in 0..out.w {
                for z in 0..out.d {
                    for c in 0..out.c {
                        let mut sum = 0.0;
                        for ky in 0..k.h {
                            for kx in 0..k.w {
                                for kz in 0..k.d {
                                    let (sy, sx, sz) = (y + ky, x + kx, z + kz);
                                    if sy < padding[1] || sx < padding[0] || sz < padding[2] {
                                        continue;
                                    }
                                    let (sy, sx, sz) = (sy - padding[1], sx - padding[0], sz - padding[2]);
                                    if sy >= shape.h || sx >= shape.w || sz >= shape.d {
                                        continue;
                                    }
                                    let value = src[shape.linear_index(b, sy, sx, sz, c / k.o)];
                                    sum += value * weights.data[k.linear_index(c % k.o, ky, kx, kz, c / k.o)];
                                }
                            }
                        }
                        dst[out.linear_index(b, y, x, z, c)] = sum;
                    }
                }
            }
        }
    }
    dst
}

/// Records every dispatch it is told about.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    pub dispatches: Mutex<Vec<DispatchEvent>>,
}

impl ExecutionObserver for RecordingObserver {
    fn on_dispatch(&self, event: &DispatchEvent) {
        self.dispatches.lock().push(event.clone());
    }
}

pub fn observed_device() -> (Device, Arc<RecordingObserver>) {
    let observer = Arc::new(RecordingObserver::default());
    let context = kiln_device::DeviceContext::host(GpuInfo::generic()).with_observer(observer.clone());
    let compiler = Arc::new(crate::devices::HostCompiler::new(Arc::clone(&context.info)));
    (Device::new(context, compiler), observer)
}

fn node(graph: &mut Graph, operation: OperationType, attributes: Attributes, inputs: &[ValueId], shape: Bhwc) -> ValueId {
    graph.add_node(operation, attributes, inputs, shape).unwrap().1
}

/// Mean/standard-deviation normalization spelled out as primitive nodes.
pub struct NormalizationGraph {
    pub graph: Graph,
    pub input: ValueId,
    pub mean: ValueId,
    pub output: ValueId,
}

pub fn normalization_graph(shape: Bhwc) -> NormalizationGraph {
    let mut graph = Graph::new();
    let input = graph.add_input(shape);
    let reduced = Bhwc { c: 1, ..shape };
    let channels = || Attributes::reduce([Axis::Channels]);

    let mean = node(&mut graph, OperationType::Mean, channels(), &[input], reduced);
    let centred = node(&mut graph, OperationType::Sub, Attributes::None, &[input, mean], shape);
    let squared = node(&mut graph, OperationType::Square, Attributes::None, &[centred], shape);
    let variance = node(&mut graph, OperationType::Mean, channels(), &[squared], reduced);
    let biased = node(&mut graph, OperationType::Add, Attributes::Scalar(VARIANCE_BIAS), &[variance], reduced);
    let inv = node(&mut graph, OperationType::Rsqrt, Attributes::None, &[biased], reduced);
    let output = node(&mut graph, OperationType::Mul, Attributes::None, &[centred, inv], shape);
    graph.mark_output(output).unwrap();
    NormalizationGraph { graph, input, mean, output }
}
