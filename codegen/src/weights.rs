//! Constant weight tensors and their repacking into 4-channel blocks.
//!
//! Depthwise weights arrive as OHWI (OHWDI for 3D) where `o` is the channel multiplier and `i` the
//! source channel count. Destination channel `d_ch` reads `weights[d_ch % o, .., d_ch / o]`. Packed
//! output is ordered slice, then kernel depth (3D), then row, then column, four lanes per entry;
//! lanes past the real channel count are zero.

use kiln_device::divide_round_up;
use kiln_dtype::{CalculationsPrecision, DataType};

/// Output-multiplier, height, width, input-channel weight shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ohwi {
    pub o: usize,
    pub h: usize,
    pub w: usize,
    pub i: usize,
}

impl Ohwi {
    pub const fn new(o: usize, h: usize, w: usize, i: usize) -> Self {
        Self { o, h, w, i }
    }

    pub const fn elements(&self) -> usize {
        self.o * self.h * self.w * self.i
    }

    pub const fn linear_index(&self, o: usize, y: usize, x: usize, i: usize) -> usize {
        ((o * self.h + y) * self.w + x) * self.i + i
    }
}

/// [`Ohwi`] with a kernel depth axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ohwdi {
    pub o: usize,
    pub h: usize,
    pub w: usize,
    pub d: usize,
    pub i: usize,
}

impl Ohwdi {
    pub const fn new(o: usize, h: usize, w: usize, d: usize, i: usize) -> Self {
        Self { o, h, w, d, i }
    }

    pub const fn elements(&self) -> usize {
        self.o * self.h * self.w * self.d * self.i
    }

    pub const fn linear_index(&self, o: usize, y: usize, x: usize, z: usize, i: usize) -> usize {
        (((o * self.h + y) * self.w + x) * self.d + z) * self.i + i
    }
}

/// Host weights in f32.
#[derive(Debug, Clone, PartialEq)]
pub struct Weights<S> {
    pub shape: S,
    pub data: Vec<f32>,
}

/// Per-channel f32 vector, used for biases and affine scale/shift.
pub type Linear = Vec<f32>;

/// Geometry of a packed depthwise kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PackedKernel {
    dst_channels: usize,
    kernel_x: usize,
    kernel_y: usize,
    kernel_z: usize,
}

impl PackedKernel {
    fn slices(&self) -> usize {
        divide_round_up(self.dst_channels, 4)
    }

    fn entries(&self) -> usize {
        self.slices() * self.kernel_z * self.kernel_y * self.kernel_x
    }
}

/// Shared repacking loop; `element` fixes the stride and encoding of every lane.
fn rearrange(kernel: PackedKernel, element: DataType, dst: &mut [u8], value: impl Fn(usize, usize, usize, usize) -> f32) {
    let stride = element.size();
    debug_assert!(dst.len() >= kernel.entries() * 4 * stride);

    let mut counter = 0;
    for d in 0..kernel.slices() {
        for z in 0..kernel.kernel_z {
            for y in 0..kernel.kernel_y {
                for x in 0..kernel.kernel_x {
                    for i in 0..4 {
                        let d_ch = d * 4 + i;
                        let filter = if d_ch < kernel.dst_channels { value(d_ch, z, y, x) } else { 0.0 };
                        element.write_f32(filter, &mut dst[counter * stride..]);
                        counter += 1;
                    }
                }
            }
        }
    }
}

fn kernel_2d(weights: &Weights<Ohwi>) -> PackedKernel {
    let shape = weights.shape;
    PackedKernel { dst_channels: shape.i * shape.o, kernel_x: shape.w, kernel_y: shape.h, kernel_z: 1 }
}

fn kernel_3d(weights: &Weights<Ohwdi>) -> PackedKernel {
    let shape = weights.shape;
    PackedKernel { dst_channels: shape.i * shape.o, kernel_x: shape.w, kernel_y: shape.h, kernel_z: shape.d }
}

fn rearrange_2d(weights: &Weights<Ohwi>, element: DataType, dst: &mut [u8]) {
    let shape = weights.shape;
    rearrange(kernel_2d(weights), element, dst, |d_ch, _, y, x| {
        weights.data[shape.linear_index(d_ch % shape.o, y, x, d_ch / shape.o)]
    });
}

fn rearrange_3d(weights: &Weights<Ohwdi>, element: DataType, dst: &mut [u8]) {
    let shape = weights.shape;
    rearrange(kernel_3d(weights), element, dst, |d_ch, z, y, x| {
        weights.data[shape.linear_index(d_ch % shape.o, y, x, z, d_ch / shape.o)]
    });
}

/// Pack 2D depthwise weights as float4 entries.
pub fn rearrange_weights_for_dw_conv2d_f32(weights: &Weights<Ohwi>, dst: &mut [u8]) {
    rearrange_2d(weights, DataType::Float32, dst);
}

/// Pack 2D depthwise weights as half4 entries.
pub fn rearrange_weights_for_dw_conv2d_f16(weights: &Weights<Ohwi>, dst: &mut [u8]) {
    rearrange_2d(weights, DataType::Float16, dst);
}

/// Pack 3D depthwise weights as float4 entries.
pub fn rearrange_weights_for_dw_conv3d_f32(weights: &Weights<Ohwdi>, dst: &mut [u8]) {
    rearrange_3d(weights, DataType::Float32, dst);
}

/// Pack 3D depthwise weights as half4 entries.
pub fn rearrange_weights_for_dw_conv3d_f16(weights: &Weights<Ohwdi>, dst: &mut [u8]) {
    rearrange_3d(weights, DataType::Float16, dst);
}

/// Packed 2D weights for `precision`, with the number of 4-lane entries.
pub fn pack_dw_conv2d_weights(weights: &Weights<Ohwi>, precision: CalculationsPrecision) -> (Vec<u8>, usize) {
    let entries = kernel_2d(weights).entries();
    let data_type = precision.storage_data_type();
    let mut data = vec![0u8; entries * data_type.vec4_size()];
    match data_type {
        DataType::Float32 => rearrange_weights_for_dw_conv2d_f32(weights, &mut data),
        DataType::Float16 => rearrange_weights_for_dw_conv2d_f16(weights, &mut data),
    }
    (data, entries)
}

/// Packed 3D weights for `precision`, with the number of 4-lane entries.
pub fn pack_dw_conv3d_weights(weights: &Weights<Ohwdi>, precision: CalculationsPrecision) -> (Vec<u8>, usize) {
    let entries = kernel_3d(weights).entries();
    let data_type = precision.storage_data_type();
    let mut data = vec![0u8; entries * data_type.vec4_size()];
    match data_type {
        DataType::Float32 => rearrange_weights_for_dw_conv3d_f32(weights, &mut data),
        DataType::Float16 => rearrange_weights_for_dw_conv3d_f16(weights, &mut data),
    }
    (data, entries)
}

/// Pack a per-channel vector into zero-padded 4-lane entries.
pub fn pack_linear(values: &[f32], data_type: DataType) -> Vec<u8> {
    let slices = divide_round_up(values.len(), 4);
    let mut padded = values.to_vec();
    padded.resize(slices * 4, 0.0);
    data_type.encode(&padded)
}
