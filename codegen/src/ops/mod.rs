//! Kernel generators, one module per primitive.

pub mod depthwise_conv;
pub mod elementwise;
pub mod normalization;
pub mod reduce_mean;
pub mod softmax;

use kiln_device::{Bhwc, GpuInfo, divide_round_up};
use snafu::ensure;

use crate::arguments::Arguments;
use crate::error::{Result, ShapeSnafu};
use crate::operation::OperationDef;
use crate::work_group::default_work_group;

pub use depthwise_conv::{
    DepthwiseConvolution2DAttributes, DepthwiseConvolution3DAttributes, Hw, Hwd, create_depthwise_convolution2d,
    create_depthwise_convolution2d_dynamic_weights, create_depthwise_convolution2d_with_storage,
    create_depthwise_convolution3d, use_buffers_for_weights,
};
pub use elementwise::create_elementwise;
pub use normalization::{create_layer_normalization, create_mean_stddev_normalization};
pub use reduce_mean::create_reduce_mean_channels;
pub use softmax::create_softmax1x1;

pub(crate) fn slices(shape: Bhwc) -> usize {
    divide_round_up(shape.c, 4)
}

pub(crate) fn ensure_non_empty(shape: Bhwc, operation: &str) -> Result<()> {
    ensure!(
        shape.b > 0 && shape.h > 0 && shape.w > 0 && shape.c > 0,
        ShapeSnafu { reason: format!("{operation}: shape {}x{}x{}x{} has a zero dimension", shape.b, shape.h, shape.w, shape.c) }
    );
    Ok(())
}

/// Prologue resolving `X` (and `B` when batched) from `linear`, with `Y` taken from `y_source`.
pub(crate) fn xy_prologue(batched: bool, linear: &str, y_source: &str) -> String {
    let mut c = String::new();
    if batched {
        c += &format!("  int linear_id = {linear};\n");
        c += "  int X = linear_id / args.dst_tensor.Batch();\n";
        c += "  int B = linear_id % args.dst_tensor.Batch();\n";
        c += "  if (B >= args.dst_tensor.Batch()) return;\n";
        c += "  args.src_tensor.SetBatchRef(B);\n";
        c += "  args.dst_tensor.SetBatchRef(B);\n";
    } else {
        c += &format!("  int X = {linear};\n");
    }
    c += &format!("  int Y = {y_source};\n");
    c += "  if (X >= args.dst_tensor.Width()) return;\n";
    c += "  if (Y >= args.dst_tensor.Height()) return;\n";
    c
}

/// Declare the last-slice mask arguments; values are bound per dispatch.
pub(crate) fn declare_mask(args: &mut Arguments) {
    for name in ["mask_x", "mask_y", "mask_z", "mask_w"] {
        args.add_float(name, None);
    }
}

/// Work group for one-item-per-pixel kernels, sized against the destination slot when its shape is known.
pub(crate) fn spatial_work_group(definition: &OperationDef, gpu_info: &GpuInfo) -> [usize; 3] {
    let grid = definition
        .dst_tensors
        .first()
        .filter(|dst| !dst.shape.has_zero_dim())
        .map_or([8, 4, 1], |dst| [dst.shape.w * dst.shape.b, dst.shape.h * dst.shape.d, dst.shape.slices()]);
    default_work_group(grid, gpu_info)
}
