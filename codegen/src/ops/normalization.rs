//! Mean/standard-deviation normalization over channels, optionally followed by a per-channel affine.

use kiln_device::{Bhwc, GpuInfo};
use snafu::ensure;
use tracing::debug;

use crate::arguments::GpuObject;
use crate::error::{Result, ShapeSnafu};
use crate::operation::{GpuOperation, NormalizationParams, OperationDef, OperationKind};
use crate::reduce::{ReduceOp, reduce_code};
use crate::weights::pack_linear;
use crate::work_group::{NORMALIZATION_WORK_GROUP, reduction_work_group_width};

use super::{declare_mask, ensure_non_empty, slices, xy_prologue};

/// Build `(x - mean) / sqrt(variance + variance_bias)` over the channels of `shape`.
pub fn create_mean_stddev_normalization(
    definition: OperationDef,
    gpu_info: &GpuInfo,
    shape: Bhwc,
    params: NormalizationParams,
) -> Result<GpuOperation> {
    build(definition, gpu_info, shape, params, None)
}

/// Build the normalization followed by `result * scale + shift`, one scale and shift per channel.
pub fn create_layer_normalization(
    definition: OperationDef,
    gpu_info: &GpuInfo,
    shape: Bhwc,
    params: NormalizationParams,
    scale: &[f32],
    shift: &[f32],
) -> Result<GpuOperation> {
    ensure!(
        scale.len() == shape.c && shift.len() == shape.c,
        ShapeSnafu {
            reason: format!("layer normalization over {} channels got {} scales and {} shifts", shape.c, scale.len(), shift.len())
        }
    );
    build(definition, gpu_info, shape, params, Some((scale, shift)))
}

fn build(
    definition: OperationDef,
    gpu_info: &GpuInfo,
    shape: Bhwc,
    params: NormalizationParams,
    affine: Option<(&[f32], &[f32])>,
) -> Result<GpuOperation> {
    let kind = match affine {
        Some(_) => OperationKind::LayerNormalization(params),
        None => OperationKind::MeanStdDevNormalization(params),
    };
    definition.validate(gpu_info, 1, 1)?;
    ensure_non_empty(shape, kind.name())?;

    let width = reduction_work_group_width(gpu_info, slices(shape), NORMALIZATION_WORK_GROUP);
    let mut operation = GpuOperation::new(definition, kind);
    operation.work_group_size = [width, 1, 1];
    operation.add_src_tensor("src_tensor");
    operation.add_dst_tensor("dst_tensor");
    declare_mask(&mut operation.args);
    operation.args.add_float("inv_channels", None);
    operation.args.add_float("variance_bias", Some(params.variance_bias));
    if let Some((scale, shift)) = affine {
        let data_type = operation.definition.precision.storage_data_type();
        operation.args.add_object("scale", GpuObject::Buffer { data_type, data: pack_linear(scale, data_type) });
        operation.args.add_object("shift", GpuObject::Buffer { data_type, data: pack_linear(shift, data_type) });
    }
    operation.code = normalization_code(width, shape.b > 1, params.two_step, affine.is_some())?;

    debug!(
        vendor = %gpu_info.vendor,
        slices = slices(shape),
        work_group = width,
        two_step = params.two_step,
        affine = affine.is_some(),
        "generated normalization"
    );
    Ok(operation)
}

fn masked_loop(size: usize, body: &str) -> String {
    let mut c = format!("  for (int S = tid; S < args.src_tensor.Slices(); S += {size}) {{\n");
    c += "    float4 mask_a = S == args.src_tensor.Slices() - 1 ? mask : INIT_FLOAT4(1.0f);\n";
    c += "    float4 t = args.src_tensor.Read<float>(X, Y, S);\n";
    c += body;
    c += "  }\n";
    c
}

fn normalization_code(size: usize, batched: bool, two_step: bool, affine: bool) -> Result<String> {
    let mut c = String::new();
    c += "MAIN_FUNCTION($0) {\n";
    c += &xy_prologue(batched, "GROUP_ID_1", "GROUP_ID_2");
    c += "  float4 mask = INIT_FLOAT4v4(args.mask_x, args.mask_y, args.mask_z, args.mask_w);\n";
    c += "  int tid = LOCAL_ID_0;\n";
    c += &format!("  __local float loc_mem[{size}];\n");
    c += "  float sum = 0.0f;\n";
    if two_step {
        c += &masked_loop(size, "    sum += dot(mask_a, t);\n");
        c += &reduce_code("sum", ReduceOp::Sum, size)?;
        c += "  float mean = sum * args.inv_channels;\n";
        c += "  float sum_diff_sq = 0.0f;\n";
        c += &masked_loop(size, "    float4 diff = (t - INIT_FLOAT4(mean)) * mask_a;\n    sum_diff_sq += dot(diff, diff);\n");
        c += &reduce_code("sum_diff_sq", ReduceOp::Sum, size)?;
        c += "  float variance = sum_diff_sq * args.inv_channels;\n";
    } else {
        c += "  float sum_sq = 0.0f;\n";
        c += &masked_loop(size, "    sum += dot(mask_a, t);\n    sum_sq += dot(mask_a, t * t);\n");
        c += &reduce_code("sum", ReduceOp::Sum, size)?;
        c += &reduce_code("sum_sq", ReduceOp::Sum, size)?;
        c += "  float mean = sum * args.inv_channels;\n";
        c += "  float variance = sum_sq * args.inv_channels - mean * mean;\n";
    }
    c += "  float stddev_inv = rsqrt(variance + args.variance_bias);\n";
    c += &format!("  for (int S = tid; S < args.src_tensor.Slices(); S += {size}) {{\n");
    c += "    float4 t = args.src_tensor.Read<float>(X, Y, S);\n";
    c += "    FLT4 result = TO_FLT4((t - INIT_FLOAT4(mean)) * stddev_inv);\n";
    if affine {
        c += "    result = result * args.scale.Read(S) + args.shift.Read(S);\n";
    }
    c += "    args.dst_tensor.Write(result, X, Y, S);\n";
    c += "  }\n";
    c += "}\n";
    Ok(c)
}
