//! Mean over channels into a single-channel tensor.

use kiln_device::{Bhwc, GpuInfo};
use snafu::ensure;
use tracing::debug;

use crate::error::{Result, ShapeSnafu};
use crate::operation::{GpuOperation, OperationDef, OperationKind};
use crate::reduce::{ReduceOp, reduce_code};
use crate::work_group::{NORMALIZATION_WORK_GROUP, reduction_work_group_width};

use super::{declare_mask, ensure_non_empty, slices, xy_prologue};

/// Build a reduction of the channels of `shape` to their mean.
pub fn create_reduce_mean_channels(definition: OperationDef, gpu_info: &GpuInfo, shape: Bhwc) -> Result<GpuOperation> {
    definition.validate(gpu_info, 1, 1)?;
    ensure_non_empty(shape, "reduce_mean")?;
    if let Some(dst) = definition.dst_tensors.first().filter(|dst| dst.shape.c != 0) {
        ensure!(dst.shape.c == 1, ShapeSnafu { reason: format!("channel mean writes 1 channel, slot has {}", dst.shape.c) });
    }

    let size = reduction_work_group_width(gpu_info, slices(shape), NORMALIZATION_WORK_GROUP);
    let mut operation = GpuOperation::new(definition, OperationKind::ReduceMean);
    operation.work_group_size = [size, 1, 1];
    operation.add_src_tensor("src_tensor");
    operation.add_dst_tensor("dst_tensor");
    declare_mask(&mut operation.args);
    operation.args.add_float("inv_channels", None);

    let mut c = String::new();
    c += "MAIN_FUNCTION($0) {\n";
    c += &xy_prologue(shape.b > 1, "GROUP_ID_1", "GROUP_ID_2");
    c += "  float4 mask = INIT_FLOAT4v4(args.mask_x, args.mask_y, args.mask_z, args.mask_w);\n";
    c += "  int tid = LOCAL_ID_0;\n";
    c += "  float sum = 0.0f;\n";
    c += &format!("  for (int S = tid; S < args.src_tensor.Slices(); S += {size}) {{\n");
    c += "    float4 mask_a = S == args.src_tensor.Slices() - 1 ? mask : INIT_FLOAT4(1.0f);\n";
    c += "    sum += dot(mask_a, args.src_tensor.Read<float>(X, Y, S));\n";
    c += "  }\n";
    c += &format!("  __local float loc_mem[{size}];\n");
    c += &reduce_code("sum", ReduceOp::Sum, size)?;
    c += "  if (tid == 0) {\n";
    c += "    FLT4 result = TO_FLT4(INIT_FLOAT4v4(sum * args.inv_channels, 0.0f, 0.0f, 0.0f));\n";
    c += "    args.dst_tensor.Write(result, X, Y, 0);\n";
    c += "  }\n";
    c += "}\n";
    operation.code = c;

    debug!(vendor = %gpu_info.vendor, slices = slices(shape), work_group = size, "generated channel mean");
    Ok(operation)
}
