//! Softmax over channels for 1x1 spatial reductions, one work group per output pixel.

use kiln_device::{Bhwc, GpuInfo};
use tracing::debug;

use crate::error::Result;
use crate::operation::{GpuOperation, OperationDef, OperationKind};
use crate::reduce::{ReduceOp, reduce_code};
use crate::work_group::{SOFTMAX_WORK_GROUP, reduction_work_group_width};

use super::{declare_mask, ensure_non_empty, slices, xy_prologue};

/// Build a softmax over the channels of `shape`.
///
/// Every lane of a work group strides over the channel slices, the group reduces the maximum and
/// then the exponent sum, and each work item writes one destination slice.
pub fn create_softmax1x1(definition: OperationDef, gpu_info: &GpuInfo, shape: Bhwc) -> Result<GpuOperation> {
    definition.validate(gpu_info, 1, 1)?;
    ensure_non_empty(shape, "softmax1x1")?;

    let width = reduction_work_group_width(gpu_info, slices(shape), SOFTMAX_WORK_GROUP);
    let mut operation = GpuOperation::new(definition, OperationKind::Softmax1x1);
    operation.work_group_size = [width, 1, 1];
    operation.code = softmax_code(&mut operation, shape.b > 1)?;

    debug!(vendor = %gpu_info.vendor, slices = slices(shape), work_group = width, "generated softmax1x1");
    Ok(operation)
}

fn softmax_code(operation: &mut GpuOperation, batched: bool) -> Result<String> {
    operation.add_src_tensor("src_tensor");
    operation.add_dst_tensor("dst_tensor");
    declare_mask(&mut operation.args);
    let size = operation.work_group_size[0];

    let mut c = String::new();
    c += "MAIN_FUNCTION($0) {\n";
    c += &xy_prologue(batched, "GROUP_ID_1", "GROUP_ID_2");
    c += "  float4 mask = INIT_FLOAT4v4(args.mask_x, args.mask_y, args.mask_z, args.mask_w);\n";
    c += "  float4 maxx4 = INIT_FLOAT4(args.src_tensor.Read<float>(X, Y, 0).x);\n";
    c += "  int tid = LOCAL_ID_0;\n";
    c += &format!("  for (int s = tid; s < args.src_tensor.Slices(); s += {size}) {{\n");
    c += "    float4 mask_a = s == args.src_tensor.Slices() - 1 ? mask : INIT_FLOAT4(1.0f);\n";
    c += "    float4 mask_b = INIT_FLOAT4(1.0f) - mask_a;\n";
    c += "    float4 src = args.src_tensor.Read<float>(X, Y, s);\n";
    c += "    src = src * mask_a + mask_b * src.x;\n";
    c += "    maxx4 = max(maxx4, src);\n";
    c += "  }\n";
    c += "  float maximum = max(maxx4.x, maxx4.y);\n";
    c += "  maximum = max(maximum, maxx4.z);\n";
    c += "  maximum = max(maximum, maxx4.w);\n";
    c += &format!("  __local float loc_mem[{size}];\n");
    c += &reduce_code("maximum", ReduceOp::Max, size)?;
    c += "  float sum = 0.0f;\n";
    c += &format!("  for (int s = tid; s < args.src_tensor.Slices(); s += {size}) {{\n");
    c += "    float4 mask_temp = s == args.src_tensor.Slices() - 1 ? mask : INIT_FLOAT4(1.0f);\n";
    c += "    float4 src = args.src_tensor.Read<float>(X, Y, s) - INIT_FLOAT4(maximum);\n";
    c += "    sum += dot(mask_temp, exp(src));\n";
    c += "  }\n";
    c += &reduce_code("sum", ReduceOp::Sum, size)?;
    c += "  sum = 1.0f / sum;\n";
    c += "  int dst_s = GLOBAL_ID_0;\n";
    c += "  if (dst_s < args.dst_tensor.Slices()) {\n";
    c += "    float4 src = args.src_tensor.Read<float>(X, Y, dst_s) - INIT_FLOAT4(maximum);\n";
    c += "    FLT4 res = TO_FLT4(exp(src) * sum);\n";
    c += "    args.dst_tensor.Write(res, X, Y, dst_s);\n";
    c += "  }\n";
    c += "}\n";
    Ok(c)
}
