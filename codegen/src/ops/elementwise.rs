//! Per-element unary and binary operations, used when a node is compiled on its own.

use kiln_device::GpuInfo;
use snafu::ensure;
use tracing::debug;

use crate::arguments::GpuObject;
use crate::error::{Result, ShapeSnafu};
use crate::operation::{ElementwiseOp, ElementwiseParams, GpuOperation, OperationDef, OperationKind, SecondOperand};
use crate::weights::{Linear, pack_linear};

use super::spatial_work_group;

/// Second operand as supplied at construction.
#[derive(Debug, Clone, PartialEq)]
pub enum ElementwiseOperand {
    None,
    /// Second source tensor with the same channels, or one channel broadcast over all of them.
    Tensor,
    Scalar(f32),
    /// One value per channel.
    Linear(Linear),
}

impl ElementwiseOperand {
    fn kind(&self, definition: &OperationDef) -> SecondOperand {
        match self {
            Self::None => SecondOperand::None,
            Self::Tensor => {
                SecondOperand::Tensor { broadcast: definition.src_tensors.get(1).is_some_and(|src| src.shape.c == 1) }
            }
            Self::Scalar(value) => SecondOperand::Scalar(*value),
            Self::Linear(_) => SecondOperand::Linear,
        }
    }
}

pub fn create_elementwise(
    definition: OperationDef,
    gpu_info: &GpuInfo,
    op: ElementwiseOp,
    operand: ElementwiseOperand,
) -> Result<GpuOperation> {
    ensure!(
        op.is_unary() == (operand == ElementwiseOperand::None),
        ShapeSnafu { reason: format!("{op} does not take a {operand:?} operand") }
    );
    let src_count = if operand == ElementwiseOperand::Tensor { 2 } else { 1 };
    definition.validate(gpu_info, src_count, 1)?;

    let params = ElementwiseParams { op, operand: operand.kind(&definition) };
    let mut operation = GpuOperation::new(definition, OperationKind::Elementwise(params));
    operation.add_src_tensor("src_tensor");
    let second = match &operand {
        ElementwiseOperand::None => None,
        ElementwiseOperand::Tensor => {
            operation.add_src_tensor("second_tensor");
            Some(if matches!(params.operand, SecondOperand::Tensor { broadcast: true }) {
                "INIT_FLT4(args.second_tensor.Read(X, Y, 0).x)"
            } else {
                "args.second_tensor.Read(X, Y, S)"
            })
        }
        ElementwiseOperand::Scalar(value) => {
            operation.args.add_float("scalar", Some(*value));
            Some("INIT_FLT4(args.scalar)")
        }
        ElementwiseOperand::Linear(values) => {
            let data_type = operation.definition.precision.storage_data_type();
            operation.args.add_object("linear", GpuObject::Buffer { data_type, data: pack_linear(values, data_type) });
            Some("args.linear.Read(S)")
        }
    };
    operation.add_dst_tensor("dst_tensor");

    let batched = operation.definition.dst_tensors.first().is_some_and(|dst| dst.shape.b > 1);
    operation.code = elementwise_code(op, second, batched);
    operation.work_group_size = spatial_work_group(&operation.definition, gpu_info);
    debug!(%op, operand = ?params.operand, "generated elementwise");
    Ok(operation)
}

fn expression(op: ElementwiseOp) -> &'static str {
    match op {
        ElementwiseOp::Add => "in0 + in1",
        ElementwiseOp::Sub => "in0 - in1",
        ElementwiseOp::Mul => "in0 * in1",
        ElementwiseOp::Square => "in0 * in0",
        ElementwiseOp::Rsqrt => "rsqrt(in0)",
    }
}

fn elementwise_code(op: ElementwiseOp, second: Option<&str>, batched: bool) -> String {
    let mut c = String::new();
    c += "MAIN_FUNCTION($0) {\n";
    if batched {
        c += "  int linear_id = GLOBAL_ID_0;\n";
        c += "  int X = linear_id / args.dst_tensor.Batch();\n";
        c += "  int B = linear_id % args.dst_tensor.Batch();\n";
        c += "  args.dst_tensor.SetBatchRef(B);\n";
        c += "  args.src_tensor.SetBatchRef(B);\n";
        if second.is_some_and(|second| second.contains("second_tensor")) {
            c += "  args.second_tensor.SetBatchRef(B);\n";
        }
    } else {
        c += "  int X = GLOBAL_ID_0;\n";
    }
    c += "  int Y = GLOBAL_ID_1;\n";
    c += "  int S = GLOBAL_ID_2;\n";
    c += "  if (X >= args.dst_tensor.Width() || Y >= args.dst_tensor.Height() || S >= args.dst_tensor.Slices()) {\n";
    c += "    return;\n";
    c += "  }\n";
    c += "  FLT4 in0 = args.src_tensor.Read(X, Y, S);\n";
    if let Some(second) = second {
        c += &format!("  FLT4 in1 = {second};\n");
    }
    c += &format!("  FLT4 result = {};\n", expression(op));
    c += "  args.dst_tensor.Write(result, X, Y, S);\n";
    c += "}\n";
    c
}
