use kiln_device::{Bhwdc, GpuInfo, StorageType, TensorDescriptor};
use kiln_dtype::{CalculationsPrecision, DataType};
use test_case::test_case;

use crate::ops::create_elementwise;
use crate::{ElementwiseOp, ElementwiseOperand, ElementwiseParams, Error, GpuObject, OperationDef, OperationKind, SecondOperand};

fn definition(sources: usize) -> OperationDef {
    OperationDef::uniform(CalculationsPrecision::F32, StorageType::Texture2D, sources, 1)
}

#[test_case(ElementwiseOp::Square, "in0 * in0"; "square")]
#[test_case(ElementwiseOp::Rsqrt, "rsqrt(in0)"; "rsqrt")]
fn test_unary(op: ElementwiseOp, expression: &str) {
    let op = create_elementwise(definition(1), &GpuInfo::generic(), op, ElementwiseOperand::None).unwrap();
    assert!(op.code().contains(expression), "{}", op.code());
    assert!(!op.code().contains("in1"), "{}", op.code());
}

#[test]
fn test_tensor_operand() {
    let op = create_elementwise(definition(2), &GpuInfo::generic(), ElementwiseOp::Sub, ElementwiseOperand::Tensor).unwrap();
    assert_eq!(op.src_names(), ["src_tensor", "second_tensor"]);
    assert!(op.code().contains("FLT4 in1 = args.second_tensor.Read(X, Y, S);"), "{}", op.code());
    assert!(matches!(
        op.kind(),
        OperationKind::Elementwise(ElementwiseParams { operand: SecondOperand::Tensor { broadcast: false }, .. })
    ));
}

#[test]
fn test_broadcast_operand() {
    let mut definition = definition(2);
    definition.src_tensors[1] = TensorDescriptor::new(DataType::Float32, StorageType::Texture2D, Bhwdc::new(1, 2, 2, 1, 1));
    let op = create_elementwise(definition, &GpuInfo::generic(), ElementwiseOp::Mul, ElementwiseOperand::Tensor).unwrap();
    assert!(op.code().contains("INIT_FLT4(args.second_tensor.Read(X, Y, 0).x)"), "{}", op.code());
    assert!(matches!(
        op.kind(),
        OperationKind::Elementwise(ElementwiseParams { operand: SecondOperand::Tensor { broadcast: true }, .. })
    ));
}

#[test]
fn test_scalar_and_linear_operands() {
    let op = create_elementwise(definition(1), &GpuInfo::generic(), ElementwiseOp::Add, ElementwiseOperand::Scalar(1e-5)).unwrap();
    assert_eq!(op.args().float("scalar"), Some(1e-5));

    let op = create_elementwise(
        definition(1),
        &GpuInfo::generic(),
        ElementwiseOp::Mul,
        ElementwiseOperand::Linear(vec![2.0; 3]),
    )
    .unwrap();
    assert!(matches!(op.args().object("linear"), Some(GpuObject::Buffer { .. })));
    assert!(op.code().contains("args.linear.Read(S)"), "{}", op.code());
}

#[test_case(ElementwiseOp::Add, ElementwiseOperand::None, 1; "binary without operand")]
#[test_case(ElementwiseOp::Square, ElementwiseOperand::Scalar(2.0), 1; "unary with operand")]
#[test_case(ElementwiseOp::Add, ElementwiseOperand::Tensor, 1; "missing second slot")]
fn test_invalid_operands(op: ElementwiseOp, operand: ElementwiseOperand, sources: usize) {
    let err = create_elementwise(definition(sources), &GpuInfo::generic(), op, operand).unwrap_err();
    assert!(matches!(err, Error::Shape { .. }), "{err}");
}
