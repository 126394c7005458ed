use kiln_device::{Bhwc, Bhwdc, GpuInfo, StorageType};
use kiln_dtype::{CalculationsPrecision, DataType};

use crate::ops::{create_layer_normalization, create_mean_stddev_normalization, create_reduce_mean_channels};
use crate::{Error, GpuObject, NormalizationParams, OperationDef, OperationKind};

fn definition() -> OperationDef {
    OperationDef::uniform(CalculationsPrecision::F32, StorageType::Buffer, 1, 1)
}

#[test]
fn test_defaults() {
    let params = NormalizationParams::default();
    assert_eq!(params.variance_bias, 1.0e-8);
    assert!(params.two_step);
}

#[test]
fn test_two_step_code() {
    let op = create_mean_stddev_normalization(definition(), &GpuInfo::mali(), Bhwc::new(1, 1, 1, 2048), NormalizationParams::default())
        .unwrap();

    assert_eq!(op.work_group_size(), [64, 1, 1]);
    assert!(op.code().contains("sum_diff_sq += dot(diff, diff);"), "{}", op.code());
    assert!(!op.code().contains("sum_sq +="), "{}", op.code());
    assert_eq!(op.args().float("variance_bias"), Some(1.0e-8));
    assert_eq!(op.grid_size(&[Bhwdc::new(2, 3, 4, 1, 2048)]), [64, 8, 3]);
}

#[test]
fn test_one_step_code() {
    let params = NormalizationParams { variance_bias: 1.0e-5, two_step: false };
    let op = create_mean_stddev_normalization(definition(), &GpuInfo::generic(), Bhwc::new(1, 1, 1, 16), params).unwrap();

    assert_eq!(op.work_group_size(), [4, 1, 1]);
    assert!(op.code().contains("float variance = sum_sq * args.inv_channels - mean * mean;"), "{}", op.code());
}

#[test]
fn test_binds_inverse_channels() {
    let op = create_mean_stddev_normalization(definition(), &GpuInfo::generic(), Bhwc::new(1, 1, 1, 8), NormalizationParams::default())
        .unwrap();
    let mut args = op.args().clone();
    op.bind_arguments(&mut args, &[Bhwdc::new(1, 1, 1, 1, 8)]).unwrap();

    assert_eq!(args.float("inv_channels"), Some(0.125));
    assert!(args.unresolved().is_empty());
}

#[test]
fn test_layer_normalization_objects() {
    let scale = [1.0, 2.0, 3.0, 4.0, 5.0];
    let shift = [0.5; 5];
    let op = create_layer_normalization(
        definition(),
        &GpuInfo::generic(),
        Bhwc::new(1, 1, 1, 5),
        NormalizationParams::default(),
        &scale,
        &shift,
    )
    .unwrap();

    assert!(matches!(op.kind(), OperationKind::LayerNormalization(_)));
    let Some(GpuObject::Buffer { data, .. }) = op.args().object("scale") else { panic!("missing scale") };
    assert_eq!(DataType::Float32.decode(data), vec![1.0, 2.0, 3.0, 4.0, 5.0, 0.0, 0.0, 0.0]);
    assert!(op.code().contains("args.scale.Read(S) + args.shift.Read(S)"), "{}", op.code());
}

#[test]
fn test_layer_normalization_length_mismatch() {
    let err = create_layer_normalization(
        definition(),
        &GpuInfo::generic(),
        Bhwc::new(1, 1, 1, 5),
        NormalizationParams::default(),
        &[1.0; 4],
        &[0.0; 5],
    )
    .unwrap_err();
    assert!(matches!(err, Error::Shape { .. }), "{err}");
}

#[test]
fn test_reduce_mean() {
    let op = create_reduce_mean_channels(definition(), &GpuInfo::generic(), Bhwc::new(1, 2, 2, 12)).unwrap();

    assert_eq!(op.kind(), &OperationKind::ReduceMean);
    assert_eq!(op.work_group_size(), [4, 1, 1]);
    assert!(op.code().contains("sum * args.inv_channels"), "{}", op.code());
    assert!(op.args().is_declared("inv_channels"));
}
