use test_case::test_case;

use crate::{CalculationsPrecision, DataType};

#[test_case(DataType::Float32, 4, "float"; "float32")]
#[test_case(DataType::Float16, 2, "half"; "float16")]
fn test_sizes_and_names(dtype: DataType, size: usize, name: &str) {
    assert_eq!(dtype.size(), size);
    assert_eq!(dtype.vec4_size(), size * 4);
    assert_eq!(dtype.kernel_name(), name);
}

#[test_case(CalculationsPrecision::F32, DataType::Float32, DataType::Float32; "f32")]
#[test_case(CalculationsPrecision::F32F16, DataType::Float16, DataType::Float32; "mixed")]
#[test_case(CalculationsPrecision::F16, DataType::Float16, DataType::Float16; "f16")]
fn test_precision_data_types(precision: CalculationsPrecision, storage: DataType, accumulator: DataType) {
    assert_eq!(precision.storage_data_type(), storage);
    assert_eq!(precision.accumulator_data_type(), accumulator);
}

#[test]
fn test_half_rounding() {
    assert_eq!(DataType::Float16.round(1.0 / 3.0), half::f16::from_f32(1.0 / 3.0).to_f32());
    assert_eq!(DataType::Float32.round(1.0 / 3.0), 1.0 / 3.0);
}

#[test]
fn test_encode_layout_is_little_endian() {
    let bytes = DataType::Float32.encode(&[1.0]);
    assert_eq!(bytes, 1.0f32.to_le_bytes());

    let bytes = DataType::Float16.encode(&[1.0]);
    assert_eq!(bytes, [0x00, 0x3c]);
}
