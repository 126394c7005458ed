use half::f16;
use kiln_dtype::{CalculationsPrecision, DataType};

use crate::weights::{pack_dw_conv2d_weights, pack_dw_conv3d_weights, pack_linear};
use crate::{
    Ohwdi, Ohwi, Weights, rearrange_weights_for_dw_conv2d_f16, rearrange_weights_for_dw_conv2d_f32,
    rearrange_weights_for_dw_conv3d_f32,
};

fn multiplier_weights() -> Weights<Ohwi> {
    Weights { shape: Ohwi::new(2, 1, 1, 3), data: (0..6).map(|v| v as f32).collect() }
}

#[test]
fn test_channel_multiplier_interleaving() {
    let weights = multiplier_weights();
    let mut dst = vec![0u8; 2 * 16];
    rearrange_weights_for_dw_conv2d_f32(&weights, &mut dst);

    assert_eq!(DataType::Float32.decode(&dst), vec![0.0, 3.0, 1.0, 4.0, 2.0, 5.0, 0.0, 0.0]);
}

#[test]
fn test_f16_packing_uses_half_stride() {
    let weights = multiplier_weights();
    let mut dst = vec![0u8; 2 * 8];
    rearrange_weights_for_dw_conv2d_f16(&weights, &mut dst);

    let lane = |i: usize| f16::from_le_bytes([dst[i * 2], dst[i * 2 + 1]]).to_f32();
    assert_eq!((0..8).map(lane).collect::<Vec<_>>(), vec![0.0, 3.0, 1.0, 4.0, 2.0, 5.0, 0.0, 0.0]);
}

#[test]
fn test_kernel_order_is_row_then_column() {
    // 2x2 kernel over one channel: entries follow y, then x.
    let weights = Weights { shape: Ohwi::new(1, 2, 2, 1), data: vec![1.0, 2.0, 3.0, 4.0] };
    let (data, entries) = pack_dw_conv2d_weights(&weights, CalculationsPrecision::F32);

    assert_eq!(entries, 4);
    let values = DataType::Float32.decode(&data);
    let first_lanes = values.chunks(4).map(|entry| entry[0]).collect::<Vec<_>>();
    assert_eq!(first_lanes, vec![1.0, 2.0, 3.0, 4.0]);
}

#[test]
fn test_3d_depth_is_outside_rows() {
    let shape = Ohwdi::new(1, 1, 2, 2, 1);
    // Values encode (x, z) as 10 * x + z.
    let data = (0..2).flat_map(|x| (0..2).map(move |z| (10 * x + z) as f32)).collect();
    let weights = Weights { shape, data };
    let mut dst = vec![0u8; 4 * 16];
    rearrange_weights_for_dw_conv3d_f32(&weights, &mut dst);

    let values = DataType::Float32.decode(&dst);
    let first_lanes = values.chunks(4).map(|entry| entry[0]).collect::<Vec<_>>();
    assert_eq!(first_lanes, vec![0.0, 10.0, 1.0, 11.0]);
}

#[test]
fn test_precision_selects_element_type() {
    let weights = multiplier_weights();
    assert_eq!(pack_dw_conv2d_weights(&weights, CalculationsPrecision::F32).0.len(), 32);
    assert_eq!(pack_dw_conv2d_weights(&weights, CalculationsPrecision::F32F16).0.len(), 16);
    assert_eq!(pack_dw_conv2d_weights(&weights, CalculationsPrecision::F16).0.len(), 16);

    let weights = Weights { shape: Ohwdi::new(1, 2, 2, 2, 5), data: vec![1.0; 40] };
    let (data, entries) = pack_dw_conv3d_weights(&weights, CalculationsPrecision::F32);
    assert_eq!(entries, 2 * 8);
    assert_eq!(data.len(), entries * 16);
}

#[test]
fn test_pack_linear_pads_to_slices() {
    let packed = pack_linear(&[1.0, 2.0, 3.0, 4.0, 5.0], DataType::Float32);
    assert_eq!(DataType::Float32.decode(&packed), vec![1.0, 2.0, 3.0, 4.0, 5.0, 0.0, 0.0, 0.0]);
}
