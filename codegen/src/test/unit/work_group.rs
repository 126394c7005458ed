use kiln_device::GpuInfo;
use test_case::test_case;

use crate::{NORMALIZATION_WORK_GROUP, SOFTMAX_WORK_GROUP, default_work_group, reduction_work_group_width, work_groups_count};

#[test_case(GpuInfo::adreno(), 1000, 512; "adreno starts at 512")]
#[test_case(GpuInfo::mali(), 1000, 256; "mali halves below its 384 limit")]
#[test_case(GpuInfo::generic(), 1000, 256; "generic keeps width equal to limit")]
#[test_case(GpuInfo::generic(), 3, 4; "few slices")]
#[test_case(GpuInfo::generic(), 1, 1; "single slice")]
fn test_softmax_width(info: GpuInfo, slices: usize, expected: usize) {
    assert_eq!(reduction_work_group_width(&info, slices, SOFTMAX_WORK_GROUP), expected);
}

#[test]
fn test_adreno_halves_at_equal_limit() {
    let adreno = GpuInfo::builder().vendor(kiln_device::GpuVendor::Adreno).max_work_group_size([512, 512, 64]).build();
    let other = GpuInfo::builder().max_work_group_size([512, 512, 64]).build();
    let wide = crate::VendorDefaults { adreno: 512, mali: 512, other: 512 };

    assert_eq!(reduction_work_group_width(&adreno, 10_000, wide), 256);
    assert_eq!(reduction_work_group_width(&other, 10_000, wide), 512);
}

#[test_case(GpuInfo::adreno(), 256; "adreno")]
#[test_case(GpuInfo::mali(), 64; "mali")]
#[test_case(GpuInfo::generic(), 128; "generic")]
fn test_normalization_width(info: GpuInfo, expected: usize) {
    assert_eq!(reduction_work_group_width(&info, 10_000, NORMALIZATION_WORK_GROUP), expected);
}

#[test]
fn test_default_work_group() {
    assert_eq!(default_work_group([100, 100, 10], &GpuInfo::generic()), [8, 4, 1]);
    assert_eq!(default_work_group([3, 1, 1], &GpuInfo::generic()), [4, 1, 1]);

    let narrow = GpuInfo::builder().max_work_group_size([4, 4, 1]).max_work_group_total_size(8).build();
    let size = default_work_group([100, 100, 10], &narrow);
    assert!(size[0] <= 4 && size[1] <= 4 && size.iter().product::<usize>() <= 8, "{size:?}");
}

#[test]
fn test_work_groups_count() {
    assert_eq!(work_groups_count([10, 4, 1], [8, 4, 1]), [2, 1, 1]);
    assert_eq!(work_groups_count([16, 9, 3], [8, 4, 1]), [2, 3, 3]);
}

#[test]
fn test_degenerate_inputs_terminate() {
    assert_eq!(reduction_work_group_width(&GpuInfo::adreno(), 0, SOFTMAX_WORK_GROUP), 1);
    assert_eq!(reduction_work_group_width(&GpuInfo::generic(), 0, NORMALIZATION_WORK_GROUP), 1);

    let zero_limit = GpuInfo::builder().vendor(kiln_device::GpuVendor::Adreno).max_work_group_size([0, 256, 64]).build();
    assert_eq!(reduction_work_group_width(&zero_limit, 1000, SOFTMAX_WORK_GROUP), 1);
    let zero_limit = GpuInfo::builder().max_work_group_size([0, 256, 64]).build();
    assert_eq!(reduction_work_group_width(&zero_limit, 1000, SOFTMAX_WORK_GROUP), 1);
}
