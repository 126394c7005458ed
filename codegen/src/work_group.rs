//! Work-group sizing.

use kiln_device::{GpuInfo, divide_round_up};

/// Starting work-group width per vendor family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VendorDefaults {
    pub adreno: usize,
    pub mali: usize,
    pub other: usize,
}

impl VendorDefaults {
    pub fn for_device(&self, info: &GpuInfo) -> usize {
        if info.is_adreno() {
            self.adreno
        } else if info.is_mali() {
            self.mali
        } else {
            self.other
        }
    }
}

/// Widths for softmax over channel slices.
pub const SOFTMAX_WORK_GROUP: VendorDefaults = VendorDefaults { adreno: 512, mali: 1024, other: 256 };

/// Widths for mean/stddev style reductions over channel slices.
pub const NORMALIZATION_WORK_GROUP: VendorDefaults = VendorDefaults { adreno: 256, mali: 64, other: 128 };

/// Width of a work group that reduces `slices` channel slices with one lane per slice.
///
/// Starts from the vendor default and halves while the width is at least twice the slice count.
/// Adreno then halves while the width is `>=` the device maximum, every other vendor while it is
/// `>` the maximum. The result is a power of two whenever the defaults are.
pub fn reduction_work_group_width(info: &GpuInfo, slices: usize, defaults: VendorDefaults) -> usize {
    let mut width = defaults.for_device(info).max(1);
    while width > 1 && width >= slices * 2 {
        width /= 2;
    }

    // A zero limit would never stop the Adreno loop.
    let max_width = info.max_work_group_size_for_x().max(1);
    if info.is_adreno() {
        while width > 1 && width >= max_width {
            width /= 2;
        }
    } else {
        while width > max_width {
            width /= 2;
        }
    }
    width.max(1)
}

/// Work-group size for kernels with one work item per output pixel and slice.
///
/// Starts at 8x4x1, shrinks each axis to the grid rounded up to a power of two, then halves the
/// largest axis until every per-axis limit and the total limit hold.
pub fn default_work_group(grid: [usize; 3], info: &GpuInfo) -> [usize; 3] {
    let mut size = [8, 4, 1];
    for (axis, extent) in grid.into_iter().enumerate() {
        size[axis] = size[axis].min(extent.max(1).next_power_of_two());
    }
    loop {
        let within_axes = size.iter().zip(info.max_work_group_size).all(|(s, max)| *s <= max);
        let total = size.iter().product::<usize>();
        if within_axes && total <= info.max_work_group_total_size {
            return size;
        }
        let axis = (0..3).max_by_key(|axis| size[*axis]).unwrap_or(0);
        if size[axis] == 1 {
            return size;
        }
        size[axis] /= 2;
    }
}

/// Number of work groups needed to cover `grid`.
pub fn work_groups_count(grid: [usize; 3], work_group: [usize; 3]) -> [usize; 3] {
    [
        divide_round_up(grid[0], work_group[0]),
        divide_round_up(grid[1], work_group[1]),
        divide_round_up(grid[2], work_group[2]),
    ]
}
