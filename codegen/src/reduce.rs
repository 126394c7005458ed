//! Local-memory tree reduction shared by the softmax and normalization kernels.
//!
//! Every lane first stores its partial value into `loc_mem[tid]`. Each stage is preceded by a barrier;
//! lanes whose id is a multiple of `stride * stage` fold in the `stage - 1` neighbours at `stride`
//! spacing. The last stage is done by lane 0 alone, and a final barrier publishes `loc_mem[0]`.

use smallvec::{SmallVec, smallvec};

use crate::error::{Result, UnsupportedConfigurationSnafu};

/// Combining operator of a group reduction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    Sum,
    Max,
}

impl ReduceOp {
    pub fn combine(self, a: f32, b: f32) -> f32 {
        match self {
            Self::Sum => a + b,
            Self::Max => a.max(b),
        }
    }

    fn accumulate(self, acc: &str, value: &str) -> String {
        match self {
            Self::Sum => format!("{acc} = {acc} + {value}"),
            Self::Max => format!("{acc} = max({acc}, {value})"),
        }
    }
}

/// Stage decomposition of a group reduction over `size` lanes.
pub fn reduce_stages(size: usize) -> Result<SmallVec<[usize; 4]>> {
    let stages = match size {
        1024 => smallvec![8, 8, 4, 4],
        512 => smallvec![8, 8, 8],
        256 => smallvec![8, 8, 4],
        128 => smallvec![8, 4, 4],
        64 => smallvec![8, 8],
        32 => smallvec![8, 4],
        16 => smallvec![4, 4],
        1..=8 => smallvec![size],
        _ => {
            return UnsupportedConfigurationSnafu { reason: format!("no group reduction for {size} lanes") }.fail();
        }
    };
    Ok(stages)
}

/// Emit the reduction of `value` across the work group. `value` holds the result afterwards.
pub fn reduce_code(value: &str, op: ReduceOp, size: usize) -> Result<String> {
    let stages = reduce_stages(size)?;

    let mut c = String::new();
    c += "  LOCAL_MEM_BARRIER;\n";
    c += &format!("  loc_mem[tid] = {value};\n");
    let mut stride = 1;
    for (i, stage) in stages.iter().enumerate() {
        let last_stage = i == stages.len() - 1;
        let condition = if last_stage { "tid == 0".to_string() } else { format!("tid % {} == 0", stride * stage) };
        let location = if last_stage { "loc_mem[0]" } else { "loc_mem[tid]" };
        c += "  LOCAL_MEM_BARRIER;\n";
        c += &format!("  if ({condition}) {{\n");
        for j in 1..*stage {
            c += &format!("    {};\n", op.accumulate(value, &format!("loc_mem[tid + {}]", stride * j)));
        }
        c += &format!("    {location} = {value};\n");
        c += "  }\n";
        stride *= stage;
    }
    c += "  LOCAL_MEM_BARRIER;\n";
    c += &format!("  {value} = loc_mem[0];\n");
    Ok(c)
}

/// Run the staged reduction over one value per lane, phase by phase, as the emitted code does.
///
/// Every phase reads the local memory published by the previous barrier.
pub fn reduce_group(lanes: &[f32], op: ReduceOp) -> Result<f32> {
    let stages = reduce_stages(lanes.len())?;
    let mut values = lanes.to_vec();
    let mut loc_mem = lanes.to_vec();
    let mut stride = 1;
    for (i, stage) in stages.iter().enumerate() {
        let last_stage = i == stages.len() - 1;
        let published = loc_mem.clone();
        for tid in 0..lanes.len() {
            let active = if last_stage { tid == 0 } else { tid % (stride * stage) == 0 };
            if !active {
                continue;
            }
            for j in 1..*stage {
                values[tid] = op.combine(values[tid], published[tid + stride * j]);
            }
            loc_mem[if last_stage { 0 } else { tid }] = values[tid];
        }
        stride *= stage;
    }
    Ok(loc_mem[0])
}

/// Per-lane multipliers selecting the valid channels of the last slice.
pub fn mask_for_last_plane(channels: usize) -> [f32; 4] {
    let reminder = match channels % 4 {
        0 => 4,
        r => r,
    };
    std::array::from_fn(|i| if i < reminder { 1.0 } else { 0.0 })
}
