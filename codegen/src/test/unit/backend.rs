use kiln_device::{Bhwc, GpuApi, GpuInfo, StorageType};
use kiln_dtype::CalculationsPrecision;

use crate::backend::{entry_point, translate};
use crate::ops::create_softmax1x1;
use crate::OperationDef;

fn softmax(precision: CalculationsPrecision) -> crate::GpuOperation {
    let definition = OperationDef::uniform(precision, StorageType::Buffer, 1, 1);
    create_softmax1x1(definition, &GpuInfo::generic(), Bhwc::new(1, 1, 1, 64)).unwrap()
}

const VOCABULARY: &[&str] =
    &["MAIN_FUNCTION", "LOCAL_MEM_BARRIER", "GLOBAL_ID_", "LOCAL_ID_", "GROUP_ID_", "INIT_FLOAT4", "FLT4", "$0"];

#[test]
fn test_opencl_spelling() {
    let source = translate(&softmax(CalculationsPrecision::F32), GpuApi::OpenCl);

    assert!(source.starts_with("__kernel void main_function("), "{source}");
    assert!(source.contains("__global float4* src_tensor"), "{source}");
    assert!(source.contains("float mask_x"), "{source}");
    assert!(source.contains("barrier(CLK_LOCAL_MEM_FENCE)"), "{source}");
    assert!(source.contains("get_local_id(0)"), "{source}");
    assert!(source.contains("(float4)(args.mask_x"), "{source}");
    assert!(source.contains("__local float loc_mem[16];"), "{source}");
    for token in VOCABULARY {
        assert!(!source.contains(token), "Untranslated {token}:\n{source}");
    }
}

#[test]
fn test_metal_spelling() {
    let source = translate(&softmax(CalculationsPrecision::F32), GpuApi::Metal);

    assert!(source.starts_with(&format!("kernel void {}(", entry_point(GpuApi::Metal))), "{source}");
    assert!(source.contains("threadgroup_barrier(mem_flags::mem_threadgroup)"), "{source}");
    assert!(source.contains("threadgroup float loc_mem[16];"), "{source}");
    assert!(source.contains("static_cast<int>(reserved_lid.x)"), "{source}");
    assert!(source.contains("[[thread_position_in_grid]]"), "{source}");
    for token in VOCABULARY {
        assert!(!source.contains(token), "Untranslated {token}:\n{source}");
    }
}

#[test]
fn test_half_storage_types() {
    let source = translate(&softmax(CalculationsPrecision::F16), GpuApi::OpenCl);
    assert!(source.contains("__global half4* dst_tensor"), "{source}");
    assert!(source.contains("convert_half4(exp(src) * sum)"), "{source}");
}
