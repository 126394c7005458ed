//! Translation of the kernel macro vocabulary into OpenCL or Metal spellings.
//!
//! Generators emit a small fixed vocabulary (`MAIN_FUNCTION`, `LOCAL_MEM_BARRIER`, `GLOBAL_ID_n`,
//! `LOCAL_ID_n`, `GROUP_ID_n`, `INIT_FLOAT4`, `INIT_FLOAT4v4`, `FLT4`, `TO_FLT4`, `INIT_FLT4`, `ACCUM_FLT4`,
//! `INIT_ACCUM_FLT4`, `TO_ACCUM_TYPE`, `__local`).
//! Everything else is passed through untouched.

use kiln_device::{GpuApi, StorageType};
use kiln_dtype::CalculationsPrecision;

use crate::operation::{GpuOperation, KernelParameter};

/// Entry point name for each backend.
pub fn entry_point(api: GpuApi) -> &'static str {
    match api {
        GpuApi::OpenCl => "main_function",
        GpuApi::Metal => "ComputeFunction",
    }
}

fn parameter(api: GpuApi, index: usize, parameter: &KernelParameter, precision: CalculationsPrecision) -> String {
    let flt4 = vec4_type(precision.storage_data_type().kernel_name());
    match (api, parameter) {
        (GpuApi::OpenCl, KernelParameter::Tensor { name, storage }) => match storage {
            StorageType::Buffer => format!("__global {flt4}* {name}"),
            StorageType::ImageBuffer => format!("__read_write image1d_buffer_t {name}"),
            StorageType::Texture2D | StorageType::SingleTexture2D => format!("__read_write image2d_t {name}"),
            StorageType::Texture3D => format!("__read_write image3d_t {name}"),
            StorageType::TextureArray => format!("__read_write image2d_array_t {name}"),
        },
        (GpuApi::OpenCl, KernelParameter::Buffer { name }) => format!("__global {flt4}* {name}"),
        (GpuApi::OpenCl, KernelParameter::Int { name }) => format!("int {name}"),
        (GpuApi::OpenCl, KernelParameter::Float { name }) => format!("float {name}"),
        (GpuApi::Metal, KernelParameter::Tensor { name, storage }) => match storage {
            StorageType::Buffer | StorageType::ImageBuffer => format!("device {flt4}* {name} [[buffer({index})]]"),
            StorageType::Texture2D | StorageType::SingleTexture2D => {
                format!("texture2d<float, access::read_write> {name} [[texture({index})]]")
            }
            StorageType::Texture3D => format!("texture3d<float, access::read_write> {name} [[texture({index})]]"),
            StorageType::TextureArray => {
                format!("texture2d_array<float, access::read_write> {name} [[texture({index})]]")
            }
        },
        (GpuApi::Metal, KernelParameter::Buffer { name }) => format!("device {flt4}* {name} [[buffer({index})]]"),
        (GpuApi::Metal, KernelParameter::Int { name }) => format!("constant int& {name} [[buffer({index})]]"),
        (GpuApi::Metal, KernelParameter::Float { name }) => format!("constant float& {name} [[buffer({index})]]"),
    }
}

fn vec4_type(scalar: &str) -> String {
    format!("{scalar}4")
}

/// Translate an operation's source for `api`.
pub fn translate(operation: &GpuOperation, api: GpuApi) -> String {
    let precision = operation.definition().precision;
    let mut params = operation
        .kernel_parameters()
        .iter()
        .enumerate()
        .map(|(index, p)| parameter(api, index, p, precision))
        .collect::<Vec<_>>();

    let flt4 = vec4_type(precision.storage_data_type().kernel_name());
    let accum4 = vec4_type(precision.accumulator_data_type().kernel_name());
    let ids = ["x", "y", "z"];
    let mut replacements = Vec::new();
    match api {
        GpuApi::OpenCl => {
            replacements.push(("MAIN_FUNCTION($0)".to_string(), format!("__kernel void {}($0)", entry_point(api))));
            replacements.push(("LOCAL_MEM_BARRIER".to_string(), "barrier(CLK_LOCAL_MEM_FENCE)".to_string()));
            for (axis, _) in ids.iter().enumerate() {
                replacements.push((format!("GLOBAL_ID_{axis}"), format!("get_global_id({axis})")));
                replacements.push((format!("LOCAL_ID_{axis}"), format!("get_local_id({axis})")));
                replacements.push((format!("GROUP_ID_{axis}"), format!("get_group_id({axis})")));
            }
            replacements.push(("INIT_FLOAT4v4(".to_string(), "(float4)(".to_string()));
            replacements.push(("INIT_FLOAT4(".to_string(), "(float4)(".to_string()));
            replacements.push(("INIT_ACCUM_FLT4(".to_string(), format!("({accum4})(")));
            replacements.push(("TO_ACCUM_TYPE(".to_string(), format!("convert_{accum4}(")));
            replacements.push(("TO_FLT4(".to_string(), format!("convert_{flt4}(")));
            replacements.push(("INIT_FLT4(".to_string(), format!("({flt4})(")));
        }
        GpuApi::Metal => {
            params.push("uint3 reserved_gid [[thread_position_in_grid]]".to_string());
            params.push("uint3 reserved_lid [[thread_position_in_threadgroup]]".to_string());
            params.push("uint3 reserved_group_id [[threadgroup_position_in_grid]]".to_string());
            replacements.push(("MAIN_FUNCTION($0)".to_string(), format!("kernel void {}($0)", entry_point(api))));
            replacements
                .push(("LOCAL_MEM_BARRIER".to_string(), "threadgroup_barrier(mem_flags::mem_threadgroup)".to_string()));
            for (axis, id) in ids.iter().enumerate() {
                replacements.push((format!("GLOBAL_ID_{axis}"), format!("static_cast<int>(reserved_gid.{id})")));
                replacements.push((format!("LOCAL_ID_{axis}"), format!("static_cast<int>(reserved_lid.{id})")));
                replacements.push((format!("GROUP_ID_{axis}"), format!("static_cast<int>(reserved_group_id.{id})")));
            }
            replacements.push(("INIT_FLOAT4v4(".to_string(), "float4(".to_string()));
            replacements.push(("INIT_FLOAT4(".to_string(), "float4(".to_string()));
            replacements.push(("INIT_ACCUM_FLT4(".to_string(), format!("{accum4}(")));
            replacements.push(("TO_ACCUM_TYPE(".to_string(), format!("{accum4}(")));
            replacements.push(("TO_FLT4(".to_string(), format!("{flt4}(")));
            replacements.push(("INIT_FLT4(".to_string(), format!("{flt4}(")));
            replacements.push(("__local".to_string(), "threadgroup".to_string()));
        }
    }
    replacements.push(("ACCUM_FLT4".to_string(), accum4));
    replacements.push(("FLT4".to_string(), flt4));

    let mut code = operation.code().to_string();
    for (from, to) in &replacements {
        code = code.replace(from.as_str(), to);
    }
    code.replace("$0", &params.join(",\n    "))
}
