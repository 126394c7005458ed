use kiln_dtype::DataType;
use test_case::test_case;

use crate::{GpuApi, GpuInfo, GpuVendor, StorageType};

#[test_case(GpuInfo::adreno(), GpuVendor::Adreno, GpuApi::OpenCl; "adreno")]
#[test_case(GpuInfo::mali(), GpuVendor::Mali, GpuApi::OpenCl; "mali")]
#[test_case(GpuInfo::apple(), GpuVendor::Apple, GpuApi::Metal; "apple")]
#[test_case(GpuInfo::generic(), GpuVendor::Unknown, GpuApi::OpenCl; "generic")]
fn test_presets(info: GpuInfo, vendor: GpuVendor, api: GpuApi) {
    assert_eq!(info.vendor, vendor);
    assert_eq!(info.api, api);
    assert!(info.max_work_group_size_for_x() <= info.max_work_group_total_size);
}

#[test]
fn test_builder_defaults_match_generic() {
    let info = GpuInfo::builder().max_buffer_size(1024).build();
    assert_eq!(info.max_buffer_size, 1024);
    assert_eq!(info.max_work_group_size, GpuInfo::generic().max_work_group_size);
}

#[test]
fn test_fp16_storage_requires_support() {
    let info = GpuInfo::builder().supports_fp16(false).build();
    assert!(info.supported_storage_types(DataType::Float16).is_empty());
    assert!(info.is_storage_supported(StorageType::Buffer, DataType::Float32));
    assert!(!info.is_storage_supported(StorageType::Buffer, DataType::Float16));
}

#[test]
fn test_restricted_storage_types() {
    let info = GpuInfo::builder().storage_types([StorageType::Buffer].into_iter().collect()).build();
    assert!(info.is_storage_supported(StorageType::Buffer, DataType::Float32));
    assert!(!info.is_storage_supported(StorageType::Texture2D, DataType::Float32));
}

#[test_case("adreno", GpuVendor::Adreno; "lowercase")]
#[test_case("Mali", GpuVendor::Mali; "capitalized")]
#[test_case("POWERVR", GpuVendor::PowerVr; "uppercase")]
fn test_vendor_parsing(name: &str, vendor: GpuVendor) {
    assert_eq!(name.parse::<GpuVendor>().unwrap(), vendor);
}
