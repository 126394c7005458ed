//! Device capability model.
//!
//! A [`GpuInfo`] describes one accelerator: vendor family, API, work-group limits, image limits and
//! which storage types it can back tensors with. Operation generators and the memory manager only
//! ever read it.

use bon::bon;
use kiln_dtype::DataType;
use smallvec::SmallVec;
use tracing::warn;

use crate::StorageType;

/// GPU vendor family. Several tuning heuristics branch on it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[derive(strum::Display, strum::EnumString, strum::EnumIter, strum::VariantArray)]
#[strum(ascii_case_insensitive)]
pub enum GpuVendor {
    Adreno,
    Mali,
    PowerVr,
    Apple,
    Nvidia,
    Amd,
    Intel,
    #[default]
    Unknown,
}

/// Kernel language the device consumes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, strum::Display)]
pub enum GpuApi {
    #[default]
    OpenCl,
    Metal,
}

/// Limits and capabilities of one accelerator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuInfo {
    pub vendor: GpuVendor,
    pub api: GpuApi,
    /// Maximum work-group size per axis.
    pub max_work_group_size: [usize; 3],
    /// Maximum number of lanes in one work group.
    pub max_work_group_total_size: usize,
    pub max_image2d_width: usize,
    pub max_image2d_height: usize,
    pub max_image3d_depth: usize,
    pub max_image_array_layers: usize,
    /// Maximum number of pixels addressable through an image buffer.
    pub max_image_buffer_width: usize,
    pub max_buffer_size: usize,
    /// Row pitch alignment, in pixels, for 2D images created over buffers.
    pub image_pitch_alignment: usize,
    /// Local (shared) memory per work group, in bytes.
    pub local_memory_size: usize,
    pub supports_fp16: bool,
    pub storage_types: SmallVec<[StorageType; 6]>,
}

#[bon]
impl GpuInfo {
    /// Describe a device, falling back to [`GpuInfo::generic`] limits for anything not given.
    #[builder]
    pub fn new(
        #[builder(default)] vendor: GpuVendor,
        #[builder(default)] api: GpuApi,
        #[builder(default = [256, 256, 64])] max_work_group_size: [usize; 3],
        #[builder(default = 256)] max_work_group_total_size: usize,
        #[builder(default = 8192)] max_image2d_width: usize,
        #[builder(default = 8192)] max_image2d_height: usize,
        #[builder(default = 2048)] max_image3d_depth: usize,
        #[builder(default = 2048)] max_image_array_layers: usize,
        #[builder(default = 1 << 26)] max_image_buffer_width: usize,
        #[builder(default = 1 << 30)] max_buffer_size: usize,
        #[builder(default = 32)] image_pitch_alignment: usize,
        #[builder(default = 32 * 1024)] local_memory_size: usize,
        #[builder(default = true)] supports_fp16: bool,
        #[builder(default = StorageType::ALL.iter().copied().collect())] storage_types: SmallVec<[StorageType; 6]>,
    ) -> Self {
        Self {
            vendor,
            api,
            max_work_group_size,
            max_work_group_total_size,
            max_image2d_width,
            max_image2d_height,
            max_image3d_depth,
            max_image_array_layers,
            max_image_buffer_width,
            max_buffer_size,
            image_pitch_alignment,
            local_memory_size,
            supports_fp16,
            storage_types,
        }
    }
}

impl GpuInfo {
    /// Conservative OpenCL device with no vendor-specific tuning.
    pub fn generic() -> Self {
        Self::builder().build()
    }

    pub fn adreno() -> Self {
        Self::builder()
            .vendor(GpuVendor::Adreno)
            .max_work_group_size([1024, 1024, 1024])
            .max_work_group_total_size(1024)
            .max_image2d_width(16384)
            .max_image2d_height(16384)
            .image_pitch_alignment(64)
            .build()
    }

    pub fn mali() -> Self {
        Self::builder()
            .vendor(GpuVendor::Mali)
            .max_work_group_size([384, 384, 384])
            .max_work_group_total_size(384)
            .max_image2d_width(65536)
            .max_image2d_height(65536)
            .image_pitch_alignment(16)
            .build()
    }

    pub fn apple() -> Self {
        Self::builder()
            .vendor(GpuVendor::Apple)
            .api(GpuApi::Metal)
            .max_work_group_size([1024, 1024, 1024])
            .max_work_group_total_size(1024)
            .max_image2d_width(16384)
            .max_image2d_height(16384)
            .image_pitch_alignment(16)
            .build()
    }

    /// Apply overrides from the environment.
    ///
    /// # Environment Variables
    ///
    /// * `KILN_GPU_VENDOR=<name>` - Treat the device as the given vendor family
    /// * `KILN_MAX_WORK_GROUP_SIZE_X=N` - Cap the work-group width
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(vendor) = std::env::var("KILN_GPU_VENDOR") {
            match vendor.parse::<GpuVendor>() {
                Ok(vendor) => self.vendor = vendor,
                Err(_) => warn!(vendor = %vendor, "ignoring unknown KILN_GPU_VENDOR"),
            }
        }

        if let Ok(width) = std::env::var("KILN_MAX_WORK_GROUP_SIZE_X") {
            match width.parse::<usize>() {
                Ok(width) if width > 0 => self.max_work_group_size[0] = width,
                _ => warn!(width = %width, "ignoring invalid KILN_MAX_WORK_GROUP_SIZE_X"),
            }
        }

        self
    }

    pub fn is_adreno(&self) -> bool {
        self.vendor == GpuVendor::Adreno
    }

    pub fn is_mali(&self) -> bool {
        self.vendor == GpuVendor::Mali
    }

    pub fn is_power_vr(&self) -> bool {
        self.vendor == GpuVendor::PowerVr
    }

    pub fn is_apple(&self) -> bool {
        self.vendor == GpuVendor::Apple
    }

    pub fn is_api_metal(&self) -> bool {
        self.api == GpuApi::Metal
    }

    pub fn max_work_group_size_for_x(&self) -> usize {
        self.max_work_group_size[0]
    }

    /// Storage types able to hold tensors of `data_type`.
    pub fn supported_storage_types(&self, data_type: DataType) -> SmallVec<[StorageType; 6]> {
        if data_type == DataType::Float16 && !self.supports_fp16 {
            return SmallVec::new();
        }
        self.storage_types.clone()
    }

    pub fn is_storage_supported(&self, storage: StorageType, data_type: DataType) -> bool {
        self.supported_storage_types(data_type).contains(&storage)
    }
}

impl std::fmt::Display for GpuInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.vendor, self.api)
    }
}
