//! Device storage layouts and host repacking.
//!
//! Host data is always flat BHWDC with channels innermost. On the device every storage type packs
//! channels into 4-wide pixels (one pixel per slice), except [`StorageType::SingleTexture2D`] where a
//! pixel holds all channels. Batch is folded into the image width as `x * batch + b`.

use kiln_dtype::DataType;
use snafu::ensure;

use crate::error::{AllocationSnafu, Result, SizeMismatchSnafu};
use crate::gpu_info::GpuInfo;
use crate::shape::Bhwdc;
use crate::{StorageType, TensorDescriptor};

/// Addressing of one tensor's elements inside its device memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TensorLayout {
    pub shape: Bhwdc,
    pub storage_type: StorageType,
    pub data_type: DataType,
    /// Pixels per image row; only differs from `width * batch` for 2D images over aligned buffers.
    pub row_pitch: usize,
}

impl TensorLayout {
    pub fn new(descriptor: &TensorDescriptor) -> Self {
        let shape = descriptor.shape;
        Self {
            shape,
            storage_type: descriptor.storage_type,
            data_type: descriptor.data_type,
            row_pitch: shape.w * shape.b,
        }
    }

    pub(crate) fn with_row_pitch(descriptor: &TensorDescriptor, row_pitch: usize) -> Self {
        debug_assert!(row_pitch >= descriptor.shape.w * descriptor.shape.b);
        Self { row_pitch, ..Self::new(descriptor) }
    }

    pub fn slices(&self) -> usize {
        self.shape.slices()
    }

    pub fn channels_per_pixel(&self) -> usize {
        match self.storage_type {
            StorageType::SingleTexture2D => self.shape.c,
            _ => 4,
        }
    }

    pub fn pixel_size(&self) -> usize {
        self.channels_per_pixel() * self.data_type.size()
    }

    /// Image extent in pixels as (width, height, depth or layers). Buffers are one long row.
    pub fn image_extent(&self) -> [usize; 3] {
        let Bhwdc { b, h, w, d, .. } = self.shape;
        let s = self.slices();
        match self.storage_type {
            StorageType::Buffer | StorageType::ImageBuffer => [w * b * h * d * s, 1, 1],
            StorageType::Texture2D => [w * b, h * d * s, 1],
            StorageType::SingleTexture2D => [w * b, h * d, 1],
            StorageType::Texture3D | StorageType::TextureArray => [w * b, h, d * s],
        }
    }

    /// Bytes spanned by the layout, including row padding.
    pub fn size_in_bytes(&self) -> usize {
        let [width, height, depth] = self.image_extent();
        let row = if self.storage_type.is_texture_2d() { self.row_pitch } else { width };
        row * height * depth * self.pixel_size()
    }

    /// Byte offset of the pixel holding slice `s` at (b, x, y, d).
    pub fn pixel_offset(&self, b: usize, x: usize, y: usize, d: usize, s: usize) -> usize {
        let Bhwdc { b: batch, h, w, d: depth, .. } = self.shape;
        let slices = self.slices();
        let tx = x * batch + b;
        let pixel = match self.storage_type {
            StorageType::Buffer | StorageType::ImageBuffer => (((s * depth + d) * h + y) * w + x) * batch + b,
            StorageType::Texture2D => ((y * depth + d) * slices + s) * self.row_pitch + tx,
            StorageType::SingleTexture2D => (y * depth + d) * self.row_pitch + tx,
            StorageType::Texture3D | StorageType::TextureArray => ((d * slices + s) * h + y) * w * batch + tx,
        };
        pixel * self.pixel_size()
    }

    /// Byte offset of channel `c` at (b, x, y, d).
    pub fn element_offset(&self, b: usize, x: usize, y: usize, d: usize, c: usize) -> usize {
        let per_pixel = self.channels_per_pixel();
        self.pixel_offset(b, x, y, d, c / per_pixel) + (c % per_pixel) * self.data_type.size()
    }

    /// Reject layouts the device cannot materialize.
    pub fn validate_limits(&self, info: &GpuInfo) -> Result<()> {
        let size = self.size_in_bytes();
        let [width, height, depth] = self.image_extent();
        let fail = |reason: String| AllocationSnafu { size, reason }.fail();

        match self.storage_type {
            StorageType::Buffer => {
                ensure!(size <= info.max_buffer_size, AllocationSnafu { size, reason: "exceeds max buffer size" });
            }
            StorageType::ImageBuffer => {
                if width > info.max_image_buffer_width {
                    return fail(format!("{width} pixels exceed image buffer width {}", info.max_image_buffer_width));
                }
            }
            StorageType::Texture2D | StorageType::SingleTexture2D => {
                if width > info.max_image2d_width || height > info.max_image2d_height {
                    return fail(format!(
                        "image {width}x{height} exceeds {}x{}",
                        info.max_image2d_width, info.max_image2d_height
                    ));
                }
            }
            StorageType::Texture3D => {
                if width > info.max_image2d_width || height > info.max_image2d_height || depth > info.max_image3d_depth {
                    return fail(format!("image {width}x{height}x{depth} exceeds device 3D image limits"));
                }
            }
            StorageType::TextureArray => {
                if width > info.max_image2d_width
                    || height > info.max_image2d_height
                    || depth > info.max_image_array_layers
                {
                    return fail(format!("image array {width}x{height} with {depth} layers exceeds device limits"));
                }
            }
        }
        Ok(())
    }

    /// Repack host BHWDC elements into device bytes; padding channels are zero.
    pub fn pack(&self, host: &[u8]) -> Result<Vec<u8>> {
        let elem = self.data_type.size();
        let expected = self.shape.elements() * elem;
        ensure!(host.len() == expected, SizeMismatchSnafu { expected, actual: host.len() });

        let mut device = vec![0u8; self.size_in_bytes()];
        self.for_each_element(|host_offset, device_offset| {
            device[device_offset..device_offset + elem].copy_from_slice(&host[host_offset..host_offset + elem]);
        });
        Ok(device)
    }

    /// Gather device bytes back into host BHWDC order, dropping padding.
    pub fn unpack(&self, device: &[u8]) -> Result<Vec<u8>> {
        let elem = self.data_type.size();
        ensure!(device.len() >= self.size_in_bytes(), SizeMismatchSnafu { expected: self.size_in_bytes(), actual: device.len() });

        let mut host = vec![0u8; self.shape.elements() * elem];
        self.for_each_element(|host_offset, device_offset| {
            host[host_offset..host_offset + elem].copy_from_slice(&device[device_offset..device_offset + elem]);
        });
        Ok(host)
    }

    fn for_each_element(&self, mut f: impl FnMut(usize, usize)) {
        let shape = self.shape;
        let elem = self.data_type.size();
        for b in 0..shape.b {
            for y in 0..shape.h {
                for x in 0..shape.w {
                    for d in 0..shape.d {
                        for c in 0..shape.c {
                            f(shape.linear_index(b, y, x, d, c) * elem, self.element_offset(b, x, y, d, c));
                        }
                    }
                }
            }
        }
    }
}
