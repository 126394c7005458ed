//! Tensor descriptors: logical shape, element type and physical storage layout.

use kiln_dtype::DataType;
use snafu::ensure;

use crate::error::{Result, ShapeSnafu, SizeMismatchSnafu};
use crate::shape::Bhwdc;

/// Physical layout of a tensor in device memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[derive(strum::Display, strum::EnumIter, strum::VariantArray)]
pub enum StorageType {
    /// Linear buffer of 4-channel pixels.
    Buffer,
    /// Buffer addressed through a 1D image view.
    ImageBuffer,
    Texture2D,
    Texture3D,
    TextureArray,
    /// 2D image whose pixels hold all channels of one position (at most 4).
    SingleTexture2D,
}

impl StorageType {
    pub const ALL: [StorageType; 6] = [
        Self::Buffer,
        Self::ImageBuffer,
        Self::Texture2D,
        Self::Texture3D,
        Self::TextureArray,
        Self::SingleTexture2D,
    ];

    /// Whether the storage is backed by plain buffer memory.
    pub const fn is_buffer_based(self) -> bool {
        matches!(self, Self::Buffer | Self::ImageBuffer)
    }

    /// Whether the storage is a 2D image with one row pitch.
    pub const fn is_texture_2d(self) -> bool {
        matches!(self, Self::Texture2D | Self::SingleTexture2D)
    }
}

/// Logical shape, element type and storage of one tensor, optionally carrying host data.
///
/// Host data is flat BHWDC with channels innermost, each element encoded in `data_type`.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorDescriptor {
    pub data_type: DataType,
    pub storage_type: StorageType,
    pub shape: Bhwdc,
    pub data: Vec<u8>,
}

impl TensorDescriptor {
    pub fn new(data_type: DataType, storage_type: StorageType, shape: Bhwdc) -> Self {
        Self { data_type, storage_type, shape, data: Vec::new() }
    }

    /// Descriptor with shape left unset, as operation definitions declare their slots.
    pub fn slot(data_type: DataType, storage_type: StorageType) -> Self {
        Self::new(data_type, storage_type, Bhwdc::default())
    }

    pub fn with_shape(&self, shape: Bhwdc) -> Self {
        Self { data_type: self.data_type, storage_type: self.storage_type, shape, data: Vec::new() }
    }

    /// Same shape and types, without host data.
    pub fn without_data(&self) -> Self {
        self.with_shape(self.shape)
    }

    pub fn slices(&self) -> usize {
        self.shape.slices()
    }

    /// Number of elements one device pixel holds.
    pub fn channels_per_pixel(&self) -> usize {
        match self.storage_type {
            StorageType::SingleTexture2D => self.shape.c,
            _ => 4,
        }
    }

    /// Bytes needed to hold the tensor in its storage layout, without row padding.
    pub fn memory_size_in_bytes(&self) -> usize {
        let s = &self.shape;
        match self.storage_type {
            StorageType::SingleTexture2D => self.data_type.size() * s.b * s.w * s.h * s.d * s.c,
            _ => self.data_type.vec4_size() * s.b * s.w * s.h * s.d * self.slices(),
        }
    }

    /// Check the shape can be materialized in this storage type.
    pub fn validate_shape(&self) -> Result<()> {
        ensure!(!self.shape.has_zero_dim(), ShapeSnafu { reason: format!("tensor shape {} has a zero dimension", self.shape) });
        if self.storage_type == StorageType::SingleTexture2D {
            ensure!(
                self.shape.c <= 4,
                ShapeSnafu { reason: format!("single-texture storage holds at most 4 channels, got {}", self.shape.c) }
            );
        }
        Ok(())
    }

    /// Set host data from floats, converting to the descriptor's data type.
    pub fn upload_f32(&mut self, values: &[f32]) -> Result<()> {
        let expected = self.shape.elements();
        ensure!(values.len() == expected, SizeMismatchSnafu { expected, actual: values.len() });
        self.data = self.data_type.encode(values);
        Ok(())
    }

    /// Host data decoded to floats.
    pub fn to_f32(&self) -> Vec<f32> {
        self.data_type.decode(&self.data)
    }
}
