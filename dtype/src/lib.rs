//! Element data types for kiln tensors and the precision modes kernels compute in.
//!
//! Only two element types exist on the device side: 32-bit and 16-bit floats. Every kernel stores
//! its tensors in one of them and computes in the mode picked by [`CalculationsPrecision`].

pub mod ext;


pub use ext::HostScalar;

/// Element type of a tensor as stored in device memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[derive(strum::Display, strum::EnumIter, strum::VariantArray)]
pub enum DataType {
    #[strum(to_string = "f32")]
    Float32,
    #[strum(to_string = "f16")]
    Float16,
}

impl DataType {
    /// Size of one element in bytes.
    pub const fn size(self) -> usize {
        match self {
            Self::Float32 => 4,
            Self::Float16 => 2,
        }
    }

    /// Size of one packed 4-element vector in bytes.
    pub const fn vec4_size(self) -> usize {
        self.size() * 4
    }

    /// Scalar spelling used in generated kernel source.
    pub const fn kernel_name(self) -> &'static str {
        match self {
            Self::Float32 => "float",
            Self::Float16 => "half",
        }
    }

    /// Read one element from the start of `bytes` as an `f32`.
    pub fn read_f32(self, bytes: &[u8]) -> f32 {
        match self {
            Self::Float32 => f32::read_le(bytes).to_f32(),
            Self::Float16 => half::f16::read_le(bytes).to_f32(),
        }
    }

    /// Write `value` into the start of `bytes`, rounding to the element type.
    pub fn write_f32(self, value: f32, bytes: &mut [u8]) {
        match self {
            Self::Float32 => value.write_le(bytes),
            Self::Float16 => half::f16::from_f32(value).write_le(bytes),
        }
    }

    /// Encode a slice of floats into packed little-endian elements.
    pub fn encode(self, values: &[f32]) -> Vec<u8> {
        let mut bytes = vec![0u8; values.len() * self.size()];
        for (value, chunk) in values.iter().zip(bytes.chunks_exact_mut(self.size())) {
            self.write_f32(*value, chunk);
        }
        bytes
    }

    /// Decode packed little-endian elements into floats.
    pub fn decode(self, bytes: &[u8]) -> Vec<f32> {
        bytes.chunks_exact(self.size()).map(|chunk| self.read_f32(chunk)).collect()
    }

    /// Round a value through this element type.
    pub fn round(self, value: f32) -> f32 {
        match self {
            Self::Float32 => value,
            Self::Float16 => half::f16::from_f32(value).to_f32(),
        }
    }
}

/// Precision mode of a compiled operation.
///
/// `F32F16` stores tensors as 16-bit floats but accumulates in 32-bit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[derive(strum::Display, strum::EnumIter, strum::VariantArray)]
pub enum CalculationsPrecision {
    #[default]
    F32,
    F32F16,
    F16,
}

impl CalculationsPrecision {
    /// Data type tensors are stored in under this precision.
    pub const fn storage_data_type(self) -> DataType {
        match self {
            Self::F32 => DataType::Float32,
            Self::F32F16 | Self::F16 => DataType::Float16,
        }
    }

    /// Data type intermediate values are accumulated in.
    pub const fn accumulator_data_type(self) -> DataType {
        match self {
            Self::F32 | Self::F32F16 => DataType::Float32,
            Self::F16 => DataType::Float16,
        }
    }

    /// Whether the device must support half precision arithmetic or storage.
    pub const fn needs_fp16(self) -> bool {
        !matches!(self, Self::F32)
    }
}
