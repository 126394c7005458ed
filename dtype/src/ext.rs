use super::*;

/// Host scalar types that map onto a device [`DataType`].
pub trait HostScalar: Copy {
    const DATA_TYPE: DataType;

    fn to_f32(self) -> f32;
    fn from_f32(value: f32) -> Self;
    fn read_le(bytes: &[u8]) -> Self;
    fn write_le(self, bytes: &mut [u8]);
}

impl HostScalar for f32 {
    const DATA_TYPE: DataType = DataType::Float32;

    fn to_f32(self) -> f32 {
        self
    }

    fn from_f32(value: f32) -> Self {
        value
    }

    fn read_le(bytes: &[u8]) -> Self {
        f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    fn write_le(self, bytes: &mut [u8]) {
        bytes[..4].copy_from_slice(&self.to_le_bytes());
    }
}

impl HostScalar for half::f16 {
    const DATA_TYPE: DataType = DataType::Float16;

    fn to_f32(self) -> f32 {
        half::f16::to_f32(self)
    }

    fn from_f32(value: f32) -> Self {
        half::f16::from_f32(value)
    }

    fn read_le(bytes: &[u8]) -> Self {
        half::f16::from_le_bytes([bytes[0], bytes[1]])
    }

    fn write_le(self, bytes: &mut [u8]) {
        bytes[..2].copy_from_slice(&self.to_le_bytes());
    }
}
