use snafu::Snafu;

use crate::StorageType;
use kiln_dtype::DataType;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// Tensor dimensions are invalid or inconsistent.
    #[snafu(display("invalid shape: {reason}"))]
    Shape { reason: String },

    /// Storage type, data type and device combination is not implemented.
    #[snafu(display("unsupported configuration: {reason}"))]
    UnsupportedConfiguration { reason: String },

    /// Storage type cannot hold the data type on this device.
    #[snafu(display("storage {storage:?} with {data_type} is not supported by {device}"))]
    UnsupportedStorage { storage: StorageType, data_type: DataType, device: String },

    /// Device memory exhausted or allocation rejected by device limits.
    #[snafu(display("allocation of {size} bytes failed: {reason}"))]
    Allocation { size: usize, reason: String },

    #[snafu(display("size mismatch: expected {expected}, got {actual}"))]
    SizeMismatch { expected: usize, actual: usize },

    /// Invalid memory view parameters.
    #[snafu(display("invalid view: offset {offset} + size {size} exceeds memory size {memory_size}"))]
    InvalidView { offset: usize, size: usize, memory_size: usize },

    /// Borrowed memory was released by its owner while a tensor still referenced it.
    #[snafu(display("borrowed device memory has been released by its owner"))]
    MemoryReleased,
}

impl Error {
    /// Whether the error reports an unsupported storage/precision/device combination.
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::UnsupportedConfiguration { .. } | Self::UnsupportedStorage { .. })
    }
}
