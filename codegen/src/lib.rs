//! Kernel generation for kiln tensor operations.
//!
//! Each generator in [`ops`] turns an [`OperationDef`] plus primitive attributes into a
//! [`GpuOperation`]: kernel source in a small macro vocabulary, a device-tuned work-group size and a
//! table of named [`Arguments`]. [`backend::translate`] spells the source for OpenCL or Metal.
//!
//! ```ignore
//! use kiln_codegen::{OperationDef, ops::create_softmax1x1};
//!
//! let definition = OperationDef::uniform(CalculationsPrecision::F32, StorageType::Buffer, 1, 1);
//! let softmax = create_softmax1x1(definition, &GpuInfo::adreno(), Bhwc::new(1, 1, 1, 1000))?;
//! let source = kiln_codegen::backend::translate(&softmax, GpuApi::OpenCl);
//! ```

pub mod arguments;
pub mod backend;
pub mod error;
pub mod operation;
pub mod ops;
pub mod reduce;
pub mod weights;
pub mod work_group;


pub use arguments::{Arguments, ArgumentsBinder, GpuObject};
pub use error::{Error, Result};
pub use operation::{
    DepthwiseConvParams, ElementwiseOp, ElementwiseParams, GpuOperation, KernelParameter, NormalizationParams,
    OperationDef, OperationKind, SecondOperand, WeightsSource, WeightsStorage,
};
pub use ops::elementwise::ElementwiseOperand;
pub use reduce::{ReduceOp, mask_for_last_plane, reduce_code, reduce_group, reduce_stages};
pub use weights::{
    Linear, Ohwdi, Ohwi, Weights, rearrange_weights_for_dw_conv2d_f16, rearrange_weights_for_dw_conv2d_f32,
    rearrange_weights_for_dw_conv3d_f16, rearrange_weights_for_dw_conv3d_f32,
};
pub use work_group::{
    NORMALIZATION_WORK_GROUP, SOFTMAX_WORK_GROUP, VendorDefaults, default_work_group, reduction_work_group_width,
    work_groups_count,
};
