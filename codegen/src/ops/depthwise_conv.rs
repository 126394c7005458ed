//! Depthwise convolution: 2D with constant or dynamic weights, and 3D.
//!
//! Each work item produces one destination slice of one pixel. Destination channel `d_ch` reads
//! source channel `d_ch / channel_multiplier`.

use kiln_device::{Bhwc, Bhwdc, GpuInfo, StorageType, TensorDescriptor};
use snafu::ensure;
use tracing::debug;

use crate::arguments::{Arguments, GpuObject};
use crate::error::{Result, ShapeSnafu, UnsupportedConfigurationSnafu};
use crate::operation::{DepthwiseConvParams, GpuOperation, OperationDef, OperationKind, WeightsSource, WeightsStorage};
use crate::weights::{Linear, Ohwdi, Ohwi, Weights, pack_dw_conv2d_weights, pack_dw_conv3d_weights, pack_linear};

use super::spatial_work_group;

/// Height and width pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Hw {
    pub h: i32,
    pub w: i32,
}

impl Hw {
    pub const fn new(h: i32, w: i32) -> Self {
        Self { h, w }
    }
}

/// Height, width and depth triple.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Hwd {
    pub h: i32,
    pub w: i32,
    pub d: i32,
}

impl Hwd {
    pub const fn new(h: i32, w: i32, d: i32) -> Self {
        Self { h, w, d }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DepthwiseConvolution2DAttributes {
    /// OHWI, `o` is the channel multiplier.
    pub weights: Weights<Ohwi>,
    /// One value per destination channel, or empty for no bias.
    pub bias: Linear,
    pub strides: Hw,
    pub dilations: Hw,
    pub padding_prepended: Hw,
    pub padding_appended: Hw,
}

impl Default for DepthwiseConvolution2DAttributes {
    fn default() -> Self {
        Self {
            weights: Weights { shape: Ohwi::new(1, 1, 1, 1), data: vec![1.0] },
            bias: Vec::new(),
            strides: Hw::new(1, 1),
            dilations: Hw::new(1, 1),
            padding_prepended: Hw::default(),
            padding_appended: Hw::default(),
        }
    }
}

impl DepthwiseConvolution2DAttributes {
    pub fn dst_channels(&self) -> usize {
        self.weights.shape.o * self.weights.shape.i
    }

    /// Destination shape for a source of shape `src`.
    pub fn output_shape(&self, src: Bhwc) -> Result<Bhwc> {
        let shape = self.weights.shape;
        let h = output_extent(src.h, shape.h, self.strides.h, self.dilations.h, self.padding_prepended.h, self.padding_appended.h)?;
        let w = output_extent(src.w, shape.w, self.strides.w, self.dilations.w, self.padding_prepended.w, self.padding_appended.w)?;
        Ok(Bhwc::new(src.b, h, w, self.dst_channels()))
    }

    fn validate(&self, dynamic: bool) -> Result<()> {
        let shape = self.weights.shape;
        ensure!(
            shape.o > 0 && shape.h > 0 && shape.w > 0 && shape.i > 0,
            ShapeSnafu { reason: format!("depthwise weights {}x{}x{}x{} have a zero dimension", shape.o, shape.h, shape.w, shape.i) }
        );
        if !dynamic {
            ensure_weights_len(self.weights.data.len(), shape.elements())?;
        }
        ensure_positive("stride", &[self.strides.h, self.strides.w])?;
        ensure_positive("dilation", &[self.dilations.h, self.dilations.w])?;
        ensure_non_negative(&[self.padding_prepended.h, self.padding_prepended.w, self.padding_appended.h, self.padding_appended.w])?;
        ensure_bias(&self.bias, self.dst_channels())
    }

    fn params(&self, weights: WeightsSource) -> DepthwiseConvParams {
        let shape = self.weights.shape;
        DepthwiseConvParams {
            kernel: [shape.w, shape.h, 1],
            strides: [self.strides.w as usize, self.strides.h as usize, 1],
            dilations: [self.dilations.w as usize, self.dilations.h as usize, 1],
            padding: [self.padding_prepended.w as usize, self.padding_prepended.h as usize, 0],
            channel_multiplier: shape.o,
            weights,
            is_3d: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DepthwiseConvolution3DAttributes {
    /// OHWDI, `o` is the channel multiplier.
    pub weights: Weights<Ohwdi>,
    pub bias: Linear,
    pub strides: Hwd,
    pub dilations: Hwd,
    pub padding_prepended: Hwd,
    pub padding_appended: Hwd,
}

impl Default for DepthwiseConvolution3DAttributes {
    fn default() -> Self {
        Self {
            weights: Weights { shape: Ohwdi::new(1, 1, 1, 1, 1), data: vec![1.0] },
            bias: Vec::new(),
            strides: Hwd::new(1, 1, 1),
            dilations: Hwd::new(1, 1, 1),
            padding_prepended: Hwd::default(),
            padding_appended: Hwd::default(),
        }
    }
}

impl DepthwiseConvolution3DAttributes {
    pub fn dst_channels(&self) -> usize {
        self.weights.shape.o * self.weights.shape.i
    }

    /// Destination shape for a source of shape `src`.
    pub fn output_shape(&self, src: Bhwdc) -> Result<Bhwdc> {
        let shape = self.weights.shape;
        let (s, dl, pre, app) = (self.strides, self.dilations, self.padding_prepended, self.padding_appended);
        let h = output_extent(src.h, shape.h, s.h, dl.h, pre.h, app.h)?;
        let w = output_extent(src.w, shape.w, s.w, dl.w, pre.w, app.w)?;
        let d = output_extent(src.d, shape.d, s.d, dl.d, pre.d, app.d)?;
        Ok(Bhwdc::new(src.b, h, w, d, self.dst_channels()))
    }

    fn validate(&self) -> Result<()> {
        let shape = self.weights.shape;
        ensure!(
            shape.o > 0 && shape.h > 0 && shape.w > 0 && shape.d > 0 && shape.i > 0,
            ShapeSnafu {
                reason: format!(
                    "depthwise weights {}x{}x{}x{}x{} have a zero dimension",
                    shape.o, shape.h, shape.w, shape.d, shape.i
                )
            }
        );
        ensure_weights_len(self.weights.data.len(), shape.elements())?;
        ensure_positive("stride", &[self.strides.h, self.strides.w, self.strides.d])?;
        ensure_positive("dilation", &[self.dilations.h, self.dilations.w, self.dilations.d])?;
        let (pre, app) = (self.padding_prepended, self.padding_appended);
        ensure_non_negative(&[pre.h, pre.w, pre.d, app.h, app.w, app.d])?;
        ensure_bias(&self.bias, self.dst_channels())
    }
}

fn output_extent(src: usize, kernel: usize, stride: i32, dilation: i32, prepended: i32, appended: i32) -> Result<usize> {
    let padded = src as i64 + prepended as i64 + appended as i64;
    let dilated = dilation as i64 * (kernel as i64 - 1) + 1;
    ensure!(
        stride > 0 && padded >= dilated,
        ShapeSnafu { reason: format!("kernel extent {dilated} does not fit padded input {padded}") }
    );
    Ok(((padded - dilated) / stride as i64 + 1) as usize)
}

fn ensure_weights_len(actual: usize, expected: usize) -> Result<()> {
    ensure!(actual == expected, ShapeSnafu { reason: format!("depthwise weights hold {actual} values, shape needs {expected}") });
    Ok(())
}

fn ensure_positive(what: &str, values: &[i32]) -> Result<()> {
    ensure!(values.iter().all(|v| *v > 0), ShapeSnafu { reason: format!("{what} values must be positive, got {values:?}") });
    Ok(())
}

fn ensure_non_negative(values: &[i32]) -> Result<()> {
    ensure!(values.iter().all(|v| *v >= 0), ShapeSnafu { reason: format!("padding must not be negative, got {values:?}") });
    Ok(())
}

fn ensure_bias(bias: &[f32], dst_channels: usize) -> Result<()> {
    ensure!(
        bias.is_empty() || bias.len() == dst_channels,
        ShapeSnafu { reason: format!("bias holds {} values for {dst_channels} destination channels", bias.len()) }
    );
    Ok(())
}

/// Source channels declared by the definition must match the weights, when the slot shape is known.
fn ensure_src_channels(definition: &OperationDef, channels: usize) -> Result<()> {
    if let Some(src) = definition.src_tensors.first().filter(|src| src.shape.c != 0) {
        ensure!(
            src.shape.c == channels,
            ShapeSnafu { reason: format!("source has {} channels, weights expect {channels}", src.shape.c) }
        );
    }
    Ok(())
}

/// Whether constant weights go into a linear buffer rather than a 2D texture.
pub fn use_buffers_for_weights(gpu_info: &GpuInfo, definition: &OperationDef) -> bool {
    let data_type = definition.precision.storage_data_type();
    gpu_info.is_apple()
        || definition.src_tensors.first().is_some_and(|src| src.storage_type.is_buffer_based())
        || !gpu_info.is_storage_supported(StorageType::Texture2D, data_type)
}

/// Build a 2D depthwise convolution, picking the weights storage for the device.
pub fn create_depthwise_convolution2d(
    gpu_info: &GpuInfo,
    definition: OperationDef,
    attr: &DepthwiseConvolution2DAttributes,
) -> Result<GpuOperation> {
    let storage = if use_buffers_for_weights(gpu_info, &definition) { WeightsStorage::Buffer } else { WeightsStorage::Texture2D };
    create_depthwise_convolution2d_with_storage(gpu_info, definition, attr, storage)
}

/// Build a 2D depthwise convolution with constant weights in `storage`.
pub fn create_depthwise_convolution2d_with_storage(
    gpu_info: &GpuInfo,
    definition: OperationDef,
    attr: &DepthwiseConvolution2DAttributes,
    storage: WeightsStorage,
) -> Result<GpuOperation> {
    attr.validate(false)?;
    definition.validate(gpu_info, 1, 1)?;
    ensure_src_channels(&definition, attr.weights.shape.i)?;

    let params = attr.params(WeightsSource::Constant(storage));
    let mut operation = GpuOperation::new(definition, OperationKind::DepthwiseConv(params));
    let (data, _) = pack_dw_conv2d_weights(&attr.weights, operation.definition.precision);
    let width = params.kernel[0] * params.kernel[1];
    add_constant_weights(&mut operation, gpu_info, storage, data, width, attr.dst_channels())?;
    finish(operation, params, gpu_info, &attr.bias, attr.dst_channels())
}

/// Build a 2D depthwise convolution reading its weights from a second source tensor.
///
/// The weights tensor has shape (1, kernel_y, kernel_x, channels) and the channel multiplier must be 1.
pub fn create_depthwise_convolution2d_dynamic_weights(
    gpu_info: &GpuInfo,
    definition: OperationDef,
    attr: &DepthwiseConvolution2DAttributes,
) -> Result<GpuOperation> {
    attr.validate(true)?;
    ensure!(
        attr.weights.shape.o == 1,
        UnsupportedConfigurationSnafu {
            reason: format!("dynamic depthwise weights need channel multiplier 1, got {}", attr.weights.shape.o)
        }
    );
    definition.validate(gpu_info, 2, 1)?;
    ensure_src_channels(&definition, attr.weights.shape.i)?;

    let params = attr.params(WeightsSource::Dynamic);
    let operation = GpuOperation::new(definition, OperationKind::DepthwiseConv(params));
    finish(operation, params, gpu_info, &attr.bias, attr.dst_channels())
}

/// Build a 3D depthwise convolution, picking the weights storage for the device.
pub fn create_depthwise_convolution3d(
    gpu_info: &GpuInfo,
    definition: OperationDef,
    attr: &DepthwiseConvolution3DAttributes,
) -> Result<GpuOperation> {
    attr.validate()?;
    definition.validate(gpu_info, 1, 1)?;
    ensure_src_channels(&definition, attr.weights.shape.i)?;

    let storage = if use_buffers_for_weights(gpu_info, &definition) { WeightsStorage::Buffer } else { WeightsStorage::Texture2D };
    let shape = attr.weights.shape;
    let (s, dl, pre) = (attr.strides, attr.dilations, attr.padding_prepended);
    let params = DepthwiseConvParams {
        kernel: [shape.w, shape.h, shape.d],
        strides: [s.w as usize, s.h as usize, s.d as usize],
        dilations: [dl.w as usize, dl.h as usize, dl.d as usize],
        padding: [pre.w as usize, pre.h as usize, pre.d as usize],
        channel_multiplier: shape.o,
        weights: WeightsSource::Constant(storage),
        is_3d: true,
    };
    let mut operation = GpuOperation::new(definition, OperationKind::DepthwiseConv(params));
    let (data, _) = pack_dw_conv3d_weights(&attr.weights, operation.definition.precision);
    add_constant_weights(&mut operation, gpu_info, storage, data, shape.w * shape.h * shape.d, attr.dst_channels())?;
    finish(operation, params, gpu_info, &attr.bias, attr.dst_channels())
}

fn add_constant_weights(
    operation: &mut GpuOperation,
    gpu_info: &GpuInfo,
    storage: WeightsStorage,
    data: Vec<u8>,
    kernel_positions: usize,
    dst_channels: usize,
) -> Result<()> {
    let data_type = operation.definition.precision.storage_data_type();
    let object = match storage {
        WeightsStorage::Buffer => GpuObject::Buffer { data_type, data },
        WeightsStorage::Texture2D => {
            ensure!(
                gpu_info.is_storage_supported(StorageType::Texture2D, data_type),
                UnsupportedConfigurationSnafu { reason: format!("{data_type} texture weights are not supported on {gpu_info}") }
            );
            let slices = dst_channels.div_ceil(4);
            let shape = Bhwdc::new(1, slices, kernel_positions, 1, 4);
            let mut descriptor = TensorDescriptor::new(data_type, StorageType::Texture2D, shape);
            descriptor.data = data;
            GpuObject::Tensor(descriptor)
        }
    };
    operation.args.add_object("weights", object);
    Ok(())
}

fn finish(
    mut operation: GpuOperation,
    params: DepthwiseConvParams,
    gpu_info: &GpuInfo,
    bias: &[f32],
    dst_channels: usize,
) -> Result<GpuOperation> {
    let data_type = operation.definition.precision.storage_data_type();
    let mut padded = bias.to_vec();
    padded.resize(dst_channels, 0.0);
    operation.args.add_object("biases", GpuObject::Buffer { data_type, data: pack_linear(&padded, data_type) });
    declare_params(&mut operation.args, &params);

    operation.add_src_tensor("src_tensor");
    if params.weights == WeightsSource::Dynamic {
        operation.add_src_tensor("weights_tensor");
    }
    operation.add_dst_tensor("dst_tensor");
    let batched = operation.definition.dst_tensors.first().is_some_and(|dst| dst.shape.b > 1);
    operation.code = depthwise_code(&params, batched);
    operation.work_group_size = spatial_work_group(&operation.definition, gpu_info);

    debug!(
        kernel = ?params.kernel,
        multiplier = params.channel_multiplier,
        weights = ?params.weights,
        is_3d = params.is_3d,
        "generated depthwise convolution"
    );
    Ok(operation)
}

fn declare_params(args: &mut Arguments, params: &DepthwiseConvParams) {
    let axes = if params.is_3d { &["x", "y", "z"][..] } else { &["x", "y"][..] };
    for (i, axis) in axes.iter().enumerate() {
        args.add_int(format!("kernel_size_{axis}"), Some(params.kernel[i] as i32));
        args.add_int(format!("stride_{axis}"), Some(params.strides[i] as i32));
        args.add_int(format!("padding_{axis}"), Some(params.padding[i] as i32));
        args.add_int(format!("dilation_{axis}"), Some(params.dilations[i] as i32));
    }
    args.add_int("ch_multiplier", Some(params.channel_multiplier as i32));
}

fn read_src(params: &DepthwiseConvParams) -> String {
    let coords = if params.is_3d { "x_c, y_c, z_c" } else { "x_c, y_c" };
    if params.channel_multiplier == 1 {
        return format!("        FLT4 src_final = args.src_tensor.Read({coords}, S);\n");
    }
    let mut c = String::from("        FLT4 src_final;\n");
    for (i, lane) in ["x", "y", "z", "w"].iter().enumerate() {
        c += &format!("        src_final.{lane} = args.src_tensor.ReadChannel({coords}, (S * 4 + {i}) / args.ch_multiplier);\n");
    }
    c
}

fn read_weights(params: &DepthwiseConvParams) -> &'static str {
    match (params.weights, params.is_3d) {
        (WeightsSource::Dynamic, _) => "        FLT4 f = args.weights_tensor.Read(kx, ky, S);\n",
        (WeightsSource::Constant(WeightsStorage::Buffer), _) => "        FLT4 f = args.weights.Read(fx_c);\n",
        (WeightsSource::Constant(WeightsStorage::Texture2D), false) => {
            "        FLT4 f = args.weights.Read(ky * args.kernel_size_x + kx, S);\n"
        }
        (WeightsSource::Constant(WeightsStorage::Texture2D), true) => {
            "        FLT4 f = args.weights.Read((kz * args.kernel_size_y + ky) * args.kernel_size_x + kx, S);\n"
        }
    }
}

fn depthwise_code(params: &DepthwiseConvParams, batched: bool) -> String {
    let mut c = String::new();
    c += "MAIN_FUNCTION($0) {\n";
    if batched {
        c += "  int linear_id_0 = GLOBAL_ID_0;\n";
        c += "  int X = linear_id_0 / args.dst_tensor.Batch();\n";
        c += "  int B = linear_id_0 % args.dst_tensor.Batch();\n";
        c += "  args.src_tensor.SetBatchRef(B);\n";
        c += "  args.dst_tensor.SetBatchRef(B);\n";
    } else {
        c += "  int X = GLOBAL_ID_0;\n";
    }
    if params.is_3d {
        c += "  int linear_id_1 = GLOBAL_ID_1;\n";
        c += "  int Y = linear_id_1 / args.dst_tensor.Depth();\n";
        c += "  int Z = linear_id_1 % args.dst_tensor.Depth();\n";
    } else {
        c += "  int Y = GLOBAL_ID_1;\n";
    }
    c += "  int S = GLOBAL_ID_2;\n";
    c += "  if (X >= args.dst_tensor.Width() || Y >= args.dst_tensor.Height() || S >= args.dst_tensor.Slices()) {\n";
    c += "    return;\n";
    c += "  }\n";
    c += "  ACCUM_FLT4 r = INIT_ACCUM_FLT4(0.0f);\n";
    c += "  int x_offseted = X * args.stride_x - args.padding_x;\n";
    c += "  int y_offseted = Y * args.stride_y - args.padding_y;\n";
    if params.is_3d {
        c += "  int z_offseted = Z * args.stride_z - args.padding_z;\n";
    }
    let kernel_area = if params.is_3d {
        "args.kernel_size_x * args.kernel_size_y * args.kernel_size_z"
    } else {
        "args.kernel_size_x * args.kernel_size_y"
    };
    if params.weights == WeightsSource::Constant(WeightsStorage::Buffer) {
        c += &format!("  int fx_c = S * {kernel_area};\n");
    }
    if params.is_3d {
        c += "  for (int kz = 0; kz < args.kernel_size_z; ++kz) {\n";
        c += "  int z_c = z_offseted + kz * args.dilation_z;\n";
        c += "  bool inside_z = z_c >= 0 && z_c < args.src_tensor.Depth();\n";
    }
    c += "  for (int ky = 0; ky < args.kernel_size_y; ++ky) {\n";
    c += "    int y_c = y_offseted + ky * args.dilation_y;\n";
    c += "    bool inside_y = y_c >= 0 && y_c < args.src_tensor.Height();\n";
    c += "    for (int kx = 0; kx < args.kernel_size_x; ++kx) {\n";
    c += "      int x_c = x_offseted + kx * args.dilation_x;\n";
    if params.is_3d {
        c += "      bool inside = inside_z && inside_y && x_c >= 0 && x_c < args.src_tensor.Width();\n";
    } else {
        c += "      bool inside = inside_y && x_c >= 0 && x_c < args.src_tensor.Width();\n";
    }
    c += "      if (inside) {\n";
    c += &read_src(params);
    c += read_weights(params);
    c += "        r += TO_ACCUM_TYPE(src_final * f);\n";
    c += "      }\n";
    if params.weights == WeightsSource::Constant(WeightsStorage::Buffer) {
        c += "      fx_c++;\n";
    }
    c += "    }\n";
    c += "  }\n";
    if params.is_3d {
        c += "  }\n";
    }
    c += "  FLT4 res0 = TO_FLT4(r) + args.biases.Read(S);\n";
    if params.is_3d {
        c += "  args.dst_tensor.Write(res0, X, Y, Z, S);\n";
    } else {
        c += "  args.dst_tensor.Write(res0, X, Y, S);\n";
    }
    c += "}\n";
    c
}
