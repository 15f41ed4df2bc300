use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use log::{debug, trace};
use mdarray_rs::cache::{
    BatchNormSignature, CacheContext, ConvSignature, LinearSignature, LrnSignature,
    PoolingSignature, PrimitiveSignature,
};
use mdarray_rs::engine::{
    ComputeEngine, EngineError, EngineFormat, EngineMemory, EngineResult, MemoryDesc,
};
use mdarray_rs::{DType, TensorBuffer};

static PRIMITIVE_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Memory object binding a descriptor to host memory.
#[derive(Debug)]
pub struct CpuMemory {
    desc: MemoryDesc,
    ptr: NonNull<u8>,
}

// The pointer is only dereferenced by kernels that receive the owning buffers explicitly.
unsafe impl Send for CpuMemory {}
unsafe impl Sync for CpuMemory {}

impl EngineMemory for CpuMemory {
    fn desc(&self) -> &MemoryDesc {
        &self.desc
    }

    fn data_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

/// A validated primitive: the signature it was built for plus its source and output descriptors.
#[derive(Debug)]
pub struct CpuPrimitive {
    id: u64,
    dtype: DType,
    signature: PrimitiveSignature,
    src_desc: MemoryDesc,
    dst_desc: MemoryDesc,
}

impl CpuPrimitive {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn signature(&self) -> &PrimitiveSignature {
        &self.signature
    }

    pub fn src_desc(&self) -> &MemoryDesc {
        &self.src_desc
    }

    /// Output descriptor, suitable for [`TensorBuffer::from_descriptor`].
    pub fn dst_desc(&self) -> &MemoryDesc {
        &self.dst_desc
    }
}

/// Reference engine: validates descriptors, builds primitives, and runs naive forward kernels.
#[derive(Debug, Default)]
pub struct CpuEngine {
    constructed: AtomicUsize,
}

impl CpuEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of primitives built so far.
    pub fn constructed(&self) -> usize {
        self.constructed.load(Ordering::Relaxed)
    }

    /// Builds a primitive for `signature` operating on `dtype` elements.
    pub fn build(
        &self,
        dtype: DType,
        signature: &PrimitiveSignature,
    ) -> EngineResult<CpuPrimitive> {
        let (src_desc, dst_desc) = match signature {
            PrimitiveSignature::Relu { size } => {
                ensure_positive("relu", &[*size])?;
                let desc = MemoryDesc::new(&[*size], dtype, EngineFormat::X);
                (desc.clone(), desc)
            }
            PrimitiveSignature::Relu4d { dims } => {
                ensure_positive("relu4d", dims)?;
                let desc = MemoryDesc::new(dims, dtype, EngineFormat::NCHW);
                (desc.clone(), desc)
            }
            PrimitiveSignature::MaxPool2d(sig) | PrimitiveSignature::AvgPool2d(sig) => {
                ensure_float(signature.family(), dtype)?;
                pooling_descs(sig, dtype)?
            }
            PrimitiveSignature::Lrn(sig) => {
                ensure_float("lrn", dtype)?;
                lrn_descs(sig, dtype)?
            }
            PrimitiveSignature::Softmax2d { dims, axis } => {
                ensure_float("softmax2d", dtype)?;
                softmax_descs(dims, *axis, dtype, EngineFormat::NC)?
            }
            PrimitiveSignature::Softmax4d { dims, axis } => {
                ensure_float("softmax4d", dtype)?;
                softmax_descs(dims, *axis, dtype, EngineFormat::NCHW)?
            }
            PrimitiveSignature::Conv2d(sig) => {
                ensure_float("conv2d", dtype)?;
                conv_descs(sig, dtype)?
            }
            PrimitiveSignature::Deconv2d(sig) => {
                ensure_float("deconv2d", dtype)?;
                deconv_descs(sig, dtype)?
            }
            PrimitiveSignature::Linear(sig) => {
                ensure_float("linear", dtype)?;
                linear_descs(sig, dtype)?
            }
            PrimitiveSignature::BatchNorm(sig) => {
                ensure_float("batchnorm", dtype)?;
                batch_norm_descs(sig, dtype)?
            }
        };
        if src_desc.byte_len().is_none() || dst_desc.byte_len().is_none() {
            return Err(EngineError::invalid(format!(
                "{}: tensor extents overflow ({src_desc} -> {dst_desc})",
                signature.family()
            )));
        }
        self.constructed.fetch_add(1, Ordering::Relaxed);
        let primitive = CpuPrimitive {
            id: PRIMITIVE_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            dtype,
            signature: *signature,
            src_desc,
            dst_desc,
        };
        debug!(
            "built {} primitive #{} -> {}",
            signature,
            primitive.id,
            primitive.dst_desc
        );
        Ok(primitive)
    }

    /// Looks `signature` up in `context`, building and caching it on a miss.
    pub fn primitive(
        &self,
        context: &CacheContext<CpuPrimitive>,
        dtype: DType,
        signature: PrimitiveSignature,
    ) -> EngineResult<Arc<CpuPrimitive>> {
        context
            .cache(dtype)
            .get_or_try_insert_with(signature, || self.build(dtype, &signature))
    }

    /// Runs a forward pass of `primitive` from `src` into `dst`.
    ///
    /// Elementwise activation and max/avg pooling are implemented; the remaining families are
    /// construction-only in this engine.
    pub fn execute(
        &self,
        primitive: &CpuPrimitive,
        src: &TensorBuffer<CpuEngine>,
        dst: &mut TensorBuffer<CpuEngine>,
    ) -> mdarray_rs::Result<()> {
        ensure_dims("source", primitive.src_desc(), src.desc())?;
        ensure_dims("destination", primitive.dst_desc(), dst.desc())?;
        trace!("executing {} primitive #{}", primitive.signature, primitive.id);
        match &primitive.signature {
            PrimitiveSignature::Relu { .. } | PrimitiveSignature::Relu4d { .. } => {
                match primitive.dtype {
                    DType::F32 => relu(src.as_slice::<f32>()?, dst.as_mut_slice::<f32>()?),
                    DType::I32 => relu(src.as_slice::<i32>()?, dst.as_mut_slice::<i32>()?),
                }
                Ok(())
            }
            PrimitiveSignature::MaxPool2d(sig) => {
                pool_forward(sig, PoolKind::Max, src.as_slice()?, dst.as_mut_slice()?);
                Ok(())
            }
            PrimitiveSignature::AvgPool2d(sig) => {
                pool_forward(sig, PoolKind::Avg, src.as_slice()?, dst.as_mut_slice()?);
                Ok(())
            }
            other => Err(EngineError::unimplemented(
                other.family(),
                "reference engine only executes activation and pooling",
            )
            .into()),
        }
    }
}

impl ComputeEngine for CpuEngine {
    type Memory = CpuMemory;
    type Primitive = CpuPrimitive;

    fn engine_name(&self) -> &str {
        "ref-cpu"
    }

    unsafe fn create_memory(
        &self,
        desc: &MemoryDesc,
        data: NonNull<u8>,
    ) -> EngineResult<Self::Memory> {
        if let Some(rank) = desc.format().rank() {
            if rank != desc.ndim() {
                return Err(EngineError::invalid(format!(
                    "format {:?} expects rank {rank}, descriptor {desc} has rank {}",
                    desc.format(),
                    desc.ndim()
                )));
            }
        }
        Ok(CpuMemory {
            desc: desc.clone(),
            ptr: data,
        })
    }
}

fn ensure_positive(op: &str, dims: &[usize]) -> EngineResult<()> {
    if dims.iter().any(|dim| *dim == 0) {
        return Err(EngineError::invalid(format!(
            "{op}: dims must be positive, got {dims:?}"
        )));
    }
    Ok(())
}

fn ensure_float(op: &'static str, dtype: DType) -> EngineResult<()> {
    if dtype != DType::F32 {
        return Err(EngineError::unimplemented(op, format!("{dtype:?} is not supported")));
    }
    Ok(())
}

fn ensure_dims(role: &str, expected: &MemoryDesc, actual: &MemoryDesc) -> EngineResult<()> {
    if expected.dims() != actual.dims() || expected.dtype() != actual.dtype() {
        return Err(EngineError::invalid(format!(
            "{role} buffer {actual} does not match primitive descriptor {expected}"
        )));
    }
    Ok(())
}

/// Output extent of a strided window; `None` when the window does not fit or the padded
/// extent overflows.
fn window_out(
    extent: usize,
    pad_lo: usize,
    pad_hi: usize,
    kernel: usize,
    stride: usize,
) -> Option<usize> {
    let padded = extent.checked_add(pad_lo)?.checked_add(pad_hi)?;
    if kernel == 0 || stride == 0 || padded < kernel {
        return None;
    }
    Some((padded - kernel) / stride + 1)
}

/// Output extent of a transposed window, `stride * (extent - 1) + kernel - pads`; `None` on
/// overflow or when padding consumes everything.
fn transposed_out(
    extent: usize,
    pad_lo: usize,
    pad_hi: usize,
    kernel: usize,
    stride: usize,
) -> Option<usize> {
    let full = stride.checked_mul(extent.checked_sub(1)?)?.checked_add(kernel)?;
    let pads = pad_lo.checked_add(pad_hi)?;
    full.checked_sub(pads).filter(|out| *out > 0)
}

fn pooling_descs(sig: &PoolingSignature, dtype: DType) -> EngineResult<(MemoryDesc, MemoryDesc)> {
    ensure_positive("pooling", &sig.input)?;
    let pad = sig.padding;
    if pad.top.max(pad.bottom) >= sig.kernel_h || pad.left.max(pad.right) >= sig.kernel_w {
        return Err(EngineError::invalid("pooling: padding must be smaller than the kernel"));
    }
    let [n, c, h, w] = sig.input;
    let oh = window_out(h, pad.top, pad.bottom, sig.kernel_h, sig.stride_y);
    let ow = window_out(w, pad.left, pad.right, sig.kernel_w, sig.stride_x);
    let (Some(oh), Some(ow)) = (oh, ow) else {
        return Err(EngineError::invalid(format!(
            "pooling: kernel {}x{} stride {}x{} does not fit input {h}x{w}",
            sig.kernel_h, sig.kernel_w, sig.stride_y, sig.stride_x
        )));
    };
    Ok((
        MemoryDesc::new(&sig.input, dtype, EngineFormat::NCHW),
        MemoryDesc::new(&[n, c, oh, ow], dtype, EngineFormat::NCHW),
    ))
}

fn lrn_descs(sig: &LrnSignature, dtype: DType) -> EngineResult<(MemoryDesc, MemoryDesc)> {
    ensure_positive("lrn", &sig.input)?;
    if sig.local_size == 0 || sig.local_size % 2 == 0 {
        return Err(EngineError::invalid(format!(
            "lrn: local size must be odd, got {}",
            sig.local_size
        )));
    }
    if ![sig.k.get(), sig.alpha.get(), sig.beta.get()]
        .iter()
        .all(|value| value.is_finite())
    {
        return Err(EngineError::invalid("lrn: k, alpha and beta must be finite"));
    }
    let desc = MemoryDesc::new(&sig.input, dtype, EngineFormat::NCHW);
    Ok((desc.clone(), desc))
}

fn softmax_descs(
    dims: &[usize],
    axis: usize,
    dtype: DType,
    format: EngineFormat,
) -> EngineResult<(MemoryDesc, MemoryDesc)> {
    ensure_positive("softmax", dims)?;
    if axis >= dims.len() {
        return Err(EngineError::invalid(format!(
            "softmax: axis {axis} out of range for rank {}",
            dims.len()
        )));
    }
    let desc = MemoryDesc::new(dims, dtype, format);
    Ok((desc.clone(), desc))
}

fn check_conv_common(op: &str, sig: &ConvSignature, in_channels: usize) -> EngineResult<()> {
    ensure_positive(op, &sig.input)?;
    ensure_positive(op, &sig.weights)?;
    if sig.input[1] != in_channels {
        return Err(EngineError::invalid(format!(
            "{op}: input channels {} do not match weights {:?}",
            sig.input[1], sig.weights
        )));
    }
    if sig.weights[2] != sig.kernel_h || sig.weights[3] != sig.kernel_w {
        return Err(EngineError::invalid(format!(
            "{op}: kernel {}x{} does not match weights {:?}",
            sig.kernel_h, sig.kernel_w, sig.weights
        )));
    }
    if sig.stride_y == 0 || sig.stride_x == 0 {
        return Err(EngineError::invalid(format!("{op}: strides must be positive")));
    }
    Ok(())
}

fn check_bias(op: &str, bias: Option<usize>, out_channels: usize) -> EngineResult<()> {
    match bias {
        Some(dim) if dim != out_channels => Err(EngineError::invalid(format!(
            "{op}: bias dim {dim} does not match {out_channels} output channels"
        ))),
        _ => Ok(()),
    }
}

fn conv_descs(sig: &ConvSignature, dtype: DType) -> EngineResult<(MemoryDesc, MemoryDesc)> {
    // Weights are (out_channels, in_channels, kh, kw).
    check_conv_common("conv2d", sig, sig.weights[1])?;
    check_bias("conv2d", sig.bias, sig.weights[0])?;
    let [n, _, h, w] = sig.input;
    let pad = sig.padding;
    let oh = window_out(h, pad.top, pad.bottom, sig.kernel_h, sig.stride_y);
    let ow = window_out(w, pad.left, pad.right, sig.kernel_w, sig.stride_x);
    let (Some(oh), Some(ow)) = (oh, ow) else {
        return Err(EngineError::invalid("conv2d: kernel does not fit padded input"));
    };
    Ok((
        MemoryDesc::new(&sig.input, dtype, EngineFormat::NCHW),
        MemoryDesc::new(&[n, sig.weights[0], oh, ow], dtype, EngineFormat::NCHW),
    ))
}

fn deconv_descs(sig: &ConvSignature, dtype: DType) -> EngineResult<(MemoryDesc, MemoryDesc)> {
    // Weights are (in_channels, out_channels, kh, kw).
    check_conv_common("deconv2d", sig, sig.weights[0])?;
    check_bias("deconv2d", sig.bias, sig.weights[1])?;
    let [n, _, h, w] = sig.input;
    let pad = sig.padding;
    let (Some(oh), Some(ow)) = (
        transposed_out(h, pad.top, pad.bottom, sig.kernel_h, sig.stride_y),
        transposed_out(w, pad.left, pad.right, sig.kernel_w, sig.stride_x),
    ) else {
        return Err(EngineError::invalid(
            "deconv2d: output extent overflows or padding removes the whole output",
        ));
    };
    Ok((
        MemoryDesc::new(&sig.input, dtype, EngineFormat::NCHW),
        MemoryDesc::new(&[n, sig.weights[1], oh, ow], dtype, EngineFormat::NCHW),
    ))
}

fn linear_descs(sig: &LinearSignature, dtype: DType) -> EngineResult<(MemoryDesc, MemoryDesc)> {
    ensure_positive("linear", &sig.input)?;
    ensure_positive("linear", &sig.weights)?;
    if sig.input[1] != sig.weights[1] {
        return Err(EngineError::invalid(format!(
            "linear: input features {} do not match weights {:?}",
            sig.input[1], sig.weights
        )));
    }
    check_bias("linear", sig.bias, sig.weights[0])?;
    Ok((
        MemoryDesc::new(&sig.input, dtype, EngineFormat::NC),
        MemoryDesc::new(&[sig.input[0], sig.weights[0]], dtype, EngineFormat::NC),
    ))
}

fn batch_norm_descs(
    sig: &BatchNormSignature,
    dtype: DType,
) -> EngineResult<(MemoryDesc, MemoryDesc)> {
    ensure_positive("batchnorm", &sig.input)?;
    let channels = sig.input[1];
    if sig.has_weights && sig.scale_shift != [2, channels] {
        return Err(EngineError::invalid(format!(
            "batchnorm: scale/shift {:?} must be [2, {channels}]",
            sig.scale_shift
        )));
    }
    if sig.mean != channels {
        return Err(EngineError::invalid(format!(
            "batchnorm: running mean dim {} does not match {channels} channels",
            sig.mean
        )));
    }
    let eps = sig.eps.get();
    if !(eps.is_finite() && eps > 0.0) {
        return Err(EngineError::invalid("batchnorm: epsilon must be positive"));
    }
    let desc = MemoryDesc::new(&sig.input, dtype, EngineFormat::NCHW);
    Ok((desc.clone(), desc))
}

fn relu<T: Copy + PartialOrd + Default>(src: &[T], dst: &mut [T]) {
    let zero = T::default();
    for (out, value) in dst.iter_mut().zip(src) {
        *out = if *value > zero { *value } else { zero };
    }
}

#[derive(Clone, Copy)]
enum PoolKind {
    Max,
    Avg,
}

fn pool_forward(sig: &PoolingSignature, kind: PoolKind, src: &[f32], dst: &mut [f32]) {
    let [n, c, h, w] = sig.input;
    let pad = sig.padding;
    let oh = (h + pad.top + pad.bottom - sig.kernel_h) / sig.stride_y + 1;
    let ow = (w + pad.left + pad.right - sig.kernel_w) / sig.stride_x + 1;
    let window = (sig.kernel_h * sig.kernel_w) as f32;
    for plane in 0..n * c {
        let src_plane = &src[plane * h * w..(plane + 1) * h * w];
        let dst_plane = &mut dst[plane * oh * ow..(plane + 1) * oh * ow];
        for oy in 0..oh {
            for ox in 0..ow {
                let mut max = f32::NEG_INFINITY;
                let mut sum = 0.0f32;
                for ky in 0..sig.kernel_h {
                    let Some(y) = (oy * sig.stride_y + ky).checked_sub(pad.top) else {
                        continue;
                    };
                    if y >= h {
                        continue;
                    }
                    for kx in 0..sig.kernel_w {
                        let Some(x) = (ox * sig.stride_x + kx).checked_sub(pad.left) else {
                            continue;
                        };
                        if x >= w {
                            continue;
                        }
                        let value = src_plane[y * w + x];
                        max = max.max(value);
                        sum += value;
                    }
                }
                dst_plane[oy * ow + ox] = match kind {
                    PoolKind::Max => max,
                    PoolKind::Avg => sum / window,
                };
            }
        }
    }
}
