//! Structural signatures identifying a compute primitive.
//!
//! Each operation family gets its own variant and lists exactly the parameters that change the
//! primitive's internal structure. Keys compare field by field, so two signatures are equal only
//! when every parameter matches; floating-point parameters compare by bit pattern.

use std::fmt;

use serde::Serialize;

use super::hashing::hash_serialized;

/// `f64` parameter compared and hashed by its exact bit pattern.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ExactF64(u64);

impl ExactF64 {
    pub fn new(value: f64) -> Self {
        ExactF64(value.to_bits())
    }

    pub fn get(self) -> f64 {
        f64::from_bits(self.0)
    }
}

impl From<f64> for ExactF64 {
    fn from(value: f64) -> Self {
        ExactF64::new(value)
    }
}

impl fmt::Debug for ExactF64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.get())
    }
}

impl fmt::Display for ExactF64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.get())
    }
}

/// Spatial padding: leading (top/left) and trailing (bottom/right) edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub struct Padding2d {
    pub top: usize,
    pub left: usize,
    pub bottom: usize,
    pub right: usize,
}

impl Padding2d {
    pub const ZERO: Padding2d = Padding2d::uniform(0);

    pub const fn uniform(pad: usize) -> Self {
        Padding2d {
            top: pad,
            left: pad,
            bottom: pad,
            right: pad,
        }
    }

    pub const fn symmetric(pad_h: usize, pad_w: usize) -> Self {
        Padding2d {
            top: pad_h,
            left: pad_w,
            bottom: pad_h,
            right: pad_w,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct PoolingSignature {
    pub input: [usize; 4],
    pub stride_y: usize,
    pub stride_x: usize,
    pub kernel_h: usize,
    pub kernel_w: usize,
    pub padding: Padding2d,
}

impl PoolingSignature {
    pub fn new(
        input: [usize; 4],
        (stride_y, stride_x): (usize, usize),
        (kernel_h, kernel_w): (usize, usize),
        padding: Padding2d,
    ) -> Self {
        PoolingSignature {
            input,
            stride_y,
            stride_x,
            kernel_h,
            kernel_w,
            padding,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct LrnSignature {
    pub input: [usize; 4],
    pub local_size: usize,
    pub k: ExactF64,
    pub alpha: ExactF64,
    pub beta: ExactF64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ConvSignature {
    pub input: [usize; 4],
    pub weights: [usize; 4],
    pub bias: Option<usize>,
    pub kernel_h: usize,
    pub kernel_w: usize,
    pub stride_y: usize,
    pub stride_x: usize,
    pub padding: Padding2d,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct LinearSignature {
    pub input: [usize; 2],
    pub weights: [usize; 2],
    pub bias: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct BatchNormSignature {
    pub input: [usize; 4],
    pub scale_shift: [usize; 2],
    pub mean: usize,
    pub eps: ExactF64,
    pub training: bool,
    pub has_weights: bool,
    pub fixed_mean_var: bool,
}

/// Composite cache key: operation family plus every structural parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PrimitiveSignature {
    /// Elementwise activation over a flat vector.
    Relu { size: usize },
    /// Elementwise activation over a 4D tensor.
    Relu4d { dims: [usize; 4] },
    MaxPool2d(PoolingSignature),
    AvgPool2d(PoolingSignature),
    Lrn(LrnSignature),
    Softmax2d { dims: [usize; 2], axis: usize },
    Softmax4d { dims: [usize; 4], axis: usize },
    Conv2d(ConvSignature),
    Deconv2d(ConvSignature),
    Linear(LinearSignature),
    BatchNorm(BatchNormSignature),
}

impl PrimitiveSignature {
    /// Short family name used in logs and instrumentation.
    pub fn family(&self) -> &'static str {
        match self {
            PrimitiveSignature::Relu { .. } => "relu",
            PrimitiveSignature::Relu4d { .. } => "relu4d",
            PrimitiveSignature::MaxPool2d(_) => "maxpool2d",
            PrimitiveSignature::AvgPool2d(_) => "avgpool2d",
            PrimitiveSignature::Lrn(_) => "lrn",
            PrimitiveSignature::Softmax2d { .. } => "softmax2d",
            PrimitiveSignature::Softmax4d { .. } => "softmax4d",
            PrimitiveSignature::Conv2d(_) => "conv2d",
            PrimitiveSignature::Deconv2d(_) => "deconv2d",
            PrimitiveSignature::Linear(_) => "linear",
            PrimitiveSignature::BatchNorm(_) => "batchnorm",
        }
    }

    /// Stable 64-bit hash of the serialized signature.
    pub fn fingerprint(&self) -> u64 {
        hash_serialized(self)
    }
}

struct DimsDisplay<'a>(&'a [usize]);

impl fmt::Display for DimsDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, dim) in self.0.iter().enumerate() {
            if idx > 0 {
                f.write_str("x")?;
            }
            write!(f, "{dim}")?;
        }
        Ok(())
    }
}

struct PadDisplay(Padding2d);

impl fmt::Display for PadDisplay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let p = self.0;
        write!(f, "p{},{},{},{}", p.top, p.left, p.bottom, p.right)
    }
}

struct BiasDisplay(Option<usize>);

impl fmt::Display for BiasDisplay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(dim) => write!(f, "b{dim}"),
            None => f.write_str("nobias"),
        }
    }
}

impl fmt::Display for PrimitiveSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let family = self.family();
        match self {
            PrimitiveSignature::Relu { size } => write!(f, "{family}:{size}"),
            PrimitiveSignature::Relu4d { dims } => write!(f, "{family}:{}", DimsDisplay(dims)),
            PrimitiveSignature::MaxPool2d(sig) | PrimitiveSignature::AvgPool2d(sig) => write!(
                f,
                "{family}:{}:s{}x{}:k{}x{}:{}",
                DimsDisplay(&sig.input),
                sig.stride_y,
                sig.stride_x,
                sig.kernel_h,
                sig.kernel_w,
                PadDisplay(sig.padding)
            ),
            PrimitiveSignature::Lrn(sig) => write!(
                f,
                "{family}:{}:n{}:k{}:a{}:b{}",
                DimsDisplay(&sig.input),
                sig.local_size,
                sig.k,
                sig.alpha,
                sig.beta
            ),
            PrimitiveSignature::Softmax2d { dims, axis } => {
                write!(f, "{family}:{}:axis{axis}", DimsDisplay(dims))
            }
            PrimitiveSignature::Softmax4d { dims, axis } => {
                write!(f, "{family}:{}:axis{axis}", DimsDisplay(dims))
            }
            PrimitiveSignature::Conv2d(sig) | PrimitiveSignature::Deconv2d(sig) => write!(
                f,
                "{family}:{}:w{}:{}:k{}x{}:s{}x{}:{}",
                DimsDisplay(&sig.input),
                DimsDisplay(&sig.weights),
                BiasDisplay(sig.bias),
                sig.kernel_h,
                sig.kernel_w,
                sig.stride_y,
                sig.stride_x,
                PadDisplay(sig.padding)
            ),
            PrimitiveSignature::Linear(sig) => write!(
                f,
                "{family}:{}:w{}:{}",
                DimsDisplay(&sig.input),
                DimsDisplay(&sig.weights),
                BiasDisplay(sig.bias)
            ),
            PrimitiveSignature::BatchNorm(sig) => write!(
                f,
                "{family}:{}:w{}:m{}:eps{}:train{}:weights{}:fixed{}",
                DimsDisplay(&sig.input),
                DimsDisplay(&sig.scale_shift),
                sig.mean,
                sig.eps,
                u8::from(sig.training),
                u8::from(sig.has_weights),
                u8::from(sig.fixed_mean_var)
            ),
        }
    }
}
