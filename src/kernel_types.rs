//! Problem description consumed by the validator and planner: shape, data
//! types, layout tags and the attribute object carrying post-ops and
//! output scales.

use crate::types::{DataType, MemoryFormat, RoundMode};

/// Number of 32-bit lanes per vector; also the channel block size.
pub const SIMD_W: usize = 16;

/// Mask selecting per-output-channel scales (dimension 1 of `NCHW`).
pub const OC_SCALE_MASK: u32 = 1 << 1;

/// Convolution geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConvShape {
    pub mb: usize,
    pub ngroups: usize,
    pub ic: usize,
    pub oc: usize,
    pub ih: usize,
    pub iw: usize,
    pub oh: usize,
    pub ow: usize,
    pub kh: usize,
    pub kw: usize,
    pub stride_h: usize,
    pub stride_w: usize,
    pub t_pad: usize,
    pub l_pad: usize,
}

impl ConvShape {
    /// A 1×1, stride-1, unpadded, single-group convolution over an `h × w`
    /// image.
    pub fn conv_1x1(mb: usize, ic: usize, oc: usize, h: usize, w: usize) -> Self {
        ConvShape {
            mb,
            ngroups: 1,
            ic,
            oc,
            ih: h,
            iw: w,
            oh: h,
            ow: w,
            kh: 1,
            kw: 1,
            stride_h: 1,
            stride_w: 1,
            t_pad: 0,
            l_pad: 0,
        }
    }

    /// Output spatial size.
    #[inline]
    pub fn os(&self) -> usize {
        self.oh * self.ow
    }

    /// Input spatial size.
    #[inline]
    pub fn is(&self) -> usize {
        self.ih * self.iw
    }
}

/// Data types of every tensor in the convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DtypeSet {
    pub src: DataType,
    pub wei: DataType,
    pub bias: Option<DataType>,
    pub dst: DataType,
}

impl DtypeSet {
    /// u8 source, s8 weights, the given bias and destination types.
    pub fn u8s8(bias: Option<DataType>, dst: DataType) -> Self {
        DtypeSet { src: DataType::U8, wei: DataType::S8, bias, dst }
    }
}

/// Layout tags of every tensor in the convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Layouts {
    pub src: MemoryFormat,
    pub wei: MemoryFormat,
    pub bias: MemoryFormat,
    pub dst: MemoryFormat,
}

impl Layouts {
    /// Channel-last activations with blocked weights.
    pub fn nhwc(with_bias: bool) -> Self {
        Layouts {
            src: MemoryFormat::Nhwc,
            wei: MemoryFormat::OIhw4i16o4i,
            bias: if with_bias { MemoryFormat::X } else { MemoryFormat::Undef },
            dst: MemoryFormat::Nhwc,
        }
    }
}

/// Complete operation descriptor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConvDesc {
    pub shape: ConvShape,
    pub dtypes: DtypeSet,
    pub layouts: Layouts,
    /// The op carries its own fused activation.
    pub with_relu: bool,
    pub relu_negative_slope: f32,
}

impl ConvDesc {
    pub fn new(shape: ConvShape, dtypes: DtypeSet) -> Self {
        ConvDesc {
            shape,
            dtypes,
            layouts: Layouts::nhwc(dtypes.bias.is_some()),
            with_relu: false,
            relu_negative_slope: 0.0,
        }
    }

    /// Attach a fused relu to the op itself.
    pub fn with_fused_relu(mut self, negative_slope: f32) -> Self {
        self.with_relu = true;
        self.relu_negative_slope = negative_slope;
        self
    }

    #[inline]
    pub fn with_bias(&self) -> bool {
        self.layouts.bias != MemoryFormat::Undef && self.dtypes.bias.is_some()
    }
}

/// Elementwise algorithms an attribute can name. Only `Relu` is fusible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EltwiseAlg {
    Relu,
    Tanh,
    Elu,
    Square,
    Abs,
    Linear,
    BoundedRelu,
}

/// One entry of a post-op chain.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PostOp {
    Eltwise { alg: EltwiseAlg, scale: f32, alpha: f32, beta: f32 },
    Sum { scale: f32 },
}

impl PostOp {
    /// A zero-alpha, unit-scale rectifier.
    #[inline]
    pub fn is_relu(&self) -> bool {
        matches!(
            *self,
            PostOp::Eltwise { alg: EltwiseAlg::Relu, scale, alpha, .. }
                if scale == 1.0 && alpha == 0.0
        )
    }

    #[inline]
    pub fn is_sum(&self) -> bool {
        matches!(self, PostOp::Sum { .. })
    }

    #[inline]
    pub fn is_eltwise(&self) -> bool {
        matches!(self, PostOp::Eltwise { .. })
    }
}

/// Ordered post-op chain.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PostOps {
    entries: Vec<PostOp>,
}

impl PostOps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append_sum(&mut self, scale: f32) -> &mut Self {
        self.entries.push(PostOp::Sum { scale });
        self
    }

    pub fn append_eltwise(&mut self, scale: f32, alg: EltwiseAlg, alpha: f32, beta: f32) -> &mut Self {
        self.entries.push(PostOp::Eltwise { alg, scale, alpha, beta });
        self
    }

    pub fn append_relu(&mut self) -> &mut Self {
        self.append_eltwise(1.0, EltwiseAlg::Relu, 0.0, 0.0)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    pub fn entries(&self) -> &[PostOp] {
        &self.entries
    }

    /// Entry `idx` exists and is a sum.
    #[inline]
    pub fn contain_sum(&self, idx: usize) -> bool {
        self.entries.get(idx).is_some_and(PostOp::is_sum)
    }

    /// Entry `idx` exists and is an elementwise op.
    #[inline]
    pub fn contain_eltwise(&self, idx: usize) -> bool {
        self.entries.get(idx).is_some_and(PostOp::is_eltwise)
    }

    #[inline]
    pub fn is_relu(&self, idx: usize) -> bool {
        self.entries.get(idx).is_some_and(PostOp::is_relu)
    }

    /// Scale of the first sum entry, if any.
    pub fn sum_scale(&self) -> Option<f32> {
        self.entries.iter().find_map(|e| match *e {
            PostOp::Sum { scale } => Some(scale),
            PostOp::Eltwise { .. } => None,
        })
    }
}

impl From<Vec<PostOp>> for PostOps {
    fn from(entries: Vec<PostOp>) -> Self {
        PostOps { entries }
    }
}

impl std::fmt::Display for PostOps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("[")?;
        for (i, e) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            match e {
                PostOp::Sum { scale } => write!(f, "sum({scale})")?,
                PostOp::Eltwise { alg, scale, alpha, .. } => {
                    write!(f, "{alg:?}(scale={scale}, alpha={alpha})")?
                }
            }
        }
        f.write_str("]")
    }
}

/// Output scales: a single global factor or one per output channel.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputScales {
    pub mask: u32,
    pub scales: Vec<f32>,
}

impl OutputScales {
    pub fn per_tensor(scale: f32) -> Self {
        OutputScales { mask: 0, scales: vec![scale] }
    }

    pub fn per_channel(scales: Vec<f32>) -> Self {
        OutputScales { mask: OC_SCALE_MASK, scales }
    }

    #[inline]
    pub fn is_oc_scale(&self) -> bool {
        self.mask == OC_SCALE_MASK
    }
}

impl Default for OutputScales {
    fn default() -> Self {
        Self::per_tensor(1.0)
    }
}

/// Attribute object: post-ops, output scales and the rounding mode.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PrimitiveAttr {
    pub post_ops: PostOps,
    pub output_scales: OutputScales,
    pub round_mode: RoundMode,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relu_requires_unit_scale_and_zero_alpha() {
        let relu = PostOp::Eltwise { alg: EltwiseAlg::Relu, scale: 1.0, alpha: 0.0, beta: 0.0 };
        let leaky = PostOp::Eltwise { alg: EltwiseAlg::Relu, scale: 1.0, alpha: 0.1, beta: 0.0 };
        let scaled = PostOp::Eltwise { alg: EltwiseAlg::Relu, scale: 2.0, alpha: 0.0, beta: 0.0 };
        let tanh = PostOp::Eltwise { alg: EltwiseAlg::Tanh, scale: 1.0, alpha: 0.0, beta: 0.0 };
        assert!(relu.is_relu());
        assert!(!leaky.is_relu());
        assert!(!scaled.is_relu());
        assert!(!tanh.is_relu());
        assert!(!PostOp::Sum { scale: 1.0 }.is_relu());
    }

    #[test]
    fn test_post_ops_queries() {
        let mut p = PostOps::new();
        p.append_relu().append_sum(0.5).append_relu();
        assert_eq!(p.len(), 3);
        assert!(p.contain_eltwise(0));
        assert!(p.contain_sum(1));
        assert!(!p.contain_sum(3));
        assert_eq!(p.sum_scale(), Some(0.5));
        assert_eq!(p.to_string(), "[Relu(scale=1, alpha=0), sum(0.5), Relu(scale=1, alpha=0)]");
    }

    #[test]
    fn test_conv_1x1_shape() {
        let s = ConvShape::conv_1x1(2, 32, 64, 7, 5);
        assert_eq!(s.os(), 35);
        assert_eq!(s.is(), 35);
        assert_eq!((s.kh, s.kw, s.ngroups), (1, 1, 1));
    }
}
