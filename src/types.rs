//! Element types, layout tags and the error vocabulary shared by the
//! validator, planner and driver.

use thiserror::Error;

/// Element data type of a tensor taking part in the convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    F32,
    S32,
    S8,
    U8,
}

impl DataType {
    /// Size of one element in bytes.
    #[inline]
    pub fn size_bytes(self) -> usize {
        match self {
            DataType::F32 | DataType::S32 => 4,
            DataType::S8 | DataType::U8 => 1,
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DataType::F32 => "f32",
            DataType::S32 => "s32",
            DataType::S8 => "s8",
            DataType::U8 => "u8",
        };
        f.write_str(s)
    }
}

/// Memory layout tag of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryFormat {
    /// No tensor (e.g. a convolution without bias).
    Undef,
    /// Let the implementation choose.
    Any,
    /// Plain 1D vector.
    X,
    Nchw,
    Nhwc,
    OIhw,
    /// Weights blocked by 16 output and 16 input channels, input channels
    /// interleaved in quads: `[O/16][I/16][4][16o][4i]`.
    OIhw4i16o4i,
    /// Grouped variant of [`MemoryFormat::OIhw4i16o4i`].
    GOIhw4i16o4i,
}

/// Float → integer rounding applied before the destination store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RoundMode {
    /// Round half to even.
    #[default]
    Nearest,
    /// Round toward negative infinity.
    Down,
}

/// Reason a configuration is rejected by the validator.
///
/// Callers receiving any of these must fall back to a generic
/// implementation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Unsupported {
    #[error("cpu lacks 512-bit integer vector support")]
    Isa,
    #[error("data types src={src} wei={wei} dst={dst} are not u8/s8/{{f32,s32,s8,u8}}")]
    DataTypes { src: DataType, wei: DataType, dst: DataType },
    #[error("weights format {0:?} is not OIhw4i16o4i")]
    WeightsFormat(MemoryFormat),
    #[error("fused relu with negative slope {0} is not supported")]
    EltwiseSlope(f32),
    #[error("post-op sequence {0} is not fusible")]
    PostOps(String),
    #[error("group count {0} (only 1 is supported)")]
    Groups(usize),
    #[error("layout src={src:?} dst={dst:?} bias={bias:?} is not nhwc/nhwc/x")]
    Layout { src: MemoryFormat, dst: MemoryFormat, bias: MemoryFormat },
    #[error("channels ic={ic} oc={oc} must be multiples of {simd_w}")]
    ChannelAlignment { ic: usize, oc: usize, simd_w: usize },
    #[error("geometry kh={kh} kw={kw} stride=({stride_h},{stride_w}) pad=({t_pad},{l_pad}) is not 1x1/unit/zero")]
    Geometry {
        kh: usize,
        kw: usize,
        stride_h: usize,
        stride_w: usize,
        t_pad: usize,
        l_pad: usize,
    },
    #[error("input {ih}x{iw} and output {oh}x{ow} spatial sizes differ")]
    SpatialMismatch { ih: usize, iw: usize, oh: usize, ow: usize },
    #[error("output scale mask {0:#x} (expected 0 or 1 << 1)")]
    ScaleMask(u32),
    #[error("{count} output scales for {oc} output channels")]
    ScaleCount { count: usize, oc: usize },
    #[error("empty dimension in shape")]
    EmptyShape,
}

/// Errors surfaced by the crate.
#[derive(Debug, Error)]
pub enum ConvError {
    /// The only recoverable outcome of planning.
    #[error("unsupported configuration: {0}")]
    Unsupported(#[from] Unsupported),
    /// Caller-provided buffers do not match the planned problem.
    #[error("invalid buffer: {0}")]
    InvalidBuffer(String),
    /// Environment override could not be parsed.
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

pub type ConvResult<T> = Result<T, ConvError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_sizes() {
        assert_eq!(DataType::F32.size_bytes(), 4);
        assert_eq!(DataType::S32.size_bytes(), 4);
        assert_eq!(DataType::S8.size_bytes(), 1);
        assert_eq!(DataType::U8.size_bytes(), 1);
    }

    #[test]
    fn test_unsupported_converts_into_conv_error() {
        let err: ConvError = Unsupported::Groups(2).into();
        assert!(matches!(err, ConvError::Unsupported(Unsupported::Groups(2))));
        assert_eq!(
            err.to_string(),
            "unsupported configuration: group count 2 (only 1 is supported)"
        );
    }
}
