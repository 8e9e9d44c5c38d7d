//! Capability and shape validation.
//!
//! Every check must pass before the planner runs; any failure is reported
//! as [`Unsupported`] and the caller falls back to a generic convolution.

use crate::compiler::fusion::post_ops_ok;
use crate::dispatch::{CpuCaps, KernelVersion};
use crate::kernel_types::{ConvDesc, PrimitiveAttr, OC_SCALE_MASK, SIMD_W};
use crate::types::{DataType, MemoryFormat, Unsupported};

/// A configuration that passed validation: the seed for the planner.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidatedConf {
    pub desc: ConvDesc,
    pub version: KernelVersion,
    pub with_bias: bool,
    pub with_eltwise: bool,
    pub bias_dt: Option<DataType>,
    pub dst_dt: DataType,
    pub is_oc_scale: bool,
}

/// Check that the int8 1×1 kernel can implement `desc` with `attr` on a
/// CPU with `caps`.
pub fn validate(desc: &ConvDesc, attr: &PrimitiveAttr, caps: CpuCaps) -> Result<ValidatedConf, Unsupported> {
    if !caps.avx512_core {
        return Err(Unsupported::Isa);
    }

    let dt = &desc.dtypes;
    let dst_ok = matches!(dt.dst, DataType::F32 | DataType::S32 | DataType::S8 | DataType::U8);
    if dt.src != DataType::U8 || dt.wei != DataType::S8 || !dst_ok {
        return Err(Unsupported::DataTypes { src: dt.src, wei: dt.wei, dst: dt.dst });
    }
    if !matches!(desc.layouts.wei, MemoryFormat::OIhw4i16o4i | MemoryFormat::GOIhw4i16o4i) {
        return Err(Unsupported::WeightsFormat(desc.layouts.wei));
    }
    if desc.with_relu && desc.relu_negative_slope != 0.0 {
        return Err(Unsupported::EltwiseSlope(desc.relu_negative_slope));
    }

    let s = &desc.shape;
    if s.mb == 0 || s.ic == 0 || s.oc == 0 || s.oh == 0 || s.ow == 0 || s.ih == 0 || s.iw == 0 {
        return Err(Unsupported::EmptyShape);
    }

    if !post_ops_ok(&attr.post_ops, desc.with_relu) {
        return Err(Unsupported::PostOps(attr.post_ops.to_string()));
    }

    if s.ngroups != 1 {
        return Err(Unsupported::Groups(s.ngroups));
    }
    let l = &desc.layouts;
    let bias_fmt_ok = matches!(l.bias, MemoryFormat::Undef | MemoryFormat::Any | MemoryFormat::X);
    if l.src != MemoryFormat::Nhwc || l.dst != MemoryFormat::Nhwc || !bias_fmt_ok {
        return Err(Unsupported::Layout { src: l.src, dst: l.dst, bias: l.bias });
    }

    if s.oc % SIMD_W != 0 || s.ic % SIMD_W != 0 {
        return Err(Unsupported::ChannelAlignment { ic: s.ic, oc: s.oc, simd_w: SIMD_W });
    }
    let geometry_ok = s.t_pad == 0
        && s.l_pad == 0
        && s.stride_h == 1
        && s.stride_w == 1
        && s.kh == 1
        && s.kw == 1;
    if !geometry_ok {
        return Err(Unsupported::Geometry {
            kh: s.kh,
            kw: s.kw,
            stride_h: s.stride_h,
            stride_w: s.stride_w,
            t_pad: s.t_pad,
            l_pad: s.l_pad,
        });
    }
    // the kernel walks source and destination pixels in lockstep
    if s.ih != s.oh || s.iw != s.ow {
        return Err(Unsupported::SpatialMismatch { ih: s.ih, iw: s.iw, oh: s.oh, ow: s.ow });
    }

    let with_bias = desc.with_bias();
    let bias_dt = if with_bias { dt.bias } else { None };

    let scales = &attr.output_scales;
    let is_oc_scale = match scales.mask {
        OC_SCALE_MASK => true,
        0 => false,
        m => return Err(Unsupported::ScaleMask(m)),
    };
    let expected = if is_oc_scale { s.oc } else { 1 };
    if scales.scales.len() != expected {
        return Err(Unsupported::ScaleCount { count: scales.scales.len(), oc: s.oc });
    }

    Ok(ValidatedConf {
        desc: *desc,
        version: caps.kernel_version(),
        with_bias,
        with_eltwise: desc.with_relu,
        bias_dt,
        dst_dt: dt.dst,
        is_oc_scale,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel_types::{ConvShape, DtypeSet, OutputScales, PostOps};

    fn desc() -> ConvDesc {
        ConvDesc::new(ConvShape::conv_1x1(1, 32, 64, 7, 7), DtypeSet::u8s8(Some(DataType::F32), DataType::U8))
    }

    fn check(d: &ConvDesc, attr: &PrimitiveAttr) -> Result<ValidatedConf, Unsupported> {
        validate(d, attr, CpuCaps::vnni())
    }

    #[test]
    fn test_accepts_supported_configuration() {
        let conf = check(&desc(), &PrimitiveAttr::default()).unwrap();
        assert_eq!(conf.version, KernelVersion::Vnni);
        assert!(conf.with_bias);
        assert_eq!(conf.bias_dt, Some(DataType::F32));
        assert!(!conf.is_oc_scale);
    }

    #[test]
    fn test_rejects_missing_isa() {
        let err = validate(&desc(), &PrimitiveAttr::default(), CpuCaps { avx512_core: false, vnni: false });
        assert_eq!(err, Err(Unsupported::Isa));
    }

    #[test]
    fn test_rejects_bad_dtypes() {
        let mut d = desc();
        d.dtypes.src = DataType::S8;
        assert!(matches!(check(&d, &PrimitiveAttr::default()), Err(Unsupported::DataTypes { .. })));
        let mut d = desc();
        d.dtypes.wei = DataType::U8;
        assert!(matches!(check(&d, &PrimitiveAttr::default()), Err(Unsupported::DataTypes { .. })));
    }

    #[test]
    fn test_rejects_layouts_and_geometry() {
        let mut d = desc();
        d.layouts.wei = MemoryFormat::OIhw;
        assert_eq!(check(&d, &PrimitiveAttr::default()), Err(Unsupported::WeightsFormat(MemoryFormat::OIhw)));

        let mut d = desc();
        d.layouts.src = MemoryFormat::Nchw;
        assert!(matches!(check(&d, &PrimitiveAttr::default()), Err(Unsupported::Layout { .. })));

        let mut d = desc();
        d.shape.ngroups = 2;
        assert_eq!(check(&d, &PrimitiveAttr::default()), Err(Unsupported::Groups(2)));

        let mut d = desc();
        d.shape.ic = 24;
        assert!(matches!(check(&d, &PrimitiveAttr::default()), Err(Unsupported::ChannelAlignment { .. })));

        let tweaks: [fn(&mut ConvShape); 6] = [
            |s| s.stride_h = 2,
            |s| s.stride_w = 2,
            |s| s.t_pad = 1,
            |s| s.l_pad = 1,
            |s| s.kh = 3,
            |s| s.kw = 3,
        ];
        for tweak in tweaks {
            let mut d = desc();
            tweak(&mut d.shape);
            assert!(matches!(check(&d, &PrimitiveAttr::default()), Err(Unsupported::Geometry { .. })));
        }

        let mut d = desc();
        d.shape.ih = 1;
        d.shape.iw = 1;
        assert_eq!(
            check(&d, &PrimitiveAttr::default()),
            Err(Unsupported::SpatialMismatch { ih: 1, iw: 1, oh: 7, ow: 7 })
        );
        let mut d = desc();
        d.shape.oh = 6;
        assert!(matches!(check(&d, &PrimitiveAttr::default()), Err(Unsupported::SpatialMismatch { .. })));
    }

    #[test]
    fn test_rejects_leaky_fused_relu() {
        let d = desc().with_fused_relu(0.1);
        assert_eq!(check(&d, &PrimitiveAttr::default()), Err(Unsupported::EltwiseSlope(0.1)));
        let d = desc().with_fused_relu(0.0);
        assert!(check(&d, &PrimitiveAttr::default()).unwrap().with_eltwise);
    }

    #[test]
    fn test_rejects_unfusible_post_ops() {
        let mut attr = PrimitiveAttr::default();
        attr.post_ops = PostOps::new();
        attr.post_ops.append_relu().append_relu();
        assert!(matches!(check(&desc(), &attr), Err(Unsupported::PostOps(_))));
    }

    #[test]
    fn test_scale_mask_and_count() {
        let mut attr = PrimitiveAttr::default();
        attr.output_scales = OutputScales::per_channel(vec![1.0; 64]);
        assert!(check(&desc(), &attr).unwrap().is_oc_scale);

        attr.output_scales = OutputScales::per_channel(vec![1.0; 63]);
        assert_eq!(check(&desc(), &attr), Err(Unsupported::ScaleCount { count: 63, oc: 64 }));

        attr.output_scales = OutputScales { mask: 1, scales: vec![1.0] };
        assert_eq!(check(&desc(), &attr), Err(Unsupported::ScaleMask(1)));
    }
}
