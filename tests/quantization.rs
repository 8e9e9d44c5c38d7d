//! Requantization boundaries through the full kernel.
//!
//! Weights are zero, so every output is `bias * scale` (plus the residual
//! when a sum is fused) and lands on exact rounding boundaries.

use int8_conv_kernels::{
    compile, requantize, BiasData, ConvDesc, ConvDriver, ConvShape, CpuCaps, DataType, DtypeSet, Element,
    OutputScales, PlannerConfig, PrimitiveAttr, RoundMode, StoreOp, SumMode,
};
use std::sync::Arc;

const OC: usize = 16;
const IC: usize = 16;

fn run<D: Element + Default>(dst_dt: DataType, attr: &PrimitiveAttr, bias: &[f32], init: Vec<D>) -> Vec<D> {
    let desc = ConvDesc::new(ConvShape::conv_1x1(1, IC, OC, 1, 1), DtypeSet::u8s8(Some(DataType::F32), dst_dt));
    let kernel = compile(&desc, attr, &PlannerConfig::new(1, 1 << 20), CpuCaps::vnni()).unwrap();
    let drv = ConvDriver::new(Arc::new(kernel), attr).unwrap();
    let mut dst = init;
    drv.execute(&[7u8; IC], &[0i8; OC * IC], Some(BiasData::F32(bias)), &mut dst).unwrap();
    dst
}

fn padded(values: &[f32]) -> Vec<f32> {
    let mut v = values.to_vec();
    v.resize(OC, 0.0);
    v
}

#[test]
fn test_u8_round_half_even() {
    let bias = padded(&[-0.5, 0.5, 1.5, 2.5, 254.5, 255.5, 300.0, -7.0]);
    let dst = run::<u8>(DataType::U8, &PrimitiveAttr::default(), &bias, vec![0; OC]);
    assert_eq!(&dst[..8], &[0, 0, 2, 2, 254, 255, 255, 0]);
}

#[test]
fn test_s8_round_down() {
    let bias = padded(&[-0.5, 0.5, 2.5, -128.5, 127.9, -1000.0]);
    let mut attr = PrimitiveAttr::default();
    attr.round_mode = RoundMode::Down;
    let dst = run::<i8>(DataType::S8, &attr, &bias, vec![0; OC]);
    assert_eq!(&dst[..6], &[-1, 0, 2, -128, 127, -128]);
}

#[test]
fn test_s32_saturates_and_f32_is_exact() {
    let bias = padded(&[3e9, -3e9, 2.5, -2.5]);
    let dst = run::<i32>(DataType::S32, &PrimitiveAttr::default(), &bias, vec![0; OC]);
    assert_eq!(&dst[..4], &[i32::MAX, i32::MIN, 2, -2]);

    let bias = padded(&[0.3, -1.75, 1e-3]);
    let dst = run::<f32>(DataType::F32, &PrimitiveAttr::default(), &bias, vec![0.0; OC]);
    assert_eq!(&dst[..3], &[0.3, -1.75, 1e-3]);
}

#[test]
fn test_per_channel_scales() {
    let bias = vec![10.0f32; OC];
    let mut attr = PrimitiveAttr::default();
    attr.output_scales = OutputScales::per_channel((0..OC).map(|o| o as f32 * 0.5).collect());
    let dst = run::<f32>(DataType::F32, &attr, &bias, vec![0.0; OC]);
    for (o, v) in dst.iter().enumerate() {
        assert_eq!(*v, o as f32 * 5.0, "channel {o}");
    }
}

#[test]
fn test_plain_add_equals_unit_scale_fma() {
    let bias = padded(&[0.1, -3.3, 7.77, 1e6, -0.0]);
    let residual: Vec<f32> = (0..OC).map(|o| o as f32 * 0.37 - 2.0).collect();

    let mut plain = PrimitiveAttr::default();
    plain.post_ops.append_sum(1.0);
    let got = run::<f32>(DataType::F32, &plain, &bias, residual.clone());

    for o in 0..OC {
        let fma = residual[o].mul_add(1.0, bias[o]);
        assert!((got[o] - fma).abs() <= f32::EPSILON * fma.abs().max(1.0), "channel {o}");
    }
}

#[test]
fn test_scaled_sum_then_u8_requantize() {
    let bias = padded(&[1.0, -20.0, 100.25, 0.5]);
    let residual: Vec<u8> = vec![10, 10, 200, 3].into_iter().chain(std::iter::repeat(0).take(OC - 4)).collect();
    let mut attr = PrimitiveAttr::default();
    attr.post_ops.append_sum(0.5);
    let dst = run::<u8>(DataType::U8, &attr, &bias, residual.clone());
    for o in 0..4 {
        let expect = requantize(bias[o] + residual[o] as f32 * 0.5, DataType::U8, RoundMode::Nearest);
        assert_eq!(dst[o] as f32, expect, "channel {o}");
    }
    // 1 + 5 = 6; max(0, -20 + 5) = 0; 100.25 + 100 → 200; 0.5 + 1.5 = 2
    assert_eq!(&dst[..4], &[6, 0, 200, 2]);
}

#[test]
fn test_store_sequences_differ_only_in_sum_mode() {
    let desc = ConvDesc::new(ConvShape::conv_1x1(1, IC, OC, 1, 1), DtypeSet::u8s8(None, DataType::S8));
    let cfg = PlannerConfig::new(1, 1 << 20);
    let mut a = PrimitiveAttr::default();
    a.post_ops.append_sum(1.0);
    let mut b = PrimitiveAttr::default();
    b.post_ops.append_sum(2.0);
    let sa = compile(&desc, &a, &cfg, CpuCaps::vnni()).unwrap().store_sequence();
    let sb = compile(&desc, &b, &cfg, CpuCaps::vnni()).unwrap().store_sequence();
    assert!(sa.contains(&StoreOp::Sum(SumMode::PlainAdd)));
    assert!(sb.contains(&StoreOp::Sum(SumMode::Scaled(2.0))));
    assert_eq!(sa.len(), sb.len());
    assert_eq!(sa.last(), Some(&StoreOp::Store(DataType::S8)));
}
