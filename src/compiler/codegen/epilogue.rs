//! Store stage: dtype conversion table and the requantization pipeline.
//!
//! Widening (bias, residual destination) and narrowing (destination) are
//! plain function pointers picked once per kernel from the dtype triple,
//! so the hot loop never matches on a dtype.

use crate::compiler::fusion::{EpiloguePlan, SumMode};
use crate::kernel_types::SIMD_W;
use crate::types::{DataType, RoundMode};

use super::simd_ops::{F32x16, I32x16};

/// Read `n` elements at a byte pointer and widen them to f32 lanes.
pub type WidenFn = unsafe fn(*const u8, usize) -> F32x16;
/// Round, saturate and write `n` lanes to a byte pointer.
pub type NarrowFn = unsafe fn(*mut u8, &F32x16, usize, fn(f32) -> f32);

unsafe fn widen_f32(ptr: *const u8, n: usize) -> F32x16 {
    let mut v = F32x16::ZERO;
    for i in 0..n.min(SIMD_W) {
        v.0[i] = (ptr as *const f32).add(i).read_unaligned();
    }
    v
}

unsafe fn widen_s32(ptr: *const u8, n: usize) -> F32x16 {
    let mut v = F32x16::ZERO;
    for i in 0..n.min(SIMD_W) {
        v.0[i] = (ptr as *const i32).add(i).read_unaligned() as f32;
    }
    v
}

unsafe fn widen_s8(ptr: *const u8, n: usize) -> F32x16 {
    let mut v = F32x16::ZERO;
    for i in 0..n.min(SIMD_W) {
        v.0[i] = *(ptr as *const i8).add(i) as f32;
    }
    v
}

unsafe fn widen_u8(ptr: *const u8, n: usize) -> F32x16 {
    let mut v = F32x16::ZERO;
    for i in 0..n.min(SIMD_W) {
        v.0[i] = *ptr.add(i) as f32;
    }
    v
}

unsafe fn narrow_f32(ptr: *mut u8, v: &F32x16, n: usize, _round: fn(f32) -> f32) {
    for i in 0..n.min(SIMD_W) {
        (ptr as *mut f32).add(i).write_unaligned(v.0[i]);
    }
}

unsafe fn narrow_s32(ptr: *mut u8, v: &F32x16, n: usize, round: fn(f32) -> f32) {
    for i in 0..n.min(SIMD_W) {
        (ptr as *mut i32).add(i).write_unaligned(round(v.0[i]) as i32);
    }
}

unsafe fn narrow_s8(ptr: *mut u8, v: &F32x16, n: usize, round: fn(f32) -> f32) {
    for i in 0..n.min(SIMD_W) {
        let x = (round(v.0[i]) as i32).clamp(i8::MIN as i32, i8::MAX as i32);
        *(ptr as *mut i8).add(i) = x as i8;
    }
}

unsafe fn narrow_u8(ptr: *mut u8, v: &F32x16, n: usize, round: fn(f32) -> f32) {
    for i in 0..n.min(SIMD_W) {
        let x = (round(v.0[i]) as i32).clamp(0, u8::MAX as i32);
        *ptr.add(i) = x as u8;
    }
}

fn widen_fn(dt: DataType) -> WidenFn {
    match dt {
        DataType::F32 => widen_f32,
        DataType::S32 => widen_s32,
        DataType::S8 => widen_s8,
        DataType::U8 => widen_u8,
    }
}

fn narrow_fn(dt: DataType) -> NarrowFn {
    match dt {
        DataType::F32 => narrow_f32,
        DataType::S32 => narrow_s32,
        DataType::S8 => narrow_s8,
        DataType::U8 => narrow_u8,
    }
}

fn round_nearest(x: f32) -> f32 {
    x.round_ties_even()
}

fn round_down(x: f32) -> f32 {
    x.floor()
}

/// Rounding function for `mode`.
pub fn round_fn(mode: RoundMode) -> fn(f32) -> f32 {
    match mode {
        RoundMode::Nearest => round_nearest,
        RoundMode::Down => round_down,
    }
}

/// Round then saturate one value into `dst`'s range, as the store stage
/// does. `F32` destinations are returned unchanged.
pub fn requantize(x: f32, dst: DataType, mode: RoundMode) -> f32 {
    let r = round_fn(mode)(x);
    match dst {
        DataType::F32 => x,
        DataType::S32 => (r as i32) as f32,
        DataType::S8 => (r as i32).clamp(i8::MIN as i32, i8::MAX as i32) as f32,
        DataType::U8 => (r as i32).clamp(0, u8::MAX as i32) as f32,
    }
}

/// Dtype-resolved store entry points for one kernel.
#[derive(Clone, Copy)]
pub struct StoreTable {
    pub bias_dt: Option<DataType>,
    pub dst_dt: DataType,
    pub round_mode: RoundMode,
    pub load_bias: Option<WidenFn>,
    pub load_dst: WidenFn,
    pub store_dst: NarrowFn,
    pub round: fn(f32) -> f32,
}

impl StoreTable {
    pub fn resolve(bias_dt: Option<DataType>, dst_dt: DataType, round_mode: RoundMode) -> Self {
        StoreTable {
            bias_dt,
            dst_dt,
            round_mode,
            load_bias: bias_dt.map(widen_fn),
            load_dst: widen_fn(dst_dt),
            store_dst: narrow_fn(dst_dt),
            round: round_fn(round_mode),
        }
    }
}

impl std::fmt::Debug for StoreTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreTable")
            .field("bias_dt", &self.bias_dt)
            .field("dst_dt", &self.dst_dt)
            .field("round_mode", &self.round_mode)
            .finish()
    }
}

/// One step of the store stage, in execution order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StoreOp {
    ConvertToF32,
    AddBias(DataType),
    Scale { per_channel: bool },
    Relu,
    Sum(SumMode),
    Round(RoundMode),
    Saturate(DataType),
    Store(DataType),
}

/// The store stage as data, for a kernel with the given decisions.
pub fn store_sequence(table: &StoreTable, epilogue: &EpiloguePlan, per_channel: bool) -> Vec<StoreOp> {
    let mut ops = vec![StoreOp::ConvertToF32];
    if let Some(dt) = table.bias_dt {
        ops.push(StoreOp::AddBias(dt));
    }
    ops.push(StoreOp::Scale { per_channel });
    if epilogue.relu_before_sum {
        ops.push(StoreOp::Relu);
    }
    if let Some(mode) = epilogue.sum {
        ops.push(StoreOp::Sum(mode));
    }
    if epilogue.relu_after_sum {
        ops.push(StoreOp::Relu);
    }
    if table.dst_dt != DataType::F32 {
        ops.push(StoreOp::Round(table.round_mode));
        ops.push(StoreOp::Saturate(table.dst_dt));
    }
    ops.push(StoreOp::Store(table.dst_dt));
    ops
}

/// Per-block inputs to [`apply`] that do not vary along the broadcast tile.
pub struct BlockOperands {
    pub bias: Option<F32x16>,
    pub scale: F32x16,
    pub lanes: usize,
}

/// Run the store stage for one accumulator register and write it to `out`.
///
/// # Safety
/// `out` must be valid for `ops.lanes` destination elements; when the
/// epilogue sums, it is also read first.
#[inline(always)]
pub unsafe fn apply(
    table: &StoreTable,
    epilogue: &EpiloguePlan,
    acc: &I32x16,
    ops: &BlockOperands,
    out: *mut u8,
) {
    let mut r = acc.to_f32();
    if let Some(b) = ops.bias {
        r = r.add(b);
    }
    r = r.mul(ops.scale);
    if epilogue.relu_before_sum {
        r = r.relu();
    }
    match epilogue.sum {
        Some(SumMode::PlainAdd) => {
            let prev = (table.load_dst)(out, ops.lanes);
            r = r.add(prev);
        }
        Some(SumMode::Scaled(s)) => {
            let prev = (table.load_dst)(out, ops.lanes);
            r = prev.mul_add(F32x16::splat(s), r);
        }
        None => {}
    }
    if epilogue.relu_after_sum {
        r = r.relu();
    }
    (table.store_dst)(out, &r, ops.lanes, table.round);
}
