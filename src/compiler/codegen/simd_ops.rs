//! Lane types and the dot-product backends.
//!
//! `I32x16` / `F32x16` model one 512-bit register. The `DotProduct` trait
//! is the only seam between the two kernel flavours; the loop nest is
//! generic over it, so each flavour is monomorphized once.

use crate::kernel_types::SIMD_W;

// ── Lane types ──────────────────────────────────────────────────────────────

/// Sixteen i32 accumulator lanes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, align(64))]
pub struct I32x16(pub [i32; SIMD_W]);

/// Sixteen f32 lanes of the store stage.
#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(C, align(64))]
pub struct F32x16(pub [f32; SIMD_W]);

impl I32x16 {
    pub const ZERO: I32x16 = I32x16([0; SIMD_W]);

    /// Load the first `n` lanes from `ptr`, zeroing the rest.
    ///
    /// # Safety
    /// `ptr` must be valid for `n` reads.
    #[inline(always)]
    pub unsafe fn load_partial(ptr: *const i32, n: usize) -> Self {
        let mut v = Self::ZERO;
        std::ptr::copy_nonoverlapping(ptr, v.0.as_mut_ptr(), n.min(SIMD_W));
        v
    }

    /// Store the first `n` lanes to `ptr`.
    ///
    /// # Safety
    /// `ptr` must be valid for `n` writes.
    #[inline(always)]
    pub unsafe fn store_partial(&self, ptr: *mut i32, n: usize) {
        std::ptr::copy_nonoverlapping(self.0.as_ptr(), ptr, n.min(SIMD_W));
    }

    #[inline(always)]
    pub fn to_f32(self) -> F32x16 {
        F32x16(self.0.map(|x| x as f32))
    }
}

impl F32x16 {
    pub const ZERO: F32x16 = F32x16([0.0; SIMD_W]);

    #[inline(always)]
    pub fn splat(x: f32) -> Self {
        F32x16([x; SIMD_W])
    }

    /// # Safety
    /// `ptr` must be valid for `n` reads.
    #[inline(always)]
    pub unsafe fn load_partial(ptr: *const f32, n: usize, fill: f32) -> Self {
        let mut v = Self::splat(fill);
        std::ptr::copy_nonoverlapping(ptr, v.0.as_mut_ptr(), n.min(SIMD_W));
        v
    }

    #[inline(always)]
    pub fn add(self, rhs: Self) -> Self {
        F32x16(std::array::from_fn(|i| self.0[i] + rhs.0[i]))
    }

    #[inline(always)]
    pub fn mul(self, rhs: Self) -> Self {
        F32x16(std::array::from_fn(|i| self.0[i] * rhs.0[i]))
    }

    /// `self * m + a` with a single rounding per lane.
    #[inline(always)]
    pub fn mul_add(self, m: Self, a: Self) -> Self {
        F32x16(std::array::from_fn(|i| self.0[i].mul_add(m.0[i], a.0[i])))
    }

    /// Clamp negatives to zero. `-0.0` and NaN pass through.
    #[inline(always)]
    pub fn relu(self) -> Self {
        F32x16(self.0.map(|x| if x < 0.0 { 0.0 } else { x }))
    }
}

// ── Dot-product backends ────────────────────────────────────────────────────

/// One 4-deep u8×s8 step into sixteen i32 lanes.
///
/// `quad` is the broadcast source (four consecutive input channels of one
/// pixel); `wei` holds four signed weights per lane, lane-major.
pub trait DotProduct {
    const NAME: &'static str;

    fn dot4(acc: &mut I32x16, quad: [u8; 4], wei: &[i8; 4 * SIMD_W]);
}

/// Native 4-way dot product: exact i32 accumulation, wrapping on overflow.
pub struct NativeDot;

impl DotProduct for NativeDot {
    const NAME: &'static str = "vnni";

    #[inline(always)]
    fn dot4(acc: &mut I32x16, quad: [u8; 4], wei: &[i8; 4 * SIMD_W]) {
        for (lane, w) in acc.0.iter_mut().zip(wei.chunks_exact(4)) {
            let s: i32 = (0..4).map(|j| quad[j] as i32 * w[j] as i32).sum();
            *lane = lane.wrapping_add(s);
        }
    }
}

/// Emulated dot product: pairwise multiply-add into saturating i16, widen
/// pairs with a multiply by one, then add into i32.
///
/// Pair sums outside i16 saturate, so results differ from [`NativeDot`]
/// when both u8 activations and s8 weights sit near their extremes.
pub struct EmulatedDot;

impl EmulatedDot {
    #[inline(always)]
    fn madd_pair(a0: u8, b0: i8, a1: u8, b1: i8) -> i16 {
        let s = a0 as i32 * b0 as i32 + a1 as i32 * b1 as i32;
        s.clamp(i16::MIN as i32, i16::MAX as i32) as i16
    }
}

impl DotProduct for EmulatedDot {
    const NAME: &'static str = "avx512_core";

    #[inline(always)]
    fn dot4(acc: &mut I32x16, quad: [u8; 4], wei: &[i8; 4 * SIMD_W]) {
        for (lane, w) in acc.0.iter_mut().zip(wei.chunks_exact(4)) {
            let lo = Self::madd_pair(quad[0], w[0], quad[1], w[1]);
            let hi = Self::madd_pair(quad[2], w[2], quad[3], w[3]);
            let widened = lo as i32 + hi as i32;
            *lane = lane.wrapping_add(widened);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weights(f: impl Fn(usize, usize) -> i8) -> [i8; 4 * SIMD_W] {
        std::array::from_fn(|i| f(i / 4, i % 4))
    }

    #[test]
    fn test_native_dot_matches_scalar() {
        let wei = weights(|lane, j| (lane as i8) - (j as i8) * 3);
        let quad = [1, 2, 250, 7];
        let mut acc = I32x16([5; SIMD_W]);
        NativeDot::dot4(&mut acc, quad, &wei);
        for lane in 0..SIMD_W {
            let expect: i32 = 5 + (0..4).map(|j| quad[j] as i32 * wei[lane * 4 + j] as i32).sum::<i32>();
            assert_eq!(acc.0[lane], expect, "lane {lane}");
        }
    }

    #[test]
    fn test_emulated_matches_native_in_range() {
        let wei = weights(|lane, j| (lane as i8 * 7 - 50) + j as i8);
        let quad = [3, 100, 17, 64];
        let mut a = I32x16::ZERO;
        let mut b = I32x16::ZERO;
        NativeDot::dot4(&mut a, quad, &wei);
        EmulatedDot::dot4(&mut b, quad, &wei);
        assert_eq!(a, b);
    }

    #[test]
    fn test_emulated_saturates_pair_sums() {
        let wei = [127i8; 4 * SIMD_W];
        let quad = [255u8; 4];
        let mut native = I32x16::ZERO;
        let mut emulated = I32x16::ZERO;
        NativeDot::dot4(&mut native, quad, &wei);
        EmulatedDot::dot4(&mut emulated, quad, &wei);
        assert_eq!(native.0[0], 4 * 255 * 127);
        // 2*255*127 = 64770 saturates to 32767 per pair
        assert_eq!(emulated.0[0], 2 * i16::MAX as i32);

        let wei = [-128i8; 4 * SIMD_W];
        let mut emulated = I32x16::ZERO;
        EmulatedDot::dot4(&mut emulated, quad, &wei);
        assert_eq!(emulated.0[3], 2 * i16::MIN as i32);
    }

    #[test]
    fn test_relu_keeps_negative_zero_and_nan() {
        let mut v = F32x16::splat(-3.0);
        v.0[1] = -0.0;
        v.0[2] = f32::NAN;
        v.0[3] = 2.5;
        let r = v.relu();
        assert_eq!(r.0[0], 0.0);
        assert!(r.0[1] == 0.0 && r.0[1].is_sign_negative());
        assert!(r.0[2].is_nan());
        assert_eq!(r.0[3], 2.5);
    }

    #[test]
    fn test_partial_load_store() {
        let src: Vec<i32> = (0..16).collect();
        let v = unsafe { I32x16::load_partial(src.as_ptr(), 5) };
        assert_eq!(&v.0[..6], &[0, 1, 2, 3, 4, 0]);
        let mut dst = vec![-1i32; 16];
        unsafe { v.store_partial(dst.as_mut_ptr(), 3) };
        assert_eq!(&dst[..4], &[0, 1, 2, -1]);
    }
}
