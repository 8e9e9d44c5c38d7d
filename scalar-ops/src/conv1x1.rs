//! 1×1 convolution over NHWC activations with plain `[oc][ic]` weights.
//!
//! A 1×1 stride-1 convolution is a GEMM: `pixels × ic` activations times
//! `ic × oc` weights. The store-stage helpers mirror the kernel's fused
//! requantization one step at a time.

// ---------------------------------------------------------------------------
// Accumulation
// ---------------------------------------------------------------------------

/// `out[p][o] = Σ_i src[p][i] * wei[o][i]`, exact i32 (wrapping).
#[no_mangle]
#[inline(never)]
pub extern "C" fn scalar_conv1x1_u8s8_s32(
    src: *const u8,
    wei: *const i8,
    pixels: usize,
    ic: usize,
    oc: usize,
    out: *mut i32,
) {
    unsafe {
        for p in 0..pixels {
            for o in 0..oc {
                let mut acc = 0i32;
                for i in 0..ic {
                    let a = *src.add(p * ic + i) as i32;
                    let b = *wei.add(o * ic + i) as i32;
                    acc = acc.wrapping_add(a * b);
                }
                *out.add(p * oc + o) = acc;
            }
        }
    }
}

/// Like [`scalar_conv1x1_u8s8_s32`] but each pair of adjacent input
/// channels (aligned to 2) is summed into a saturating i16 first.
#[no_mangle]
#[inline(never)]
pub extern "C" fn scalar_conv1x1_u8s8_s32_i16_pairs(
    src: *const u8,
    wei: *const i8,
    pixels: usize,
    ic: usize,
    oc: usize,
    out: *mut i32,
) {
    unsafe {
        for p in 0..pixels {
            for o in 0..oc {
                let mut acc = 0i32;
                let mut i = 0;
                while i + 1 < ic {
                    let s0 = *src.add(p * ic + i) as i32 * *wei.add(o * ic + i) as i32;
                    let s1 = *src.add(p * ic + i + 1) as i32 * *wei.add(o * ic + i + 1) as i32;
                    let pair = (s0 + s1).clamp(i16::MIN as i32, i16::MAX as i32);
                    acc = acc.wrapping_add(pair);
                    i += 2;
                }
                *out.add(p * oc + o) = acc;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Store stage
// ---------------------------------------------------------------------------

/// `out[p][o] = (acc[p][o] + bias[o]) * scale[o or 0]`.
///
/// `bias` may be null. `scale_count` is 1 (per-tensor) or `oc`.
#[no_mangle]
#[inline(never)]
pub extern "C" fn scalar_bias_scale_f32(
    acc: *const i32,
    bias: *const f32,
    scales: *const f32,
    scale_count: usize,
    pixels: usize,
    oc: usize,
    out: *mut f32,
) {
    unsafe {
        for p in 0..pixels {
            for o in 0..oc {
                let mut x = *acc.add(p * oc + o) as f32;
                if !bias.is_null() {
                    x += *bias.add(o);
                }
                let s = if scale_count == 1 { *scales } else { *scales.add(o) };
                *out.add(p * oc + o) = x * s;
            }
        }
    }
}

/// `x = max(x, 0)` in place; NaN and -0.0 pass through.
#[no_mangle]
#[inline(never)]
pub extern "C" fn scalar_relu_f32(x: *mut f32, n: usize) {
    unsafe {
        for i in 0..n {
            let v = *x.add(i);
            if v < 0.0 {
                *x.add(i) = 0.0;
            }
        }
    }
}

/// `x = prev * scale + x` in place, one rounding.
#[no_mangle]
#[inline(never)]
pub extern "C" fn scalar_sum_f32(x: *mut f32, prev: *const f32, scale: f32, n: usize) {
    unsafe {
        for i in 0..n {
            *x.add(i) = (*prev.add(i)).mul_add(scale, *x.add(i));
        }
    }
}

#[inline(always)]
fn round(x: f32, round_down: u32) -> i32 {
    if round_down != 0 {
        x.floor() as i32
    } else {
        x.round_ties_even() as i32
    }
}

/// Round (half-even, or floor when `round_down != 0`) and saturate to u8.
#[no_mangle]
#[inline(never)]
pub extern "C" fn scalar_saturate_u8(x: *const f32, n: usize, round_down: u32, out: *mut u8) {
    unsafe {
        for i in 0..n {
            *out.add(i) = round(*x.add(i), round_down).clamp(0, 255) as u8;
        }
    }
}

/// Round (half-even, or floor when `round_down != 0`) and saturate to s8.
#[no_mangle]
#[inline(never)]
pub extern "C" fn scalar_saturate_s8(x: *const f32, n: usize, round_down: u32, out: *mut i8) {
    unsafe {
        for i in 0..n {
            *out.add(i) = round(*x.add(i), round_down).clamp(-128, 127) as i8;
        }
    }
}

/// Round (half-even, or floor when `round_down != 0`) and saturate to s32.
#[no_mangle]
#[inline(never)]
pub extern "C" fn scalar_saturate_s32(x: *const f32, n: usize, round_down: u32, out: *mut i32) {
    unsafe {
        for i in 0..n {
            *out.add(i) = round(*x.add(i), round_down);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conv_is_a_gemm() {
        let src: Vec<u8> = vec![1, 2, 3, 4];
        let wei: Vec<i8> = vec![1, 0, -1, 1];
        let mut out = vec![0i32; 4];
        scalar_conv1x1_u8s8_s32(src.as_ptr(), wei.as_ptr(), 2, 2, 2, out.as_mut_ptr());
        assert_eq!(out, vec![1, 1, 3, 1]);
    }

    #[test]
    fn test_i16_pairs_saturate() {
        let src = vec![255u8; 4];
        let wei = vec![127i8; 4];
        let mut exact = vec![0i32; 1];
        let mut pairs = vec![0i32; 1];
        scalar_conv1x1_u8s8_s32(src.as_ptr(), wei.as_ptr(), 1, 4, 1, exact.as_mut_ptr());
        scalar_conv1x1_u8s8_s32_i16_pairs(src.as_ptr(), wei.as_ptr(), 1, 4, 1, pairs.as_mut_ptr());
        assert_eq!(exact[0], 4 * 255 * 127);
        assert_eq!(pairs[0], 2 * 32767);
    }

    #[test]
    fn test_saturate_rounding() {
        let x = [-0.5f32, 0.5, 2.5, 254.5, 255.5, -3.0];
        let mut u = [0u8; 6];
        scalar_saturate_u8(x.as_ptr(), 6, 0, u.as_mut_ptr());
        assert_eq!(u, [0, 0, 2, 254, 255, 0]);
        let mut s = [0i8; 6];
        scalar_saturate_s8(x.as_ptr(), 6, 1, s.as_mut_ptr());
        assert_eq!(s, [-1, 0, 2, 127, 127, -3]);
    }
}
