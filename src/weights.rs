//! Weight packing into the blocked `OIhw4i16o4i` layout the kernel reads.
//!
//! ```text
//! packed[ob][ib][q][o][i] = w[ob*16 + o][ib*16 + q*4 + i]
//!         ^   ^   ^  ^  ^
//!         |   |   |  |  └ 4 input channels of one quad
//!         |   |   |  └─── 16 output channels (one vector)
//!         |   |   └────── 4 quads per input block
//!         |   └────────── input-channel block of 16
//!         └────────────── output-channel block of 16
//! ```

use crate::kernel_types::SIMD_W;
use crate::types::{ConvError, ConvResult};

/// Bytes of one (output block, input block) tile.
pub const BLOCK_BYTES: usize = SIMD_W * SIMD_W;

/// Pack plain `[oc][ic]` weights into `OIhw4i16o4i`.
///
/// Both channel counts must be multiples of 16.
pub fn pack_weights(oihw: &[i8], oc: usize, ic: usize) -> ConvResult<Vec<i8>> {
    if oc % SIMD_W != 0 || ic % SIMD_W != 0 {
        return Err(ConvError::InvalidBuffer(format!(
            "weights {oc}x{ic} are not blocked by {SIMD_W}"
        )));
    }
    if oihw.len() != oc * ic {
        return Err(ConvError::InvalidBuffer(format!(
            "weights hold {} values, expected {oc}x{ic}",
            oihw.len()
        )));
    }

    let mut packed = vec![0i8; oc * ic];
    for ob in 0..oc / SIMD_W {
        for ib in 0..ic / SIMD_W {
            let tile = &mut packed[(ob * (ic / SIMD_W) + ib) * BLOCK_BYTES..][..BLOCK_BYTES];
            for q in 0..4 {
                for o in 0..SIMD_W {
                    let row = &oihw[(ob * SIMD_W + o) * ic + ib * SIMD_W + q * 4..][..4];
                    tile[q * 64 + o * 4..][..4].copy_from_slice(row);
                }
            }
        }
    }
    Ok(packed)
}

/// Offset of weight `(o, i)` in the packed buffer.
#[inline]
pub fn packed_offset(o: usize, i: usize, ic: usize) -> usize {
    let (ob, o) = (o / SIMD_W, o % SIMD_W);
    let (ib, i) = (i / SIMD_W, i % SIMD_W);
    (ob * (ic / SIMD_W) + ib) * BLOCK_BYTES + (i / 4) * 64 + o * 4 + i % 4
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_places_every_weight() {
        let (oc, ic) = (32, 48);
        let plain: Vec<i8> = (0..oc * ic).map(|k| (k % 251) as i8).collect();
        let packed = pack_weights(&plain, oc, ic).unwrap();
        for o in 0..oc {
            for i in 0..ic {
                assert_eq!(packed[packed_offset(o, i, ic)], plain[o * ic + i], "w[{o}][{i}]");
            }
        }
    }

    #[test]
    fn test_first_quad_layout() {
        let ic = 16;
        let plain: Vec<i8> = (0..16 * ic).map(|k| (k % 100) as i8).collect();
        let packed = pack_weights(&plain, 16, ic).unwrap();
        // quad 0: lane o holds w[o][0..4]
        assert_eq!(&packed[0..4], &plain[0..4]);
        assert_eq!(&packed[4..8], &plain[ic..ic + 4]);
        // quad 1 starts after 16 lanes of 4
        assert_eq!(&packed[64..68], &plain[4..8]);
    }

    #[test]
    fn test_rejects_unaligned_or_short_weights() {
        assert!(matches!(pack_weights(&[0; 16 * 24], 16, 24), Err(ConvError::InvalidBuffer(_))));
        assert!(matches!(pack_weights(&[0; 10], 16, 16), Err(ConvError::InvalidBuffer(_))));
    }
}
