//! Reference scheduler around a [`CompiledKernel`].
//!
//! Splits the problem the way the blocking plan prescribes: broadcast work
//! (batch × pixel tiles) is balanced across `nthreads / load_grp_count`
//! partitions, output-channel blocks across `load_grp_count` groups, and
//! the input channels into `reduce_blocking` chunks carried through an i32
//! scratch buffer with first/last flags.
//!
//! Partitions cover disjoint destination rows, so the parallel mode hands
//! each one its own slice and needs no synchronization.

use std::sync::Arc;

use rayon::prelude::*;

use crate::compiler::executable::{CompiledKernel, KernelCallArgs, FLAG_REDUCE_FIRST, FLAG_REDUCE_LAST};
use crate::compiler::planner::{div_up, BlockingPlan, LoopOrder};
use crate::kernel_types::{PrimitiveAttr, SIMD_W};
use crate::types::{ConvError, ConvResult, DataType};

/// Destination element types the driver accepts.
pub trait Element: Copy + Send + Sync + 'static {
    const DATA_TYPE: DataType;
}

impl Element for f32 {
    const DATA_TYPE: DataType = DataType::F32;
}

impl Element for i32 {
    const DATA_TYPE: DataType = DataType::S32;
}

impl Element for i8 {
    const DATA_TYPE: DataType = DataType::S8;
}

impl Element for u8 {
    const DATA_TYPE: DataType = DataType::U8;
}

/// Bias vector in any supported data type.
#[derive(Debug, Clone, Copy)]
pub enum BiasData<'a> {
    F32(&'a [f32]),
    S32(&'a [i32]),
    S8(&'a [i8]),
    U8(&'a [u8]),
}

impl BiasData<'_> {
    pub fn data_type(&self) -> DataType {
        match self {
            BiasData::F32(_) => DataType::F32,
            BiasData::S32(_) => DataType::S32,
            BiasData::S8(_) => DataType::S8,
            BiasData::U8(_) => DataType::U8,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            BiasData::F32(b) => b.len(),
            BiasData::S32(b) => b.len(),
            BiasData::S8(b) => b.len(),
            BiasData::U8(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn as_byte_ptr(&self) -> *const u8 {
        match self {
            BiasData::F32(b) => b.as_ptr() as *const u8,
            BiasData::S32(b) => b.as_ptr() as *const u8,
            BiasData::S8(b) => b.as_ptr() as *const u8,
            BiasData::U8(b) => b.as_ptr(),
        }
    }
}

/// Even split of `n` items over `team` members, mkl-style: the first
/// members take one extra item.
pub fn balance211(n: usize, team: usize, tid: usize) -> (usize, usize) {
    if team <= 1 || n == 0 {
        return (0, n);
    }
    let n1 = div_up(n, team);
    let n2 = n1 - 1;
    let t1 = n - n2 * team;
    let len = if tid < t1 { n1 } else { n2 };
    let start = if tid <= t1 { tid * n1 } else { t1 * n1 + (tid - t1) * n2 };
    (start, start + len)
}

/// Blocked step: take the whole remainder when it is below `tail_step`.
#[inline]
fn step(default_step: usize, remaining: usize, tail_step: usize) -> usize {
    if remaining < tail_step {
        remaining
    } else {
        default_step
    }
}

/// Contiguous destination rows owned by one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    pub work_start: usize,
    pub work_end: usize,
    pub pixel_start: usize,
    pub pixel_end: usize,
}

#[derive(Debug, Clone, Copy)]
struct LoadBlock {
    ocb: usize,
    load_dim: usize,
}

#[derive(Debug, Clone, Copy)]
struct BcastChunk {
    pixel: usize,
    bcast_dim: usize,
}

#[derive(Debug, Clone, Copy)]
struct ReduceChunk {
    icb: usize,
    reduce_dim: usize,
    flags: u32,
}

/// Base pointers of one partition.
struct PartitionPtrs {
    src: *const u8,
    weights: *const i8,
    bias: *const u8,
    scales: *const f32,
    dst: *mut u8,
    acc: *mut i32,
    pixel_start: usize,
}

/// Runs a compiled kernel over whole tensors.
#[derive(Debug)]
pub struct ConvDriver {
    kernel: Arc<CompiledKernel>,
    scales: Vec<f32>,
}

impl ConvDriver {
    /// `attr` must be the attributes the kernel was compiled with.
    pub fn new(kernel: Arc<CompiledKernel>, attr: &PrimitiveAttr) -> ConvResult<Self> {
        let plan = kernel.plan();
        let expected = if plan.is_oc_scale { plan.oc } else { 1 };
        if attr.output_scales.scales.len() != expected {
            return Err(ConvError::InvalidBuffer(format!(
                "{} output scales, kernel expects {expected}",
                attr.output_scales.scales.len()
            )));
        }
        Ok(ConvDriver { kernel, scales: attr.output_scales.scales.clone() })
    }

    pub fn kernel(&self) -> &Arc<CompiledKernel> {
        &self.kernel
    }

    /// Broadcast partitions, in destination-row order.
    pub fn partitions(&self) -> Vec<Partition> {
        let p = self.kernel.plan();
        let work_amount = p.mb * p.ngroups * p.nb_bcast;
        let nparts = (p.nthreads / p.load_grp_count).max(1);
        (0..nparts)
            .map(|i| {
                let (work_start, work_end) = balance211(work_amount, nparts, i);
                Partition {
                    work_start,
                    work_end,
                    pixel_start: work_to_pixel(p, work_start),
                    pixel_end: work_to_pixel(p, work_end),
                }
            })
            .filter(|part| part.work_start < part.work_end)
            .collect()
    }

    /// Run the convolution on the calling thread.
    ///
    /// `src` is NHWC u8, `weights` packed `OIhw4i16o4i` (see
    /// [`crate::weights::pack_weights`]), `dst` NHWC. With a sum post-op
    /// `dst` also holds the residual on entry.
    pub fn execute<D: Element>(
        &self,
        src: &[u8],
        weights: &[i8],
        bias: Option<BiasData<'_>>,
        dst: &mut [D],
    ) -> ConvResult<()> {
        self.check_buffers(src, weights, bias, dst)?;
        let parts = self.partitions();
        log::debug!("int8 1x1 conv: {} partitions (sequential)", parts.len());
        for (part, rows) in parts.iter().zip(self.split_rows(&parts, dst)) {
            self.run_partition(part, src, weights, bias, rows);
        }
        Ok(())
    }

    /// Run the convolution with one rayon task per partition.
    pub fn execute_parallel<D: Element>(
        &self,
        src: &[u8],
        weights: &[i8],
        bias: Option<BiasData<'_>>,
        dst: &mut [D],
    ) -> ConvResult<()> {
        self.check_buffers(src, weights, bias, dst)?;
        let parts = self.partitions();
        log::debug!("int8 1x1 conv: {} partitions (parallel)", parts.len());
        let rows = self.split_rows(&parts, dst);
        parts
            .par_iter()
            .zip(rows.into_par_iter())
            .for_each(|(part, rows)| self.run_partition(part, src, weights, bias, rows));
        Ok(())
    }

    fn check_buffers<D: Element>(
        &self,
        src: &[u8],
        weights: &[i8],
        bias: Option<BiasData<'_>>,
        dst: &[D],
    ) -> ConvResult<()> {
        let p = self.kernel.plan();
        let expect = |what: &str, got: usize, want: usize| -> ConvResult<()> {
            if got == want {
                Ok(())
            } else {
                Err(ConvError::InvalidBuffer(format!("{what} holds {got} elements, expected {want}")))
            }
        };
        expect("src", src.len(), p.mb * p.is * p.ic)?;
        expect("weights", weights.len(), p.oc * p.ic)?;
        expect("dst", dst.len(), p.mb * p.os * p.oc)?;
        if D::DATA_TYPE != p.dst_dt {
            return Err(ConvError::InvalidBuffer(format!(
                "dst is {}, kernel stores {}",
                D::DATA_TYPE,
                p.dst_dt
            )));
        }
        match (bias, p.bias_dt) {
            (None, None) => Ok(()),
            (Some(b), Some(dt)) if b.data_type() == dt => expect("bias", b.len(), p.oc),
            (Some(b), want) => Err(ConvError::InvalidBuffer(format!(
                "bias is {}, kernel expects {want:?}",
                b.data_type()
            ))),
            (None, Some(dt)) => Err(ConvError::InvalidBuffer(format!("missing {dt} bias"))),
        }
    }

    fn split_rows<'d, D>(&self, parts: &[Partition], dst: &'d mut [D]) -> Vec<&'d mut [D]> {
        let oc = self.kernel.plan().oc;
        let mut rest = dst;
        let mut out = Vec::with_capacity(parts.len());
        for part in parts {
            let (rows, tail) = std::mem::take(&mut rest).split_at_mut((part.pixel_end - part.pixel_start) * oc);
            out.push(rows);
            rest = tail;
        }
        out
    }

    fn run_partition<D: Element>(
        &self,
        part: &Partition,
        src: &[u8],
        weights: &[i8],
        bias: Option<BiasData<'_>>,
        rows: &mut [D],
    ) {
        let p = self.kernel.plan();
        let npix = part.pixel_end - part.pixel_start;
        let mut scratch = if p.nb_reduce_blocking < p.nb_reduce { vec![0i32; npix * p.oc] } else { Vec::new() };

        let ptrs = PartitionPtrs {
            src: src.as_ptr(),
            weights: weights.as_ptr(),
            bias: bias.map_or(std::ptr::null(), |b| b.as_byte_ptr()),
            scales: self.scales.as_ptr(),
            dst: rows.as_mut_ptr() as *mut u8,
            acc: if scratch.is_empty() { std::ptr::null_mut() } else { scratch.as_mut_ptr() },
            pixel_start: part.pixel_start,
        };

        let chunks = bcast_chunks(p, part);
        let reduces = reduce_chunks(p);
        for grp in 0..p.load_grp_count {
            let loads = load_blocks(p, grp);
            if loads.is_empty() {
                continue;
            }
            // SAFETY: every block lies inside this partition's rows and the
            // buffers checked by `check_buffers`.
            let invoke = |l: &LoadBlock, b: &BcastChunk, r: &ReduceChunk| unsafe {
                self.call_block(&ptrs, l, b, r);
            };
            match p.loop_order {
                LoopOrder::Lbr => {
                    for l in &loads {
                        for b in &chunks {
                            for r in &reduces {
                                invoke(l, b, r);
                            }
                        }
                    }
                }
                LoopOrder::Blr => {
                    for b in &chunks {
                        for l in &loads {
                            for r in &reduces {
                                invoke(l, b, r);
                            }
                        }
                    }
                }
                LoopOrder::Rlb => {
                    for r in &reduces {
                        for l in &loads {
                            for b in &chunks {
                                invoke(l, b, r);
                            }
                        }
                    }
                }
                LoopOrder::Rbl => {
                    for r in &reduces {
                        for b in &chunks {
                            for l in &loads {
                                invoke(l, b, r);
                            }
                        }
                    }
                }
            }
        }
        log::trace!(
            "partition pixels {}..{}: {} chunks x {} reduce steps",
            part.pixel_start,
            part.pixel_end,
            chunks.len(),
            reduces.len()
        );
    }

    unsafe fn call_block(&self, ptrs: &PartitionPtrs, l: &LoadBlock, b: &BcastChunk, r: &ReduceChunk) {
        let p = self.kernel.plan();
        let local = b.pixel - ptrs.pixel_start;
        let oc0 = l.ocb * p.load_block;
        let args = KernelCallArgs {
            load_data: ptrs.weights.wrapping_add(l.ocb * p.load_loop_load_step + r.icb * p.reduce_loop_load_step),
            bcast_data: ptrs.src.wrapping_add((b.pixel * p.ic + r.icb * p.reduce_block) * p.typesize_in),
            output_data: ptrs.dst.wrapping_add((local * p.oc + oc0) * p.typesize_out),
            bias_data: ptrs.bias.wrapping_add(oc0 * p.typesize_bia),
            scales: ptrs.scales.wrapping_add(if p.is_oc_scale { oc0 } else { 0 }),
            acc_s32: ptrs.acc.wrapping_add(local * p.oc + oc0),
            load_dim: l.load_dim,
            bcast_dim: b.bcast_dim,
            reduce_dim: r.reduce_dim,
            reduce_pos_flag: r.flags,
        };
        self.kernel.call(&args);
    }
}

/// First destination pixel (over the whole batch) of broadcast work unit
/// `iwork`.
fn work_to_pixel(p: &BlockingPlan, iwork: usize) -> usize {
    let n = iwork / p.nb_bcast;
    let osb = iwork % p.nb_bcast;
    n * p.os + (osb * p.bcast_block).min(p.os)
}

fn bcast_chunks(p: &BlockingPlan, part: &Partition) -> Vec<BcastChunk> {
    let mut out = Vec::new();
    let mut iwork = part.work_start;
    while iwork < part.work_end {
        let osb = iwork % p.nb_bcast;
        let n_steps = step(p.nb_bcast_blocking, p.nb_bcast - osb, p.nb_bcast_blocking_max).min(part.work_end - iwork);
        let os_start = osb * p.bcast_block;
        out.push(BcastChunk {
            pixel: work_to_pixel(p, iwork),
            bcast_dim: (n_steps * p.bcast_block).min(p.os - os_start),
        });
        iwork += n_steps;
    }
    out
}

fn reduce_chunks(p: &BlockingPlan) -> Vec<ReduceChunk> {
    (0..p.nb_reduce)
        .step_by(p.nb_reduce_blocking)
        .map(|icb| {
            let mut flags = 0;
            if icb == 0 {
                flags |= FLAG_REDUCE_FIRST;
            }
            if icb + p.nb_reduce_blocking >= p.nb_reduce {
                flags |= FLAG_REDUCE_LAST;
            }
            ReduceChunk {
                icb,
                reduce_dim: (p.nb_reduce_blocking * p.reduce_block).min(p.ic - icb * p.reduce_block),
                flags,
            }
        })
        .collect()
}

fn load_blocks(p: &BlockingPlan, grp: usize) -> Vec<LoadBlock> {
    let (ocb_start, ocb_end) = balance211(p.nb_load, p.load_grp_count, grp);
    let mut out = Vec::new();
    let mut ocb = ocb_start;
    while ocb < ocb_end {
        let n = step(p.nb_load_blocking, ocb_end - ocb, p.nb_load_blocking_max);
        out.push(LoadBlock { ocb, load_dim: (n * SIMD_W).min((ocb_end - ocb) * SIMD_W) });
        ocb += n;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_balance211_covers_all() {
        for n in [0, 1, 7, 16, 33] {
            for team in 1..6 {
                let mut next = 0;
                for tid in 0..team {
                    let (s, e) = balance211(n, team, tid);
                    assert_eq!(s, next, "n={n} team={team} tid={tid}");
                    assert!(e >= s);
                    next = e;
                }
                assert_eq!(next, n);
            }
        }
        assert_eq!(balance211(7, 3, 0), (0, 3));
        assert_eq!(balance211(7, 3, 1), (3, 5));
        assert_eq!(balance211(7, 3, 2), (5, 7));
    }

    #[test]
    fn test_step_takes_short_remainder() {
        assert_eq!(step(2, 5, 3), 2);
        assert_eq!(step(2, 2, 3), 2);
        assert_eq!(step(2, 1, 3), 1);
        assert_eq!(step(4, 3, 4), 3);
    }
}
