//! Kernel loop nest: load-group dispatch, broadcast tiling, reduce loop.
//!
//! ```text
//! for group in LoadLadder(load_dim)        // 1..=W blocks of 16 channels
//!   for tile in BcastTiles(bcast_dim, ur)  // full tiles, then one tail
//!     init accumulators (zero | scratch)
//!     for chunk in reduce_dim / unroll
//!       for quad in chunk / 4
//!         acc[ur][W] += src[ur] · wei[W]
//!     store (scratch | store stage)
//! ```
//!
//! The schedules are plain iterators so they can be inspected without
//! running the kernel.

use crate::compiler::executable::{KernelCallArgs, FLAG_REDUCE_FIRST, FLAG_REDUCE_LAST};
use crate::compiler::planner::div_up;
use crate::kernel_types::SIMD_W;

use super::epilogue::{self, BlockOperands};
use super::simd_ops::{DotProduct, F32x16, I32x16};
use super::KernelConf;

/// Broadcast unroll thresholds that bound the load-group width: a kernel
/// with `ur <= UR_CASES[i]` may process `UR_CASES.len() - i` blocks at once.
pub const UR_CASES: [usize; 6] = [2, 5, 6, 9, 14, 32];

/// Upper bound of [`max_load_loop_blk`].
pub const MAX_LOAD_LOOP_BLK: usize = UR_CASES.len();

/// Upper bound on `ur` a kernel accepts.
pub const MAX_UR: usize = 32;

/// Widest load group a kernel with unroll `ur` dispatches.
pub fn max_load_loop_blk(ur: usize) -> usize {
    UR_CASES
        .iter()
        .position(|&c| ur <= c)
        .map_or(1, |idx| UR_CASES.len() - idx)
}

// ── Load-group ladder ───────────────────────────────────────────────────────

/// One load group: `blocks` blocks of 16 output channels covering
/// `channels` channels; the last block is partial when
/// `channels < 16 * blocks`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadStep {
    pub blocks: usize,
    pub channels: usize,
}

/// Dispatch ladder over the load dimension.
///
/// Enters at the narrowest width that covers all the work, otherwise the
/// widest. After each group it repeats the width while a full group
/// remains, steps down one width when exactly two narrower groups remain,
/// jumps to an exact-fit width, drops straight to single blocks once at
/// most one block remains, and otherwise steps down by one.
#[derive(Debug, Clone)]
pub struct LoadLadder {
    work: usize,
    label: usize,
    max_width: usize,
    started: bool,
    done: bool,
}

impl LoadLadder {
    pub fn new(load_dim: usize, max_width: usize) -> Self {
        LoadLadder { work: load_dim, label: 0, max_width: max_width.max(1), started: false, done: false }
    }

    fn entry_label(&self) -> usize {
        (0..self.max_width)
            .find(|&l| self.work <= SIMD_W * (l + 1))
            .unwrap_or(self.max_width - 1)
    }

    fn next_label(&self) -> Option<usize> {
        let l = self.label;
        let work = self.work;
        if l >= 2 && work == 2 * l * SIMD_W {
            return Some(l - 1);
        }
        if work >= (l + 1) * SIMD_W {
            return Some(l);
        }
        if let Some(idx) = (1..l).rev().find(|&idx| work == SIMD_W * (idx + 1)) {
            return Some(idx);
        }
        if l >= 2 && work <= SIMD_W {
            return Some(0);
        }
        if l == 0 {
            // single-block variant: the tail takes any residue
            return (work > 0).then_some(0);
        }
        Some(l - 1)
    }
}

impl Iterator for LoadLadder {
    type Item = LoadStep;

    fn next(&mut self) -> Option<LoadStep> {
        if self.done {
            return None;
        }
        let label = if self.started {
            self.next_label()
        } else {
            self.started = true;
            Some(self.entry_label())
        };
        match label {
            Some(l) if self.work > 0 => {
                self.label = l;
                let blocks = l + 1;
                let channels = self.work.min(blocks * SIMD_W);
                self.work -= channels;
                Some(LoadStep { blocks, channels })
            }
            _ => {
                self.done = true;
                None
            }
        }
    }
}

/// The load-group sequence for `load_dim` channels at unroll `ur`.
pub fn load_schedule(load_dim: usize, ur: usize) -> Vec<LoadStep> {
    LoadLadder::new(load_dim, max_load_loop_blk(ur)).collect()
}

// ── Broadcast tiles ─────────────────────────────────────────────────────────

/// A run of `width` consecutive pixels starting `offset` pixels into the
/// call's broadcast range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BcastTile {
    pub offset: usize,
    pub width: usize,
}

/// Full `ur`-pixel tiles, then a single tail tile of the remainder.
#[derive(Debug, Clone)]
pub struct BcastTiles {
    offset: usize,
    remaining: usize,
    ur: usize,
}

impl BcastTiles {
    pub fn new(bcast_dim: usize, ur: usize) -> Self {
        BcastTiles { offset: 0, remaining: bcast_dim, ur: ur.max(1) }
    }
}

impl Iterator for BcastTiles {
    type Item = BcastTile;

    fn next(&mut self) -> Option<BcastTile> {
        if self.remaining == 0 {
            return None;
        }
        let width = self.remaining.min(self.ur);
        let tile = BcastTile { offset: self.offset, width };
        self.offset += width;
        self.remaining -= width;
        Some(tile)
    }
}

/// The broadcast tiling of a call covering `bcast_dim` pixels.
pub fn bcast_schedule(bcast_dim: usize, ur: usize) -> Vec<BcastTile> {
    BcastTiles::new(bcast_dim, ur).collect()
}

// ── Loop nest ───────────────────────────────────────────────────────────────

/// Pointers of one load group, advanced group by group.
#[derive(Clone, Copy)]
struct GroupPtrs {
    bcast: *const u8,
    load: *const i8,
    output: *mut u8,
    acc: *mut i32,
    bias: *const u8,
    scales: *const f32,
}

/// Execute one call.
///
/// # Safety
/// See [`crate::compiler::executable::CompiledKernel::call`].
pub(crate) unsafe fn run<D: DotProduct>(conf: &KernelConf, args: &KernelCallArgs) {
    let plan = &conf.plan;
    let mut g = GroupPtrs {
        bcast: args.bcast_data,
        load: args.load_data,
        output: args.output_data,
        acc: args.acc_s32,
        bias: args.bias_data,
        scales: args.scales,
    };
    let scale_step = if plan.is_oc_scale { SIMD_W } else { 0 };

    for step in LoadLadder::new(args.load_dim, conf.max_load_width) {
        // blocks past the last channel hold no work
        match div_up(step.channels, SIMD_W) {
            1 => bcast_loop::<D, 1>(conf, args, &g, step),
            2 => bcast_loop::<D, 2>(conf, args, &g, step),
            3 => bcast_loop::<D, 3>(conf, args, &g, step),
            4 => bcast_loop::<D, 4>(conf, args, &g, step),
            5 => bcast_loop::<D, 5>(conf, args, &g, step),
            _ => bcast_loop::<D, 6>(conf, args, &g, step),
        }
        let b = step.blocks;
        g.load = g.load.wrapping_add(b * plan.load_loop_load_step);
        g.output = g.output.wrapping_add(b * plan.load_loop_iter_step * plan.typesize_out);
        g.acc = g.acc.wrapping_add(b * plan.load_loop_iter_step);
        g.bias = g.bias.wrapping_add(b * plan.load_loop_iter_step * plan.typesize_bia);
        g.scales = g.scales.wrapping_add(b * scale_step);
    }
}

#[inline(always)]
unsafe fn bcast_loop<D: DotProduct, const W: usize>(
    conf: &KernelConf,
    args: &KernelCallArgs,
    g: &GroupPtrs,
    step: LoadStep,
) {
    let plan = &conf.plan;
    let lanes: [usize; W] =
        std::array::from_fn(|i| step.channels.saturating_sub(i * SIMD_W).min(SIMD_W));

    for tile in BcastTiles::new(args.bcast_dim, plan.ur) {
        let t = GroupPtrs {
            bcast: g.bcast.wrapping_add(tile.offset * plan.reduce_dim * plan.typesize_in),
            output: g.output.wrapping_add(tile.offset * plan.load_dim * plan.typesize_out),
            acc: g.acc.wrapping_add(tile.offset * plan.load_dim),
            ..*g
        };
        reduce_loop::<D, W>(conf, args, &t, tile.width, &lanes);
    }
}

#[inline(always)]
unsafe fn reduce_loop<D: DotProduct, const W: usize>(
    conf: &KernelConf,
    args: &KernelCallArgs,
    t: &GroupPtrs,
    ur: usize,
    lanes: &[usize; W],
) {
    let plan = &conf.plan;
    let mut acc = [[I32x16::ZERO; W]; MAX_UR];

    if args.reduce_pos_flag & FLAG_REDUCE_FIRST == 0 {
        for (i_ur, row) in acc.iter_mut().enumerate().take(ur) {
            for (i_load, a) in row.iter_mut().enumerate() {
                let p = t.acc.wrapping_add(plan.load_dim * i_ur + i_load * SIMD_W);
                *a = I32x16::load_partial(p, lanes[i_load]);
            }
        }
    }

    let unroll = plan.reduce_loop_unroll;
    let chunks = div_up(args.reduce_dim, unroll).max(1);
    let mut bcast = t.bcast;
    let mut load = t.load;
    for _ in 0..chunks {
        for i_reduce in (0..unroll).step_by(4) {
            let wei: [[i8; 4 * SIMD_W]; W] = std::array::from_fn(|i_load| {
                let off = (i_load * plan.reduce_dim + i_reduce) * plan.load_block;
                (load.wrapping_add(off) as *const [i8; 4 * SIMD_W]).read_unaligned()
            });
            for (i_ur, row) in acc.iter_mut().enumerate().take(ur) {
                let off = plan.reduce_dim * i_ur + i_reduce;
                let quad = (bcast.wrapping_add(off) as *const [u8; 4]).read_unaligned();
                for (a, w) in row.iter_mut().zip(wei.iter()) {
                    D::dot4(a, quad, w);
                }
            }
        }
        bcast = bcast.wrapping_add(plan.reduce_loop_bcast_step);
        load = load.wrapping_add(plan.reduce_loop_load_step);
    }

    if args.reduce_pos_flag & FLAG_REDUCE_LAST == 0 {
        for (i_ur, row) in acc.iter().enumerate().take(ur) {
            for (i_load, a) in row.iter().enumerate() {
                let p = t.acc.wrapping_add(plan.load_dim * i_ur + i_load * SIMD_W);
                a.store_partial(p, lanes[i_load]);
            }
        }
        return;
    }

    for i_load in 0..W {
        let n = lanes[i_load];
        if n == 0 {
            continue;
        }
        let bias = conf.table.load_bias.map(|widen| {
            widen(t.bias.wrapping_add(i_load * SIMD_W * plan.typesize_bia), n)
        });
        let scale = if plan.is_oc_scale {
            F32x16::load_partial(t.scales.wrapping_add(i_load * SIMD_W), n, 0.0)
        } else {
            F32x16::splat(*t.scales)
        };
        let ops = BlockOperands { bias, scale, lanes: n };
        for (i_ur, row) in acc.iter().enumerate().take(ur) {
            let out = t
                .output
                .wrapping_add(plan.typesize_out * (plan.load_dim * i_ur + i_load * SIMD_W));
            epilogue::apply(&conf.table, &conf.epilogue, &row[i_load], &ops, out);
        }
    }
}
