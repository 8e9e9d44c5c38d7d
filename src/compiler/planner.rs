//! Blocking planner: turns a validated configuration into a
//! [`BlockingPlan`].
//!
//! Decides, once per configuration, everything the kernel and the external
//! scheduler need: the broadcast unroll `ur`, cache-aware blocking along
//! the load/broadcast/reduce dimensions, the loop order, the number of
//! thread groups splitting the load dimension, and the byte strides of
//! every loop step.

use crate::config::PlannerConfig;
use crate::dispatch::KernelVersion;
use crate::kernel_types::SIMD_W;
use crate::types::DataType;
use crate::validation::ValidatedConf;

/// Spatial sizes up to this count as small (7×7).
pub const SMALL_SPATIAL: usize = 7 * 7;
/// Reduce dimensions from this size on are split.
pub const BIG_REDUCE_DIM: usize = 1024;
/// Smallest broadcast unroll the register budget is searched down to.
pub const MIN_UR: usize = 6;

/// Nesting of the scheduler's load (l), broadcast (b) and reduce (r) loops,
/// outermost first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoopOrder {
    Lbr,
    Blr,
    Rlb,
    Rbl,
}

impl LoopOrder {
    #[inline]
    pub fn reduce_outer(self) -> bool {
        matches!(self, LoopOrder::Rlb | LoopOrder::Rbl)
    }
}

/// Complete, immutable blocking plan for one configuration.
///
/// Dimension naming follows the 1×1 convolution as a GEMM:
/// load = output channels, broadcast = spatial, reduce = input channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockingPlan {
    pub version: KernelVersion,
    pub nthreads: usize,

    // ── problem ──
    pub mb: usize,
    pub ngroups: usize,
    pub ic: usize,
    pub oc: usize,
    pub oh: usize,
    pub ow: usize,
    pub os: usize,
    pub is: usize,
    pub with_bias: bool,
    pub with_eltwise: bool,
    pub bias_dt: Option<DataType>,
    pub dst_dt: DataType,
    pub is_oc_scale: bool,

    // ── element sizes (bytes) ──
    pub typesize_in: usize,
    pub typesize_out: usize,
    pub typesize_acc: usize,
    pub typesize_bia: usize,

    // ── register tiling ──
    pub ur: usize,
    pub ur_tail: usize,
    pub reduce_dim: usize,
    pub reduce_block: usize,
    pub load_dim: usize,
    pub load_block: usize,
    pub bcast_dim: usize,
    pub bcast_block: usize,
    pub reduce_loop_unroll: usize,

    // ── loop steps (bytes) ──
    pub reduce_loop_bcast_step: usize,
    pub reduce_loop_load_step: usize,
    pub bcast_loop_output_step: usize,
    pub bcast_loop_bcast_step: usize,
    pub load_loop_load_step: usize,
    pub load_loop_iter_step: usize,

    // ── cache / thread blocking ──
    pub loop_order: LoopOrder,
    pub load_grp_count: usize,
    pub load_blocking: usize,
    pub load_blocking_max: usize,
    pub bcast_blocking: usize,
    pub bcast_blocking_max: usize,
    pub reduce_blocking: usize,
    pub reduce_blocking_max: usize,

    pub nb_bcast_blocking: usize,
    pub nb_bcast_blocking_max: usize,
    pub nb_load_blocking: usize,
    pub nb_load_blocking_max: usize,
    pub nb_reduce_blocking: usize,
    pub nb_reduce_blocking_max: usize,

    pub nb_bcast: usize,
    pub nb_load: usize,
    pub nb_reduce: usize,
}

#[inline]
pub fn div_up(a: usize, b: usize) -> usize {
    (a + b - 1) / b
}

#[inline]
pub fn rnd_up(a: usize, b: usize) -> usize {
    div_up(a, b) * b
}

#[inline]
pub fn rnd_dn(a: usize, b: usize) -> usize {
    (a / b) * b
}

/// Divider of `value` in `[min_divider, max_divider]` that wastes the
/// smallest fraction of a rounded-up chunk count.
///
/// Scans from the largest candidate down; `find_max` keeps the largest
/// among equal losses, otherwise the smallest.
pub fn best_divider(value: usize, min_divider: usize, max_divider: usize, find_max: bool) -> usize {
    let max_divider = max_divider.min(value).max(1);
    let min_divider = min_divider.min(max_divider).max(1);

    let loss_ratio = |total: usize, chunk: usize| -> f32 {
        let r = rnd_up(total, chunk);
        (r - total) as f32 / r as f32
    };

    let mut min_loss = f32::MAX;
    let mut x_divider = max_divider;
    for divider in (min_divider..=max_divider).rev() {
        let loss = loss_ratio(value, divider);
        if (find_max && loss < min_loss) || (!find_max && loss <= min_loss) {
            min_loss = loss;
            x_divider = divider;
        }
    }
    x_divider
}

/// Broadcast unroll for an `oh`-row output of `os` pixels with a register
/// budget of `max_regs`.
///
/// Largest exact divisor in `[MIN_UR, max_regs]` of the divisor target
/// (`oh` on big images, `os` otherwise); failing that, the candidate
/// leaving the smallest `os` tail, the larger one on ties. Images smaller
/// than `MIN_UR` pixels are a single tile.
pub fn select_ur(oh: usize, os: usize, max_regs: usize) -> usize {
    let target = if os > SMALL_SPATIAL { oh } else { os };
    if let Some(ur) = (MIN_UR..=max_regs).rev().find(|ur| target % ur == 0) {
        return ur;
    }
    if os < MIN_UR {
        return os.max(1);
    }

    let mut ur = max_regs;
    let mut tail = os % max_regs;
    for candidate in (MIN_UR..max_regs).rev() {
        let t = os % candidate;
        if t < tail {
            ur = candidate;
            tail = t;
        }
    }
    ur
}

impl BlockingPlan {
    /// Plan a validated configuration.
    ///
    /// # Panics
    /// If the derived blocking breaks a divisibility invariant; that is a
    /// planner defect, not a property of the input.
    pub fn build(conf: &ValidatedConf, cfg: &PlannerConfig) -> Self {
        let s = conf.desc.shape;
        let nthreads = cfg.nthreads.max(1);
        let version = conf.version;

        // Element count, not bytes: matches the planner's cache model.
        let l2_size = cfg.l2_bytes / std::mem::size_of::<i32>();
        let l2_capacity = (l2_size * 3) / 4;

        let os = s.os();
        let is = s.is();
        let ur = select_ur(s.oh, os, version.max_regs());

        let typesize_in = conf.desc.dtypes.src.size_bytes();
        let typesize_out = conf.dst_dt.size_bytes();
        let typesize_acc = std::mem::size_of::<i32>();
        let typesize_bia = conf.bias_dt.map_or(0, DataType::size_bytes);

        let reduce_dim = s.ic;
        let reduce_block = SIMD_W;
        let load_dim = s.oc;
        let load_block = SIMD_W;
        let bcast_dim = is;
        let bcast_block = ur;

        let reduce_loop_unroll = reduce_block;
        let reduce_loop_bcast_step = reduce_loop_unroll * typesize_in;
        let reduce_loop_load_step = reduce_loop_unroll * load_block * typesize_in;
        let bcast_loop_output_step = ur * load_dim * typesize_out;
        let bcast_loop_bcast_step = ur * reduce_dim * typesize_in;
        let load_loop_load_step = reduce_dim * load_block * typesize_in;
        let load_loop_iter_step = load_block;

        let mut loop_order = if cfg.reduce_src { LoopOrder::Blr } else { LoopOrder::Lbr };

        let nb_bcast = div_up(bcast_dim, bcast_block);
        let nb_reduce = div_up(reduce_dim, reduce_block);
        let work_units = s.mb * s.ngroups * nb_bcast;

        let mut reduce_blocking = nb_reduce;
        if bcast_dim <= SMALL_SPATIAL && reduce_dim >= BIG_REDUCE_DIM {
            reduce_blocking = 64;
        } else if bcast_dim > SMALL_SPATIAL && reduce_dim >= BIG_REDUCE_DIM {
            reduce_blocking = 16;
        }
        reduce_blocking = best_divider(nb_reduce, 1, reduce_blocking, true) * reduce_block;

        if reduce_blocking < reduce_dim {
            loop_order = if cfg.reduce_src { LoopOrder::Rbl } else { LoopOrder::Rlb };
        }

        let mut load_blocking = load_dim;

        let mut load_grp_count = div_up(nthreads, work_units);
        load_grp_count = best_divider(nthreads, load_grp_count, 2 * load_grp_count, false);

        if bcast_dim <= 64 && load_dim * reduce_dim >= l2_size {
            load_grp_count = load_grp_count.max(4);
        } else if bcast_dim <= SMALL_SPATIAL
            && s.mb <= nthreads
            && load_dim > 512
            && load_dim / reduce_dim >= 4
        {
            load_grp_count = load_grp_count.max(2);
            load_blocking = load_block;
        }

        let mut bcast_blocking = div_up(work_units, div_up(nthreads, load_grp_count)) * bcast_block;
        bcast_blocking = bcast_blocking.min(bcast_dim);
        bcast_blocking = rnd_up(bcast_blocking, bcast_block);

        let mut space_for_bcast = l2_capacity as i64
            - (2 * load_block * reduce_blocking) as i64
            - (ur * reduce_blocking) as i64
            - 3 * 1024;
        if reduce_dim * bcast_dim > l2_capacity {
            space_for_bcast /= 2;
        }
        let bcast_in_cache = (bcast_block as i64).max(space_for_bcast / reduce_blocking as i64) as usize;
        bcast_blocking = bcast_blocking.min(rnd_dn(bcast_in_cache, bcast_block));

        let load_blocking_max = load_blocking;
        let bcast_blocking_max = rnd_dn(bcast_blocking * 3 / 2, bcast_block);
        let reduce_blocking_max = reduce_blocking;

        let plan = BlockingPlan {
            version,
            nthreads,
            mb: s.mb,
            ngroups: s.ngroups,
            ic: s.ic,
            oc: s.oc,
            oh: s.oh,
            ow: s.ow,
            os,
            is,
            with_bias: conf.with_bias,
            with_eltwise: conf.with_eltwise,
            bias_dt: conf.bias_dt,
            dst_dt: conf.dst_dt,
            is_oc_scale: conf.is_oc_scale,
            typesize_in,
            typesize_out,
            typesize_acc,
            typesize_bia,
            ur,
            ur_tail: bcast_dim % ur,
            reduce_dim,
            reduce_block,
            load_dim,
            load_block,
            bcast_dim,
            bcast_block,
            reduce_loop_unroll,
            reduce_loop_bcast_step,
            reduce_loop_load_step,
            bcast_loop_output_step,
            bcast_loop_bcast_step,
            load_loop_load_step,
            load_loop_iter_step,
            loop_order,
            load_grp_count,
            load_blocking,
            load_blocking_max,
            bcast_blocking,
            bcast_blocking_max,
            reduce_blocking,
            reduce_blocking_max,
            nb_bcast_blocking: bcast_blocking / bcast_block,
            nb_bcast_blocking_max: bcast_blocking_max / bcast_block,
            nb_load_blocking: load_blocking / load_block,
            nb_load_blocking_max: load_blocking_max / load_block,
            nb_reduce_blocking: reduce_blocking / reduce_block,
            nb_reduce_blocking_max: reduce_blocking_max / reduce_block,
            nb_bcast,
            nb_load: div_up(load_dim, load_block),
            nb_reduce,
        };
        plan.check_invariants();
        log::debug!("int8 1x1 plan: {plan}");
        plan
    }

    /// Assert the divisibility contract between planner and kernel.
    pub fn check_invariants(&self) {
        assert!(self.ur > 0, "ur must be positive");
        assert!(self.load_blocking > 0 && self.load_blocking_max > 0);
        assert!(self.bcast_blocking > 0 && self.bcast_blocking_max > 0);
        assert!(self.reduce_blocking > 0 && self.reduce_blocking_max > 0);
        assert_eq!(self.load_blocking % self.load_block, 0, "load blocking");
        assert_eq!(self.load_blocking_max % self.load_block, 0, "load blocking max");
        assert_eq!(self.bcast_blocking % self.bcast_block, 0, "bcast blocking");
        assert_eq!(self.bcast_blocking_max % self.bcast_block, 0, "bcast blocking max");
        assert_eq!(self.reduce_blocking % self.reduce_block, 0, "reduce blocking");
        assert_eq!(self.reduce_blocking_max % self.reduce_block, 0, "reduce blocking max");
        assert_eq!(self.reduce_loop_unroll % 4, 0, "reduce unroll must cover whole quads");
        assert_eq!(self.reduce_dim % self.reduce_loop_unroll, 0, "reduce unroll must divide reduce dim");
        assert_eq!(self.bcast_block % self.ur, 0, "bcast block must be whole unrolls");
        assert_eq!(self.reduce_dim % self.reduce_block, 0, "reduce dim must be whole blocks");
        assert!(self.load_grp_count >= 1);
    }
}

impl std::fmt::Display for BlockingPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?} mb={} ic={} oc={} os={} | ur={} tail={} | blk l={} b={} r={} | grp={} order={:?}",
            self.version,
            self.mb,
            self.ic,
            self.oc,
            self.os,
            self.ur,
            self.ur_tail,
            self.load_blocking,
            self.bcast_blocking,
            self.reduce_blocking,
            self.load_grp_count,
            self.loop_order,
        )
    }
}
