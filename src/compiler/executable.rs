//! CompiledKernel: a generated kernel body plus its invocation record.
//!
//! The kernel is resolved once per configuration (dot-product backend,
//! store-stage table, load-group widths) and then invoked many times by an
//! external scheduler, each call covering one rectangular block of
//! (output channels × pixels × input channels).

use crate::compiler::codegen::epilogue::{self, StoreOp};
use crate::compiler::codegen::simd_ops::{DotProduct, EmulatedDot, NativeDot};
use crate::compiler::codegen::{algorithm, KernelConf};
use crate::compiler::planner::BlockingPlan;
use crate::dispatch::KernelVersion;

/// This call starts the reduction: accumulators start at zero.
pub const FLAG_REDUCE_FIRST: u32 = 1 << 0;
/// This call ends the reduction: run the store stage.
pub const FLAG_REDUCE_LAST: u32 = 1 << 1;

/// One kernel invocation.
///
/// Pointers are byte pointers into caller-owned buffers; the kernel neither
/// allocates nor keeps them past the call.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct KernelCallArgs {
    /// Packed weights at (first output block, first input block).
    pub load_data: *const i8,
    /// Source at (first pixel, first input channel).
    pub bcast_data: *const u8,
    /// Destination at (first pixel, first output channel).
    pub output_data: *mut u8,
    /// Bias at the first output channel; may be null without bias.
    pub bias_data: *const u8,
    /// Output scales at the first output channel (per-channel) or the
    /// single tensor-wide scale.
    pub scales: *const f32,
    /// i32 partial sums, indexed like `output_data`; unused when the
    /// call is both first and last.
    pub acc_s32: *mut i32,
    /// Output channels this call covers.
    pub load_dim: usize,
    /// Pixels this call covers.
    pub bcast_dim: usize,
    /// Input channels this call reduces over.
    pub reduce_dim: usize,
    /// `FLAG_REDUCE_FIRST | FLAG_REDUCE_LAST` bits.
    pub reduce_pos_flag: u32,
}

impl Default for KernelCallArgs {
    fn default() -> Self {
        KernelCallArgs {
            load_data: std::ptr::null(),
            bcast_data: std::ptr::null(),
            output_data: std::ptr::null_mut(),
            bias_data: std::ptr::null(),
            scales: std::ptr::null(),
            acc_s32: std::ptr::null_mut(),
            load_dim: 0,
            bcast_dim: 0,
            reduce_dim: 0,
            reduce_pos_flag: FLAG_REDUCE_FIRST | FLAG_REDUCE_LAST,
        }
    }
}

type KernelEntry = unsafe fn(&KernelConf, &KernelCallArgs);

/// A kernel specialized for one [`BlockingPlan`] and post-op chain.
///
/// Immutable after generation; share it across threads behind an `Arc`.
pub struct CompiledKernel {
    conf: KernelConf,
    entry: KernelEntry,
    /// Hash of the configuration the kernel was generated for.
    pub config_hash: u64,
}

impl CompiledKernel {
    pub(crate) fn new(conf: KernelConf, config_hash: u64) -> Self {
        let entry: KernelEntry = match conf.plan.version {
            KernelVersion::Vnni => algorithm::run::<NativeDot>,
            KernelVersion::Avx512Core => algorithm::run::<EmulatedDot>,
        };
        log::debug!(
            "int8 1x1 kernel: {} ur={} widths<={} store={:?}",
            match conf.plan.version {
                KernelVersion::Vnni => NativeDot::NAME,
                KernelVersion::Avx512Core => EmulatedDot::NAME,
            },
            conf.plan.ur,
            conf.max_load_width,
            conf.table,
        );
        CompiledKernel { conf, entry, config_hash }
    }

    #[inline]
    pub fn plan(&self) -> &BlockingPlan {
        &self.conf.plan
    }

    #[inline]
    pub fn conf(&self) -> &KernelConf {
        &self.conf
    }

    /// The store stage this kernel runs, in order.
    pub fn store_sequence(&self) -> Vec<StoreOp> {
        epilogue::store_sequence(&self.conf.table, &self.conf.epilogue, self.conf.plan.is_oc_scale)
    }

    /// Execute one call.
    ///
    /// # Safety
    /// - `load_data` covers `ceil(load_dim/16)` output blocks of the packed
    ///   weights from the call's input block on, at the plan's `ic` stride.
    /// - `bcast_data` covers `bcast_dim` pixel rows of `ic` channels.
    /// - `output_data` (and `acc_s32` when the call is not both first and
    ///   last) cover `bcast_dim` rows of `oc` elements from the call's first
    ///   channel, for `load_dim` channels.
    /// - `bias_data` covers `load_dim` elements when the plan has bias;
    ///   `scales` covers `load_dim` values when per-channel, else one.
    /// - `reduce_dim` is a positive multiple of 16.
    /// - No other thread writes the covered output or partial-sum region
    ///   during the call.
    #[inline]
    pub unsafe fn call(&self, args: &KernelCallArgs) {
        debug_assert!(args.reduce_dim > 0 && args.reduce_dim % self.conf.plan.reduce_loop_unroll == 0);
        (self.entry)(&self.conf, args);
    }
}

impl std::fmt::Debug for CompiledKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledKernel")
            .field("plan", &format_args!("{}", self.conf.plan))
            .field("epilogue", &self.conf.epilogue)
            .field("config_hash", &format_args!("{:016x}", self.config_hash))
            .finish()
    }
}
