//! Kernel generation: specializes the loop nest for one blocking plan.
//!
//! - `simd_ops`: lane types and the `DotProduct` backends
//! - `algorithm`: load ladder, broadcast tiles, reduce loop
//! - `epilogue`: dtype table and the store stage

pub mod algorithm;
pub mod epilogue;
pub mod simd_ops;

use crate::compiler::executable::CompiledKernel;
use crate::compiler::fusion::EpiloguePlan;
use crate::compiler::planner::BlockingPlan;
use crate::kernel_types::PrimitiveAttr;

use self::epilogue::StoreTable;

/// Everything the kernel body reads besides the call record.
#[derive(Debug, Clone, Copy)]
pub struct KernelConf {
    pub plan: BlockingPlan,
    pub epilogue: EpiloguePlan,
    pub table: StoreTable,
    /// Widest load group the ladder dispatches.
    pub max_load_width: usize,
}

/// Builds [`CompiledKernel`]s.
pub struct KernelGenerator;

impl KernelGenerator {
    /// Resolve the store stage and load-group widths for `plan`.
    ///
    /// `attr` must be the attributes `plan` was validated with.
    pub fn generate(plan: &BlockingPlan, attr: &PrimitiveAttr, config_hash: u64) -> CompiledKernel {
        assert!(plan.ur <= algorithm::MAX_UR, "ur {} exceeds the register tile", plan.ur);
        let epilogue = EpiloguePlan::resolve(&attr.post_ops, plan.with_eltwise, plan.dst_dt);
        let table = StoreTable::resolve(plan.bias_dt, plan.dst_dt, attr.round_mode);
        let conf = KernelConf {
            plan: *plan,
            epilogue,
            table,
            max_load_width: algorithm::max_load_loop_blk(plan.ur),
        };
        CompiledKernel::new(conf, config_hash)
    }
}
