//! int8-conv-kernels: u8 × s8 → s32 1×1 convolution kernels for 512-bit
//! vector CPUs.
//!
//! This crate provides:
//! - **Validation**: decides whether a convolution + attribute set can run
//!   on the int8 1×1 kernel, with a typed reason when it cannot
//! - **Blocking planner**: register unroll, cache blocking, loop order and
//!   thread grouping for one configuration
//! - **Kernel generation**: a body specialized per plan (native 4-way dot or
//!   emulated multiply-add chain) with fused bias, scales, residual sum,
//!   relu and requantization
//! - **Reference driver**: sequential and rayon-parallel scheduling of the
//!   kernel over whole tensors
//!
//! # Quick Start
//!
//! ```ignore
//! use int8_conv_kernels::{ConvCompiler, ConvDesc, ConvDriver, ConvShape, DataType, DtypeSet, PrimitiveAttr};
//!
//! let desc = ConvDesc::new(ConvShape::conv_1x1(1, 64, 64, 7, 7), DtypeSet::u8s8(None, DataType::S32));
//! let attr = PrimitiveAttr::default();
//! let kernel = ConvCompiler::new()?.compile(&desc, &attr)?;
//! ConvDriver::new(kernel, &attr)?.execute_parallel(&src, &packed, None, &mut dst)?;
//! ```

pub mod cache_params;
pub mod compiler;
pub mod config;
pub mod dispatch;
pub mod driver;
pub mod kernel_types;
pub mod types;
pub mod validation;
pub mod weights;

pub use compiler::codegen::algorithm::{bcast_schedule, load_schedule, max_load_loop_blk, BcastTile, LoadStep};
pub use compiler::codegen::epilogue::{requantize, StoreOp};
pub use compiler::fusion::{maybe_relu, post_ops_ok, ClampPosition, EpiloguePlan, SumMode};
pub use compiler::planner::{best_divider, select_ur};
pub use compiler::{
    compile, plan_or_reject, BlockingPlan, CompiledKernel, ConvCompiler, KernelCache, KernelCallArgs,
    KernelGenerator, LoopOrder, FLAG_REDUCE_FIRST, FLAG_REDUCE_LAST,
};
pub use config::{IsaOverride, PlannerConfig};
pub use dispatch::{cpu_caps, CpuCaps, KernelVersion};
pub use driver::{BiasData, ConvDriver, Element};
pub use kernel_types::{
    ConvDesc, ConvShape, DtypeSet, EltwiseAlg, Layouts, OutputScales, PostOp, PostOps, PrimitiveAttr, SIMD_W,
};
pub use types::{ConvError, ConvResult, DataType, MemoryFormat, RoundMode, Unsupported};
pub use validation::{validate, ValidatedConf};
pub use weights::pack_weights;
