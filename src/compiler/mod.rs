//! Int8 1×1 convolution compiler: validation → planning → generation.
//!
//! ```text
//! ConvDesc + PrimitiveAttr → validate → BlockingPlan → KernelGenerator → CompiledKernel
//!                               ↑            ↑                ↑
//!                           CpuCaps    PlannerConfig      fusion policy
//! ```

pub mod cache;
pub mod codegen;
pub mod executable;
pub mod fusion;
pub mod planner;

use std::sync::Arc;

pub use cache::KernelCache;
pub use codegen::KernelGenerator;
pub use executable::{CompiledKernel, KernelCallArgs, FLAG_REDUCE_FIRST, FLAG_REDUCE_LAST};
pub use planner::{BlockingPlan, LoopOrder};

use crate::config::PlannerConfig;
use crate::dispatch::{cpu_caps, CpuCaps};
use crate::kernel_types::{ConvDesc, PrimitiveAttr};
use crate::types::ConvResult;
use crate::validation::validate;

/// Validate `desc` and plan it, or report why the kernel does not apply.
pub fn plan_or_reject(
    desc: &ConvDesc,
    attr: &PrimitiveAttr,
    cfg: &PlannerConfig,
    caps: CpuCaps,
) -> ConvResult<BlockingPlan> {
    let conf = validate(desc, attr, caps).map_err(|reason| {
        log::debug!("int8 1x1 conv rejected: {reason}");
        reason
    })?;
    Ok(BlockingPlan::build(&conf, cfg))
}

/// Validate, plan and generate a kernel without caching.
pub fn compile(
    desc: &ConvDesc,
    attr: &PrimitiveAttr,
    cfg: &PlannerConfig,
    caps: CpuCaps,
) -> ConvResult<CompiledKernel> {
    let plan = plan_or_reject(desc, attr, cfg, caps)?;
    let hash = cache::config_hash(&cache::config_key(desc, attr, cfg, caps));
    Ok(KernelGenerator::generate(&plan, attr, hash))
}

/// Compiles kernels for one host, reusing them across identical
/// configurations.
pub struct ConvCompiler {
    cfg: PlannerConfig,
    caps: CpuCaps,
    cache: KernelCache,
}

impl ConvCompiler {
    /// Detected CPU, environment overrides applied.
    pub fn new() -> ConvResult<Self> {
        let cfg = PlannerConfig::from_env()?;
        let caps = cfg.resolve_caps(cpu_caps());
        Ok(Self::with_config(cfg, caps))
    }

    /// Fixed configuration and capabilities (tests, cross-planning).
    pub fn with_config(cfg: PlannerConfig, caps: CpuCaps) -> Self {
        ConvCompiler { cfg, caps, cache: KernelCache::new() }
    }

    pub fn config(&self) -> &PlannerConfig {
        &self.cfg
    }

    pub fn caps(&self) -> CpuCaps {
        self.caps
    }

    /// Compile `desc`, or return the cached kernel for it.
    pub fn compile(&mut self, desc: &ConvDesc, attr: &PrimitiveAttr) -> ConvResult<Arc<CompiledKernel>> {
        let hash = cache::config_hash(&cache::config_key(desc, attr, &self.cfg, self.caps));
        if let Some(kernel) = self.cache.get(hash) {
            log::trace!("int8 1x1 kernel cache hit {hash:016x}");
            return Ok(kernel);
        }
        let plan = plan_or_reject(desc, attr, &self.cfg, self.caps)?;
        let kernel = KernelGenerator::generate(&plan, attr, hash);
        Ok(self.cache.put(kernel))
    }

    pub fn cache_size(&self) -> usize {
        self.cache.len()
    }

    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }
}
