//! Kernel cache: one generated kernel per distinct configuration.
//!
//! Keyed by a content hash of (descriptor + attributes + planner config +
//! resolved CPU caps). Kernels are immutable, so hits hand out shared
//! `Arc`s.

use std::collections::HashMap;
use std::sync::Arc;

use crate::compiler::executable::CompiledKernel;
use crate::config::PlannerConfig;
use crate::dispatch::CpuCaps;
use crate::kernel_types::{ConvDesc, PostOp, PrimitiveAttr};

/// FNV-1a over the configuration key bytes.
pub fn config_hash(key: &[u8]) -> u64 {
    let mut h: u64 = 0xcbf29ce484222325; // FNV offset basis
    for &b in key {
        h ^= b as u64;
        h = h.wrapping_mul(0x100000001b3); // FNV prime
    }
    h
}

/// Serialized cache key. Floats contribute their bit patterns.
pub fn config_key(desc: &ConvDesc, attr: &PrimitiveAttr, cfg: &PlannerConfig, caps: CpuCaps) -> Vec<u8> {
    let s = &desc.shape;
    let mut key = format!(
        "mb{}_g{}_ic{}_oc{}_ih{}_iw{}_oh{}_ow{}_k{}x{}_s{}x{}_p{}x{}_{:?}_{:?}_relu{}:{:08x}_{:?}",
        s.mb,
        s.ngroups,
        s.ic,
        s.oc,
        s.ih,
        s.iw,
        s.oh,
        s.ow,
        s.kh,
        s.kw,
        s.stride_h,
        s.stride_w,
        s.t_pad,
        s.l_pad,
        desc.dtypes,
        desc.layouts,
        desc.with_relu,
        desc.relu_negative_slope.to_bits(),
        attr.round_mode,
    );
    for op in attr.post_ops.entries() {
        match op {
            PostOp::Sum { scale } => key.push_str(&format!("_sum:{:08x}", scale.to_bits())),
            PostOp::Eltwise { alg, scale, alpha, beta } => key.push_str(&format!(
                "_{:?}:{:08x}:{:08x}:{:08x}",
                alg,
                scale.to_bits(),
                alpha.to_bits(),
                beta.to_bits()
            )),
        }
    }
    key.push_str(&format!(
        "_mask{}_n{}_t{}_l2{}_rs{}_{}",
        attr.output_scales.mask,
        attr.output_scales.scales.len(),
        cfg.nthreads,
        cfg.l2_bytes,
        cfg.reduce_src,
        caps,
    ));
    key.into_bytes()
}

/// In-memory kernel cache.
#[derive(Default)]
pub struct KernelCache {
    entries: HashMap<u64, Arc<CompiledKernel>>,
}

impl KernelCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, config_hash: u64) -> Option<Arc<CompiledKernel>> {
        self.entries.get(&config_hash).cloned()
    }

    /// Store `kernel` under its own hash and return the shared handle.
    pub fn put(&mut self, kernel: CompiledKernel) -> Arc<CompiledKernel> {
        let kernel = Arc::new(kernel);
        self.entries.insert(kernel.config_hash, Arc::clone(&kernel));
        kernel
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
