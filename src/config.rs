//! Planner configuration: thread count, cache size and loop-order
//! preference, with environment overrides.
//!
//! | variable | meaning |
//! |---|---|
//! | `INT8CONV_THREADS` | threads the external scheduler will use |
//! | `INT8CONV_L2_BYTES` | per-core L2 size in bytes |
//! | `INT8CONV_ISA` | `auto`, `vnni` or `avx512_core` |

use crate::dispatch::CpuCaps;
use crate::types::{ConvError, ConvResult};

pub const ENV_THREADS: &str = "INT8CONV_THREADS";
pub const ENV_L2_BYTES: &str = "INT8CONV_L2_BYTES";
pub const ENV_ISA: &str = "INT8CONV_ISA";

/// Forces a kernel flavour regardless of what the CPU reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IsaOverride {
    #[default]
    Auto,
    Vnni,
    Avx512Core,
}

impl std::str::FromStr for IsaOverride {
    type Err = ConvError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("auto") {
            Ok(IsaOverride::Auto)
        } else if s.eq_ignore_ascii_case("vnni") {
            Ok(IsaOverride::Vnni)
        } else if s.eq_ignore_ascii_case("avx512_core") {
            Ok(IsaOverride::Avx512Core)
        } else {
            Err(ConvError::InvalidConfig(format!("{ENV_ISA}={s}")))
        }
    }
}

/// Inputs to the blocking planner that do not come from the problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PlannerConfig {
    /// Threads the external scheduler partitions work across.
    pub nthreads: usize,
    /// Per-core L2 size in bytes.
    pub l2_bytes: usize,
    /// Prefer broadcast-outer loop orders (the source is reduced over).
    pub reduce_src: bool,
    pub isa: IsaOverride,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        PlannerConfig {
            nthreads: rayon::current_num_threads().max(1),
            l2_bytes: crate::cache_params::l2_size(),
            reduce_src: false,
            isa: IsaOverride::Auto,
        }
    }
}

impl PlannerConfig {
    /// A fixed configuration, independent of the host.
    pub fn new(nthreads: usize, l2_bytes: usize) -> Self {
        PlannerConfig { nthreads: nthreads.max(1), l2_bytes, reduce_src: false, isa: IsaOverride::Auto }
    }

    /// Defaults with `INT8CONV_*` overrides from the process environment.
    pub fn from_env() -> ConvResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults with overrides read through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> ConvResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = PlannerConfig::default();
        if let Some(v) = lookup(ENV_THREADS) {
            cfg.nthreads = parse_positive(ENV_THREADS, &v)?;
        }
        if let Some(v) = lookup(ENV_L2_BYTES) {
            cfg.l2_bytes = parse_positive(ENV_L2_BYTES, &v)?;
        }
        if let Some(v) = lookup(ENV_ISA) {
            cfg.isa = v.parse()?;
        }
        Ok(cfg)
    }

    /// Apply the ISA override to detected capabilities.
    pub fn resolve_caps(&self, detected: CpuCaps) -> CpuCaps {
        match self.isa {
            IsaOverride::Auto => detected,
            IsaOverride::Vnni => CpuCaps::vnni(),
            IsaOverride::Avx512Core => CpuCaps::avx512_core(),
        }
    }
}

fn parse_positive(key: &str, value: &str) -> ConvResult<usize> {
    match value.trim().parse::<usize>() {
        Ok(v) if v > 0 => Ok(v),
        _ => Err(ConvError::InvalidConfig(format!("{key}={value}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |key: &str| pairs.iter().find(|(k, _)| *k == key).map(|(_, v)| v.to_string())
    }

    #[test]
    fn test_overrides_apply() {
        let cfg = PlannerConfig::from_lookup(lookup(&[
            (ENV_THREADS, "28"),
            (ENV_L2_BYTES, "1048576"),
            (ENV_ISA, "VNNI"),
        ]))
        .unwrap();
        assert_eq!(cfg.nthreads, 28);
        assert_eq!(cfg.l2_bytes, 1 << 20);
        assert_eq!(cfg.isa, IsaOverride::Vnni);
        assert_eq!(cfg.resolve_caps(CpuCaps { avx512_core: false, vnni: false }), CpuCaps::vnni());
    }

    #[test]
    fn test_invalid_overrides_rejected() {
        let err = PlannerConfig::from_lookup(lookup(&[(ENV_THREADS, "0")])).unwrap_err();
        assert!(matches!(err, ConvError::InvalidConfig(_)));
        let err = PlannerConfig::from_lookup(lookup(&[(ENV_ISA, "sse2")])).unwrap_err();
        assert!(matches!(err, ConvError::InvalidConfig(_)));
    }

    #[test]
    fn test_auto_keeps_detected_caps() {
        let cfg = PlannerConfig::new(4, 1 << 20);
        let caps = CpuCaps::avx512_core();
        assert_eq!(cfg.resolve_caps(caps), caps);
    }
}
