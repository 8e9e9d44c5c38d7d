//! CPU capability flags consumed by the validator and planner.

/// Inner-product flavour of the generated kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelVersion {
    /// Two-step emulation: u8×s8 pairwise add into saturating i16 lanes,
    /// then widen-add into i32 lanes.
    Avx512Core,
    /// Native 4-way u8×s8 → i32 dot product.
    Vnni,
}

impl KernelVersion {
    /// Broadcast-unroll register budget for this flavour.
    #[inline]
    pub fn max_regs(self) -> usize {
        match self {
            KernelVersion::Vnni => 9,
            KernelVersion::Avx512Core => 8,
        }
    }
}

/// Hardware capabilities relevant to the int8 1×1 kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CpuCaps {
    /// 512-bit integer vectors with byte/word and dword/qword ops.
    pub avx512_core: bool,
    /// Native u8×s8 dot-product instruction.
    pub vnni: bool,
}

impl CpuCaps {
    /// Probe the running CPU.
    pub fn detect() -> Self {
        #[cfg(target_arch = "x86_64")]
        {
            let avx512_core = is_x86_feature_detected!("avx512f")
                && is_x86_feature_detected!("avx512bw")
                && is_x86_feature_detected!("avx512vl")
                && is_x86_feature_detected!("avx512dq");
            let vnni = avx512_core && is_x86_feature_detected!("avx512vnni");
            CpuCaps { avx512_core, vnni }
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            CpuCaps { avx512_core: false, vnni: false }
        }
    }

    /// Capabilities of an AVX-512 part without the dot-product extension.
    pub const fn avx512_core() -> Self {
        CpuCaps { avx512_core: true, vnni: false }
    }

    /// Capabilities of an AVX-512 part with the dot-product extension.
    pub const fn vnni() -> Self {
        CpuCaps { avx512_core: true, vnni: true }
    }

    /// Kernel flavour these capabilities select.
    #[inline]
    pub fn kernel_version(&self) -> KernelVersion {
        if self.vnni {
            KernelVersion::Vnni
        } else {
            KernelVersion::Avx512Core
        }
    }
}

impl std::fmt::Display for CpuCaps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "avx512_core={} vnni={}", self.avx512_core, self.vnni)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_version_selection() {
        assert_eq!(CpuCaps::vnni().kernel_version(), KernelVersion::Vnni);
        assert_eq!(CpuCaps::avx512_core().kernel_version(), KernelVersion::Avx512Core);
        assert_eq!(KernelVersion::Vnni.max_regs(), 9);
        assert_eq!(KernelVersion::Avx512Core.max_regs(), 8);
    }

    #[test]
    fn test_detect_is_consistent() {
        let caps = CpuCaps::detect();
        eprintln!("CpuCaps: {caps}");
        if caps.vnni {
            assert!(caps.avx512_core);
        }
    }
}
