//! Hardware capability query for the int8 convolution planner.

pub mod device_profile;

pub use device_profile::{CpuCaps, KernelVersion};

use std::sync::OnceLock;

static CAPS: OnceLock<CpuCaps> = OnceLock::new();

/// Capabilities of the running CPU (probed once, cached for process lifetime).
pub fn cpu_caps() -> CpuCaps {
    *CAPS.get_or_init(CpuCaps::detect)
}
