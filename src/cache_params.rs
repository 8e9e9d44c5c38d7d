//! Per-core L2 cache size used by the blocking planner.
//!
//! Detected via CPUID leaf 4 (x86) or sysfs (Linux), falling back to a
//! conservative 1 MiB. Computed once and cached in a static `OnceLock`.

use std::sync::OnceLock;

/// Used when neither CPUID nor sysfs report an L2.
pub const FALLBACK_L2_BYTES: usize = 1024 * 1024;

fn detect_l2_bytes() -> usize {
    #[cfg(target_arch = "x86_64")]
    {
        if let Some(l2) = detect_x86_l2() {
            return l2;
        }
    }
    #[cfg(target_os = "linux")]
    {
        if let Some(l2) = detect_sysfs_l2() {
            return l2;
        }
    }
    FALLBACK_L2_BYTES
}

#[cfg(target_arch = "x86_64")]
fn detect_x86_l2() -> Option<usize> {
    // CPUID leaf 4: deterministic cache parameters
    for sub in 0..16u32 {
        // SAFETY: leaf 4 is available on every x86_64 part that reports it;
        // unsupported subleaves return cache type 0.
        let info = unsafe { std::arch::x86_64::__cpuid_count(4, sub) };
        let cache_type = info.eax & 0x1F;
        if cache_type == 0 {
            break;
        }
        let level = (info.eax >> 5) & 0x7;
        if level != 2 || !(cache_type == 2 || cache_type == 3) {
            continue;
        }
        let line_size = (info.ebx & 0xFFF) + 1;
        let partitions = ((info.ebx >> 12) & 0x3FF) + 1;
        let ways = ((info.ebx >> 22) & 0x3FF) + 1;
        let sets = info.ecx + 1;
        return Some(line_size as usize * partitions as usize * ways as usize * sets as usize);
    }
    None
}

#[cfg(target_os = "linux")]
fn detect_sysfs_l2() -> Option<usize> {
    for idx in 0..8 {
        let base = format!("/sys/devices/system/cpu/cpu0/cache/index{idx}");
        let level = match std::fs::read_to_string(format!("{base}/level")) {
            Ok(s) => s,
            Err(_) => continue,
        };
        if level.trim() != "2" {
            continue;
        }
        let size_str = std::fs::read_to_string(format!("{base}/size")).ok()?;
        return parse_cache_size(size_str.trim());
    }
    None
}

/// Parse a sysfs cache size such as `1024K` or `2M`.
fn parse_cache_size(s: &str) -> Option<usize> {
    if let Some(kb) = s.strip_suffix('K') {
        kb.parse::<usize>().ok().map(|v| v * 1024)
    } else if let Some(mb) = s.strip_suffix('M') {
        mb.parse::<usize>().ok().map(|v| v * 1024 * 1024)
    } else {
        s.parse::<usize>().ok()
    }
}

static L2_BYTES: OnceLock<usize> = OnceLock::new();

/// Detected per-core L2 size in bytes.
pub fn l2_size() -> usize {
    *L2_BYTES.get_or_init(detect_l2_bytes)
}
