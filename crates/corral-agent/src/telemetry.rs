/// Live machine pressure, sampled once per scheduler tick.
pub trait ResourceProbe: Send + Sync {
    /// 0.0 (idle) to 1.0 (saturated).
    fn cpu_load(&self) -> f64;
    fn free_memory_mb(&self) -> u64;
}

/// Reads `/proc` on Linux; reports an idle, empty machine elsewhere.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcProbe;

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parallelism() -> f64 {
    std::thread::available_parallelism()
        .map(|n| n.get() as f64)
        .unwrap_or(1.0)
}

pub(crate) fn parse_loadavg(s: &str) -> Option<f64> {
    s.split_whitespace().next()?.parse::<f64>().ok()
}

pub(crate) fn parse_mem_available_mb(s: &str) -> Option<u64> {
    for line in s.lines() {
        if let Some(rest) = line.strip_prefix("MemAvailable:") {
            let kb: u64 = rest.trim().trim_end_matches("kB").trim().parse().ok()?;
            return Some(kb / 1024);
        }
    }
    None
}

pub(crate) fn normalize_load(load: f64, cpus: f64) -> f64 {
    if !load.is_finite() || cpus <= 0.0 {
        return 0.0;
    }
    (load / cpus).clamp(0.0, 1.0)
}

impl ResourceProbe for ProcProbe {
    #[cfg(target_os = "linux")]
    fn cpu_load(&self) -> f64 {
        std::fs::read_to_string("/proc/loadavg")
            .ok()
            .and_then(|s| parse_loadavg(&s))
            .map(|l| normalize_load(l, parallelism()))
            .unwrap_or(0.0)
    }

    #[cfg(not(target_os = "linux"))]
    fn cpu_load(&self) -> f64 {
        0.0
    }

    #[cfg(target_os = "linux")]
    fn free_memory_mb(&self) -> u64 {
        std::fs::read_to_string("/proc/meminfo")
            .ok()
            .and_then(|s| parse_mem_available_mb(&s))
            .unwrap_or(0)
    }

    #[cfg(not(target_os = "linux"))]
    fn free_memory_mb(&self) -> u64 {
        0
    }
}
