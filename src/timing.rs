//! Cycle-counter timing utilities.
//!
//! The datapath keeps all deadlines (RTO, loss-scan period, event-loop
//! budget) in TSC cycles to avoid syscalls on the hot path.

/// Read the CPU cycle counter.
#[inline]
pub fn rdtsc() -> u64 {
    #[cfg(target_arch = "x86_64")]
    {
        unsafe { std::arch::x86_64::_rdtsc() }
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        use std::time::Instant;
        static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
        let start = START.get_or_init(Instant::now);
        start.elapsed().as_nanos() as u64
    }
}

/// Measure the TSC frequency in GHz against the OS monotonic clock.
///
/// Sleeps for a few milliseconds once at endpoint construction.
pub fn measure_freq_ghz() -> f64 {
    let t0 = std::time::Instant::now();
    let c0 = rdtsc();
    std::thread::sleep(std::time::Duration::from_millis(10));
    let cycles = rdtsc().wrapping_sub(c0);
    let nanos = t0.elapsed().as_nanos() as u64;
    let ghz = cycles as f64 / nanos as f64;
    // A TSC outside this range means the measurement raced a clock step.
    if !(0.1..=10.0).contains(&ghz) {
        return 1.0;
    }
    ghz
}

/// Convert microseconds to cycles.
#[inline]
pub fn us_to_cycles(us: u64, freq_ghz: f64) -> u64 {
    (us as f64 * freq_ghz * 1000.0) as u64
}

/// Convert milliseconds to cycles.
#[inline]
pub fn ms_to_cycles(ms: u64, freq_ghz: f64) -> u64 {
    us_to_cycles(ms * 1000, freq_ghz)
}

/// Convert cycles to microseconds.
#[inline]
pub fn to_usec(cycles: u64, freq_ghz: f64) -> f64 {
    cycles as f64 / (freq_ghz * 1000.0)
}

/// Convert cycles to seconds.
#[inline]
pub fn to_sec(cycles: u64, freq_ghz: f64) -> f64 {
    cycles as f64 / (freq_ghz * 1e9)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rdtsc_monotonic() {
        let a = rdtsc();
        let b = rdtsc();
        assert!(b >= a);
    }

    #[test]
    fn test_freq_measurement() {
        let ghz = measure_freq_ghz();
        assert!(ghz > 0.1 && ghz < 10.0);
    }

    #[test]
    fn test_conversions() {
        let ghz = 2.0;
        assert_eq!(us_to_cycles(1, ghz), 2000);
        assert_eq!(ms_to_cycles(1, ghz), 2_000_000);
        assert!((to_usec(2000, ghz) - 1.0).abs() < 1e-9);
    }
}
