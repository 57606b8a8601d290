//! Hardware cycle counter (TSC on x86_64, CNTVCT on aarch64).
//!
//! `read()` returns raw counter ticks; every statistic in the tree is kept
//! in these ticks. `ns_per_cycle()` is only needed by reporters that want
//! wall time, so calibration happens lazily the first time it is asked for.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// Read the hardware cycle counter. Single inline instruction on both
/// x86_64 (`rdtsc`) and aarch64 (`mrs cntvct_el0`).
#[inline(always)]
pub fn read() -> u64 {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        core::arch::x86_64::_rdtsc()
    }
    #[cfg(target_arch = "aarch64")]
    {
        let val: u64;
        unsafe { core::arch::asm!("mrs {}, cntvct_el0", out(reg) val) };
        val
    }
    // Fallback: nanoseconds since the first read.
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        static FALLBACK_EPOCH: OnceLock<Instant> = OnceLock::new();
        let epoch = FALLBACK_EPOCH.get_or_init(Instant::now);
        Instant::now().duration_since(*epoch).as_nanos() as u64
    }
}

static NS_PER_CYCLE: OnceLock<f64> = OnceLock::new();

/// Nanoseconds per counter tick, calibrated once against `Instant`.
pub fn ns_per_cycle() -> f64 {
    *NS_PER_CYCLE.get_or_init(calibrate)
}

/// Convert a tick count to milliseconds using the calibrated ratio.
pub fn cycles_to_ms(cycles: u64) -> f64 {
    cycles as f64 * ns_per_cycle() / 1_000_000.0
}

/// Measure how many ticks elapse in a known wall-clock interval.
/// The spin is brief (~2ms).
fn calibrate() -> f64 {
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        // read() already returns nanoseconds
        return 1.0;
    }

    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    {
        let wall_start = Instant::now();
        let tsc_start = read();

        let target = Duration::from_millis(2);
        while wall_start.elapsed() < target {}

        let tsc_end = read();
        let wall_ns = wall_start.elapsed().as_nanos() as u64;
        let ticks = tsc_end.wrapping_sub(tsc_start);
        if ticks == 0 {
            tracing::warn!("cycle counter did not advance during calibration");
            return 1.0;
        }
        let ratio = wall_ns as f64 / ticks as f64;
        tracing::debug!(ns_per_cycle = ratio, "calibrated cycle counter");
        ratio
    }
}
