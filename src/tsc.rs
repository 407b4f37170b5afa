//! Low-overhead timestamp sources used to stamp every sweep.
//!
//! The cycle counter is only a node-local timeline value; the wall-clock pair
//! is recorded alongside it so post-processing can align timelines across
//! nodes from a single reference point.

/// Serializing read of the time-stamp counter.
#[cfg(target_arch = "x86_64")]
pub fn rdtscp() -> u64 {
    let mut aux = 0u32;
    unsafe { core::arch::x86_64::__rdtscp(&mut aux) }
}

/// Monotonic nanoseconds stand-in for non-x86 builds (tests only; the
/// sampler itself is x86-specific).
#[cfg(not(target_arch = "x86_64"))]
pub fn rdtscp() -> u64 {
    let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
    if unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) } != 0 {
        return 0;
    }
    (ts.tv_sec as u64) * 1_000_000_000 + ts.tv_nsec as u64
}

/// CPUID(1) family/model bits with the stepping and reserved fields masked
/// out, the value the layout tables are keyed on.
#[cfg(target_arch = "x86_64")]
pub fn cpuid_signature() -> u32 {
    let leaf = unsafe { core::arch::x86_64::__cpuid(1) };
    leaf.eax & 0x0fff_0ff0
}

#[cfg(not(target_arch = "x86_64"))]
pub fn cpuid_signature() -> u32 {
    0
}

/// Wall-clock (seconds, microseconds) from gettimeofday.
pub fn walltime() -> (i64, i64) {
    let mut tp: libc::timeval = unsafe { std::mem::zeroed() };
    if unsafe { libc::gettimeofday(&mut tp, std::ptr::null_mut()) } != 0 {
        return (0, 0);
    }
    (tp.tv_sec, tp.tv_usec)
}
