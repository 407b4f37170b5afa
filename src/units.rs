//! Read-once platform scalars emitted in the output header.
//!
//! Counter values are dumped unscaled; these are the factors post-processing
//! needs to turn raw energy/throttle/timestamp counts into physical units
//! (and to correct for 32-bit wraparound, which is easier on unmodified
//! counts). Conversion itself never happens here.

use anyhow::Result;
use bitfield::bitfield;

use crate::access::MsrIo;
use crate::layout::msr;
use crate::topology::Topology;

bitfield! {
    /// MSR_RAPL_POWER_UNIT fields; each raw field N encodes a unit of
    /// 1/2^N (watts, joules, seconds).
    pub struct RaplPowerUnit(u64);
    impl Debug;
    pub power_raw, _: 3, 0;
    pub energy_raw, _: 12, 8;
    pub time_raw, _: 19, 16;
}

bitfield! {
    /// MSR_TEMPERATURE_TARGET; PROCHOT activation temperature in degrees C.
    pub struct TemperatureTarget(u64);
    impl Debug;
    pub prochot, _: 23, 16;
}

bitfield! {
    /// MSR_PLATFORM_INFO; ratio of the TSC to the 100 MHz reference clock.
    pub struct PlatformInfo(u64);
    impl Debug;
    pub tsc_ratio, _: 15, 8;
}

bitfield! {
    /// MSR_PKG_POWER_INFO; thermal spec power in RAPL power units.
    pub struct PkgPowerInfo(u64);
    impl Debug;
    pub thermal_spec_power_raw, _: 14, 0;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UnitScales {
    pub power: f64,
    pub pkg_energy: f64,
    /// Fixed at 1/65536 J on this processor family, not derived from the
    /// unit register.
    pub dram_energy: f64,
    pub time: f64,
}

/// Decode MSR_RAPL_POWER_UNIT into the scale factors.
pub fn unit_scales(rapl_power_unit: u64) -> UnitScales {
    let raw = RaplPowerUnit(rapl_power_unit);
    UnitScales {
        power: 0.5f64.powi(raw.power_raw() as i32),
        pkg_energy: 0.5f64.powi(raw.energy_raw() as i32),
        dram_energy: 1.0 / 65536.0,
        time: 0.5f64.powi(raw.time_raw() as i32),
    }
}

/// Everything the output header carries besides the run timestamps.
pub struct PlatformScalars {
    pub tsc_ratio: u64,
    pub prochot: u64,
    pub scales: UnitScales,
    pub package_tdp: f64,
    /// Initial IA32_FIXED_CTR_CTRL contents per logical processor, dumped so
    /// post-processing can see whether the environment set the AnyThread bits.
    pub fixed_ctr_ctrl: Vec<u64>,
}

impl PlatformScalars {
    /// One pass of reads through package 0's representative (both packages
    /// are assumed identical for these registers).
    pub fn read(io: &dyn MsrIo, topo: &Topology) -> Result<Self> {
        let rep = topo.representative(0);
        let tsc_ratio = PlatformInfo(io.read(rep, msr::MSR_PLATFORM_INFO)?).tsc_ratio();
        let prochot = TemperatureTarget(io.read(rep, msr::MSR_TEMPERATURE_TARGET)?).prochot();
        let scales = unit_scales(io.read(rep, msr::MSR_RAPL_POWER_UNIT)?);
        let power_info = PkgPowerInfo(io.read(rep, msr::MSR_PKG_POWER_INFO)?);
        let package_tdp = scales.power * power_info.thermal_spec_power_raw() as f64;
        let mut fixed_ctr_ctrl = Vec::with_capacity(topo.nr_cpus());
        for lproc in 0..topo.nr_cpus() {
            fixed_ctr_ctrl.push(io.read(lproc, msr::IA32_FIXED_CTR_CTRL)?);
        }
        Ok(PlatformScalars {
            tsc_ratio,
            prochot,
            scales,
            package_tdp,
            fixed_ctr_ctrl,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::MemMsr;

    #[test]
    fn test_unit_scales_decode() {
        // Typical Skylake Xeon value: power 1/8 W, energy 1/2^14 J,
        // time 1/2^10 s.
        let scales = unit_scales(0x000A_0E03);
        assert_eq!(scales.power, 0.125);
        assert_eq!(scales.pkg_energy, 6.103515625e-5);
        assert_eq!(scales.time, 0.0009765625);
        assert_eq!(scales.dram_energy, 1.0 / 65536.0);
    }

    #[test]
    fn test_field_extraction() {
        assert_eq!(TemperatureTarget(0x0062_0000).prochot(), 0x62);
        assert_eq!(PlatformInfo(0x1800).tsc_ratio(), 0x18);
        assert_eq!(PkgPowerInfo(0x3e8).thermal_spec_power_raw(), 1000);
    }

    #[test]
    fn test_platform_scalars_read() {
        let topo = Topology::with_nr_cpus(4).unwrap();
        let io = MemMsr::default();
        io.preset(0, msr::MSR_PLATFORM_INFO, 0x1800);
        io.preset(0, msr::MSR_TEMPERATURE_TARGET, 0x0062_0000);
        io.preset(0, msr::MSR_RAPL_POWER_UNIT, 0x000A_0E03);
        io.preset(0, msr::MSR_PKG_POWER_INFO, 0x3e8);
        io.preset(2, msr::IA32_FIXED_CTR_CTRL, 0x333);

        let scalars = PlatformScalars::read(&io, &topo).unwrap();
        assert_eq!(scalars.tsc_ratio, 24);
        assert_eq!(scalars.prochot, 98);
        assert_eq!(scalars.package_tdp, 125.0);
        assert_eq!(scalars.fixed_ctr_ctrl, vec![0, 0, 0x333, 0]);
    }
}
