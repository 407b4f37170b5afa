//! Machine layout: which counter groups exist, how many instances and slots
//! each has, and which addressing formula reaches them.
//!
//! Everything here is static data keyed on the CPUID family/model signature.
//! The resolver consumes these tables; nothing in this module touches
//! hardware.

use anyhow::{bail, Result};

use crate::tsc;

/// Upper bound on logical processors (2-socket, 28-core, HyperThreading).
pub const MAX_LPROCS: usize = 112;

/// The tool targets symmetric dual-package nodes only.
pub const NUM_SOCKETS: usize = 2;

/// Timeline capacity; enough for 1-second sampling for almost 3 hours.
pub const MAX_SAMPLES: usize = 10_000;

/// Labels longer than this are truncated on store.
pub const LABEL_MAX: usize = 79;

/// Register numbers for the per-processor address space.
pub mod msr {
    pub const IA32_PMC0: u64 = 0xC1;
    pub const IA32_MPERF: u64 = 0xE7;
    pub const IA32_APERF: u64 = 0xE8;
    pub const IA32_FIXED_CTR0: u64 = 0x309;
    pub const IA32_FIXED_CTR_CTRL: u64 = 0x38D;
    pub const IA32_PACKAGE_THERM_STATUS: u64 = 0x1B1;

    pub const MSR_SMI_COUNT: u64 = 0x34;
    pub const MSR_PLATFORM_INFO: u64 = 0xCE;
    pub const MSR_TEMPERATURE_TARGET: u64 = 0x1A2;
    pub const MSR_RAPL_POWER_UNIT: u64 = 0x606;
    pub const MSR_PKG_ENERGY_STATUS: u64 = 0x611;
    pub const MSR_PKG_PERF_STATUS: u64 = 0x613;
    pub const MSR_PKG_POWER_INFO: u64 = 0x614;
    pub const MSR_DRAM_ENERGY_STATUS: u64 = 0x619;
    pub const MSR_CORE_PERF_LIMIT_REASONS: u64 = 0x64F;
    pub const MSR_RING_PERF_LIMIT_REASONS: u64 = 0x6B1;

    pub const U_MSR_PMON_FIXED_CTL: u64 = 0x703;
    pub const U_MSR_PMON_FIXED_CTR: u64 = 0x704;
    pub const PCU_MSR_PMON_CTL: u64 = 0x711;
    pub const PCU_MSR_PMON_CTR: u64 = 0x717;

    // CHA boxes occupy a 0x10-wide MSR block each: ctl at base+1..4,
    // filters at base+5..6, counts at base+8..B.
    pub const CHA_MSR_PMON_CTL_BASE: u64 = 0xE01;
    pub const CHA_MSR_PMON_CTR_BASE: u64 = 0xE08;
}

/// What the outer coordinate of a group ranges over.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scope {
    /// One set of counters per logical processor.
    LogicalProcessor,
    /// Shared by the package; read through its representative processor.
    Package,
}

/// The addressing formula for one counter group.
#[derive(Clone, Copy, Debug)]
pub enum Addressing {
    /// `ctr_base + stride * instance + slot` in the per-processor register
    /// file. `stride` is 0 for groups with a single instance, 0x10 for
    /// on-die replicated boxes that each reserve a block of registers.
    MsrBlock {
        ctr_base: u64,
        ctl_base: Option<u64>,
        stride: u64,
    },
    /// One named register per slot; no programming through the loader.
    MsrList { regs: &'static [u64] },
    /// PCI configuration space: bus per package, device/function per
    /// instance, byte offset per slot. Counters are 48 bits wide read as
    /// two 32-bit config words.
    PciCfg {
        devices: &'static [u8],
        functions: &'static [u8],
        ctr_offsets: &'static [u32],
        ctl_offsets: &'static [u32],
    },
}

/// How dump lines for a group are named.
#[derive(Clone, Copy, Debug)]
pub enum Naming {
    /// Group name plus the label stored by the program loader.
    Labelled,
    /// Group name plus a fixed label per slot.
    SlotLabels(&'static [&'static str]),
    /// An independent scalar name per slot.
    SlotNames(&'static [&'static str]),
}

/// Declarative description of one class of counters. Cardinality is fixed at
/// configuration time; the resolver and timeline are sized from it.
#[derive(Clone, Copy, Debug)]
pub struct CounterGroup {
    pub name: &'static str,
    pub scope: Scope,
    /// Replicated units per scope unit (boxes, channels); 1 if none.
    pub instances: usize,
    /// Counter registers per instance.
    pub slots: usize,
    /// Control registers per instance; exceeds `slots` where the hardware
    /// pairs filters with the counter controls (CHA).
    pub ctl_slots: usize,
    pub addressing: Addressing,
    pub naming: Naming,
}

impl CounterGroup {
    pub fn outer_count(&self, nr_cpus: usize) -> usize {
        match self.scope {
            Scope::LogicalProcessor => nr_cpus,
            Scope::Package => NUM_SOCKETS,
        }
    }

    /// Scalars contributed to one sample.
    pub fn scalar_count(&self, nr_cpus: usize) -> usize {
        self.outer_count(nr_cpus) * self.instances * self.slots
    }

    /// Flat index of one (outer, instance, slot) coordinate within a sample.
    pub fn scalar_index(&self, outer: usize, instance: usize, slot: usize) -> usize {
        assert!(instance < self.instances);
        assert!(slot < self.slots);
        (outer * self.instances + instance) * self.slots + slot
    }
}

/// Known-good signature register used to validate the config-space mapping
/// before any uncore address is trusted; a wrong base silently reads some
/// foreign device's registers.
#[derive(Clone, Copy, Debug)]
pub struct CfgSignature {
    pub bus: u16,
    pub device: u8,
    pub function: u8,
    pub expect: u32,
}

/// Per-package and per-channel PCI location tables.
#[derive(Clone, Copy, Debug)]
pub struct PciTables {
    pub bus_by_package: &'static [u16; NUM_SOCKETS],
    pub signature: CfgSignature,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CpuModel {
    SkylakeXeon,
}

/// The concrete tables consumed by the resolver, selected once at startup.
pub struct MachineLayout {
    pub model: CpuModel,
    pub groups: &'static [CounterGroup],
    pub pci: PciTables,
}

impl MachineLayout {
    /// Select the layout for the processor we are running on.
    pub fn detect() -> Result<Self> {
        Self::for_signature(tsc::cpuid_signature())
    }

    pub fn for_signature(signature: u32) -> Result<Self> {
        match signature {
            SKX_CPUID_SIGNATURE => Ok(Self::skylake_xeon()),
            sig => bail!(
                "unsupported processor: CPUID family/model {:#010x} (expected Skylake Xeon {:#010x})",
                sig,
                SKX_CPUID_SIGNATURE
            ),
        }
    }

    pub fn skylake_xeon() -> Self {
        MachineLayout {
            model: CpuModel::SkylakeXeon,
            groups: &SKX_GROUPS,
            pci: SKX_PCI,
        }
    }

    pub fn group(&self, name: &str) -> Option<(usize, &CounterGroup)> {
        self.groups
            .iter()
            .enumerate()
            .find(|(_, g)| g.name == name)
    }
}

/// CPUID(1) family/model bits for Xeon Scalable (Skylake-SP).
pub const SKX_CPUID_SIGNATURE: u32 = 0x0005_0650;

// Bus/device/function locations for the SKX IMC channels. The DDR channels
// across both memory controllers collapse into a single 0-5 channel index.
const SKX_IMC_DEVICE_CHANNEL: [u8; 6] = [0x0A, 0x0A, 0x0B, 0x0C, 0x0C, 0x0D];
const SKX_IMC_FUNCTION_CHANNEL: [u8; 6] = [0x2, 0x6, 0x2, 0x2, 0x6, 0x2];
// Programmable counters 0-3 plus the fixed-function DCLK counter.
const SKX_IMC_CTR_OFFSETS: [u32; 5] = [0xA0, 0xA8, 0xB0, 0xB8, 0xD0];
const SKX_IMC_CTL_OFFSETS: [u32; 5] = [0xD8, 0xDC, 0xE0, 0xE4, 0xF0];

const SKX_PCI: PciTables = PciTables {
    bus_by_package: &[0x3A, 0xAE],
    // Sky Lake-E MM/Vt-d configuration registers: DID 0x2024, VID 0x8086.
    signature: CfgSignature {
        bus: 0,
        device: 5,
        function: 0,
        expect: 0x2024_8086,
    },
};

const SOCKET_MISC_REGS: [u64; 8] = [
    msr::IA32_PACKAGE_THERM_STATUS,
    msr::MSR_CORE_PERF_LIMIT_REASONS,
    msr::MSR_RING_PERF_LIMIT_REASONS,
    msr::MSR_PKG_ENERGY_STATUS,
    msr::MSR_DRAM_ENERGY_STATUS,
    msr::MSR_PKG_PERF_STATUS,
    msr::MSR_SMI_COUNT,
    msr::U_MSR_PMON_FIXED_CTR,
];

const SOCKET_MISC_NAMES: [&str; 8] = [
    "pkg_therm_status",
    "pkg_core_perf_limit_reasons",
    "pkg_ring_perf_limit_reasons",
    "rapl_pkg_energy",
    "rapl_dram_energy",
    "rapl_pkg_throttled",
    "smi_count",
    "ubox_uclk",
];

const CORE_FIXED_LABELS: [&str; 3] = [
    "Inst_Retired.Any",
    "CPU_CLK_Unhalted.Core",
    "CPU_CLK_Unhalted.Ref",
];

const CORE_AUX_REGS: [u64; 2] = [msr::IA32_APERF, msr::IA32_MPERF];
const CORE_AUX_NAMES: [&str; 2] = ["aperf", "mperf"];

// 36-bit free-running IO traffic counters; no setup required (or allowed).
const IIO_REGS: [u64; 6] = [0xB01, 0xB05, 0xB11, 0xB15, 0xB30, 0xB34];
const IIO_NAMES: [&str; 6] = [
    "iio_CBDMA_port1_in",
    "iio_CBDMA_port1_out",
    "iio_PCIe0_port1_in",
    "iio_PCIe0_port1_out",
    "iio_PCIe2_port0_in",
    "iio_PCIe2_port0_out",
];

/// Sweep order is the declaration order here.
static SKX_GROUPS: [CounterGroup; 8] = [
    CounterGroup {
        name: "socket_misc",
        scope: Scope::Package,
        instances: 1,
        slots: 8,
        ctl_slots: 0,
        addressing: Addressing::MsrList {
            regs: &SOCKET_MISC_REGS,
        },
        naming: Naming::SlotNames(&SOCKET_MISC_NAMES),
    },
    CounterGroup {
        name: "core_counts",
        scope: Scope::LogicalProcessor,
        instances: 1,
        slots: 4,
        ctl_slots: 0,
        addressing: Addressing::MsrBlock {
            ctr_base: msr::IA32_PMC0,
            // PerfEvtSel registers come addressed in the input records.
            ctl_base: None,
            stride: 0,
        },
        naming: Naming::Labelled,
    },
    CounterGroup {
        name: "core_fixed_counts",
        scope: Scope::LogicalProcessor,
        instances: 1,
        slots: 3,
        ctl_slots: 0,
        addressing: Addressing::MsrBlock {
            ctr_base: msr::IA32_FIXED_CTR0,
            ctl_base: None,
            stride: 0,
        },
        naming: Naming::SlotLabels(&CORE_FIXED_LABELS),
    },
    CounterGroup {
        name: "core_aux",
        scope: Scope::LogicalProcessor,
        instances: 1,
        slots: 2,
        ctl_slots: 0,
        addressing: Addressing::MsrList {
            regs: &CORE_AUX_REGS,
        },
        naming: Naming::SlotNames(&CORE_AUX_NAMES),
    },
    CounterGroup {
        name: "cha_counts",
        scope: Scope::Package,
        instances: 28,
        slots: 4,
        // 4 counter controls plus 2 filters per box.
        ctl_slots: 6,
        addressing: Addressing::MsrBlock {
            ctr_base: msr::CHA_MSR_PMON_CTR_BASE,
            ctl_base: Some(msr::CHA_MSR_PMON_CTL_BASE),
            stride: 0x10,
        },
        naming: Naming::Labelled,
    },
    CounterGroup {
        name: "imc_counts",
        scope: Scope::Package,
        instances: 6,
        slots: 5,
        ctl_slots: 5,
        addressing: Addressing::PciCfg {
            devices: &SKX_IMC_DEVICE_CHANNEL,
            functions: &SKX_IMC_FUNCTION_CHANNEL,
            ctr_offsets: &SKX_IMC_CTR_OFFSETS,
            ctl_offsets: &SKX_IMC_CTL_OFFSETS,
        },
        naming: Naming::Labelled,
    },
    CounterGroup {
        name: "iio_free_running",
        scope: Scope::Package,
        instances: 1,
        slots: 6,
        ctl_slots: 0,
        addressing: Addressing::MsrList { regs: &IIO_REGS },
        naming: Naming::SlotNames(&IIO_NAMES),
    },
    CounterGroup {
        name: "pcu_counts",
        scope: Scope::Package,
        instances: 1,
        slots: 4,
        ctl_slots: 4,
        addressing: Addressing::MsrBlock {
            ctr_base: msr::PCU_MSR_PMON_CTR,
            ctl_base: Some(msr::PCU_MSR_PMON_CTL),
            stride: 0,
        },
        naming: Naming::Labelled,
    },
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skx_layout_cardinalities() {
        let layout = MachineLayout::skylake_xeon();
        let (_, cha) = layout.group("cha_counts").unwrap();
        assert_eq!(cha.scalar_count(112), 2 * 28 * 4);
        let (_, imc) = layout.group("imc_counts").unwrap();
        assert_eq!(imc.scalar_count(112), 2 * 6 * 5);
        let (_, core) = layout.group("core_counts").unwrap();
        assert_eq!(core.scalar_count(96), 96 * 4);
    }

    #[test]
    fn test_scalar_index_is_dense() {
        let layout = MachineLayout::skylake_xeon();
        let (_, cha) = layout.group("cha_counts").unwrap();
        let mut seen = vec![false; cha.scalar_count(4)];
        for outer in 0..cha.outer_count(4) {
            for inst in 0..cha.instances {
                for slot in 0..cha.slots {
                    let idx = cha.scalar_index(outer, inst, slot);
                    assert!(!seen[idx]);
                    seen[idx] = true;
                }
            }
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn test_unknown_signature_rejected() {
        assert!(MachineLayout::for_signature(0x0003_06F0).is_err());
        assert!(MachineLayout::for_signature(SKX_CPUID_SIGNATURE).is_ok());
    }

    #[test]
    #[should_panic]
    fn test_scalar_index_slot_bounds() {
        let layout = MachineLayout::skylake_xeon();
        let (_, cha) = layout.group("cha_counts").unwrap();
        cha.scalar_index(0, 0, 4);
    }
}
