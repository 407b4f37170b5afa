//! Turns (group, package, instance, slot) coordinates into concrete register
//! addresses.
//!
//! Resolution is a pure function of the layout tables plus configuration
//! input; it must never depend on machine dynamic state. Out-of-range
//! coordinates are configuration/programming errors, enforced with
//! assertions rather than surfaced as runtime errors.

use crate::layout::{Addressing, CounterGroup, PciTables};

/// A resolved register location, tagged by address space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RegisterAddress {
    /// Register number in the per-processor sequential register file,
    /// accessed through that processor's channel.
    Msr(u64),
    /// 32-bit-word index into PCI configuration space, accessed through the
    /// process-wide mapped window.
    CfgWord(u32),
}

/// Reduce a configuration-space (bus, device, function, byte-offset) tuple
/// to a 32-bit-word index.
///
/// This formula must match the platform's configuration-space layout
/// bit-for-bit; there is no framing or checksum to catch misaddressing, so
/// the mapping is validated once at startup against a known-good signature
/// register before any of these indices are trusted.
pub fn pci_cfg_index(bus: u16, device: u8, function: u8, offset: u32) -> u32 {
    assert!(bus < 0x100);
    assert!(device < (1 << 5));
    assert!(function < (1 << 3));
    assert!(offset < (1 << 12));
    let byteaddress =
        ((bus as u32) << 20) | ((device as u32) << 15) | ((function as u32) << 12) | offset;
    byteaddress / 4
}

/// Collapse (memory controller, DDR sub-channel) into the single channel
/// index the per-channel device/function tables are built on.
pub fn imc_channel(unit: usize, subunit: usize) -> usize {
    assert!(subunit < 3);
    3 * unit + subunit
}

/// Resolve the count register for one (package, instance, slot) coordinate.
pub fn counter_address(
    group: &CounterGroup,
    pci: &PciTables,
    package: usize,
    instance: usize,
    slot: usize,
) -> RegisterAddress {
    assert!(instance < group.instances);
    assert!(slot < group.slots);
    match group.addressing {
        Addressing::MsrBlock {
            ctr_base, stride, ..
        } => RegisterAddress::Msr(ctr_base + stride * instance as u64 + slot as u64),
        Addressing::MsrList { regs } => {
            assert!(group.instances == 1);
            RegisterAddress::Msr(regs[slot])
        }
        Addressing::PciCfg {
            devices,
            functions,
            ctr_offsets,
            ..
        } => RegisterAddress::CfgWord(pci_cfg_index(
            pci.bus_by_package[package],
            devices[instance],
            functions[instance],
            ctr_offsets[slot],
        )),
    }
}

/// Resolve the control register for one coordinate. Only meaningful for
/// groups with resolver-addressed controls (`ctl_slots > 0`); groups whose
/// controls arrive pre-addressed in the input records never reach here.
pub fn control_address(
    group: &CounterGroup,
    pci: &PciTables,
    package: usize,
    instance: usize,
    slot: usize,
) -> RegisterAddress {
    assert!(instance < group.instances);
    assert!(slot < group.ctl_slots, "no control slot {} in group {}", slot, group.name);
    match group.addressing {
        Addressing::MsrBlock {
            ctl_base: Some(base),
            stride,
            ..
        } => RegisterAddress::Msr(base + stride * instance as u64 + slot as u64),
        Addressing::MsrBlock { ctl_base: None, .. } | Addressing::MsrList { .. } => {
            panic!("controls of group {} are not resolver-addressed", group.name)
        }
        Addressing::PciCfg {
            devices,
            functions,
            ctl_offsets,
            ..
        } => RegisterAddress::CfgWord(pci_cfg_index(
            pci.bus_by_package[package],
            devices[instance],
            functions[instance],
            ctl_offsets[slot],
        )),
    }
}
