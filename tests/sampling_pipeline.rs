//! End-to-end pipeline tests: program counters from input files, sample
//! through in-memory register channels, and validate the dump output.

use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use hwsweep::access::{MemCfg, MemMsr};
use hwsweep::dump;
use hwsweep::engine::{Sampler, StopReason};
use hwsweep::layout::MachineLayout;
use hwsweep::program;
use hwsweep::timeline::Timeline;
use hwsweep::topology::Topology;

/// All five assignment files must exist; tests fill in only what they use.
fn write_inputs(dir: &Path, core_evtsel: &str, imc_evtsel: &str) {
    std::fs::write(dir.join("core_msr_control.input"), "").unwrap();
    std::fs::write(dir.join("core_msr_perfevtsel.input"), core_evtsel).unwrap();
    std::fs::write(dir.join("pcu_perfevtsel.input"), "").unwrap();
    std::fs::write(dir.join("cha_perfevtsel.input"), "").unwrap();
    std::fs::write(dir.join("imc_perfevtsel.input"), imc_evtsel).unwrap();
}

#[test]
fn test_programmed_label_flows_through_to_dump() {
    let dir = tempfile::tempdir().unwrap();
    write_inputs(dir.path(), "0 3 186 0 43041F INST_RETIRED\n", "");

    let layout = MachineLayout::skylake_xeon();
    let topo = Topology::with_nr_cpus(4).unwrap();
    let msr_io = MemMsr::default();
    let cfg_io = MemCfg::default();

    let labels =
        program::load_and_program(dir.path(), &layout, &topo, &msr_io, &cfg_io, false).unwrap();

    // The PerfEvtSel write landed on every processor in the range.
    for lproc in 0..4 {
        assert_eq!(msr_io.get(lproc, 0x186), Some(0x43_041F));
    }

    let sampler = Sampler::new(&layout, &topo, &msr_io, &cfg_io, false);
    let mut timeline = Timeline::new(layout.groups, topo.nr_cpus(), 8);
    sampler.sweep(&mut timeline).unwrap();

    let mut out = Vec::new();
    dump::write_samples(&mut out, layout.groups, topo.nr_cpus(), &timeline, &labels).unwrap();
    let text = String::from_utf8(out).unwrap();

    for lproc in 0..4 {
        let prefix = format!("core_counts[{}][\"INST_RETIRED\"][0] = ", lproc);
        let line = text
            .lines()
            .find(|l| l.starts_with(&prefix))
            .unwrap_or_else(|| panic!("no dump line for processor {}", lproc));
        line.rsplit(' ')
            .next()
            .unwrap()
            .parse::<u64>()
            .expect("counter value is not a raw u64");
    }
}

#[test]
fn test_full_run_dumps_every_group_scalar() {
    let dir = tempfile::tempdir().unwrap();
    write_inputs(dir.path(), "", "0 0 0 0 400304 CAS_COUNT_RD\n");

    let layout = MachineLayout::skylake_xeon();
    let topo = Topology::with_nr_cpus(4).unwrap();
    let msr_io = MemMsr::default();
    let cfg_io = MemCfg::default();
    // Give a couple of counters recognizable values.
    msr_io.preset(0, 0x309, 41);
    msr_io.preset(3, 0x717, 4242);

    let labels =
        program::load_and_program(dir.path(), &layout, &topo, &msr_io, &cfg_io, false).unwrap();

    let sampler = Sampler::new(&layout, &topo, &msr_io, &cfg_io, false);
    let mut timeline = Timeline::new(layout.groups, topo.nr_cpus(), 3);
    let stop = AtomicBool::new(false);
    let reason = sampler.run(&mut timeline, Duration::ZERO, &stop).unwrap();
    assert_eq!(reason, StopReason::CapacityReached);
    assert_eq!(timeline.len(), 3);

    let mut out = Vec::new();
    dump::write_samples(&mut out, layout.groups, topo.nr_cpus(), &timeline, &labels).unwrap();
    let text = String::from_utf8(out).unwrap();

    // Three timestamp lines plus one line per declared scalar, per sample.
    let scalars_per_sample: usize = layout
        .groups
        .iter()
        .map(|g| g.scalar_count(topo.nr_cpus()))
        .sum();
    assert_eq!(text.lines().count(), 3 * (scalars_per_sample + 3));

    assert!(text.contains("core_fixed_counts[0][\"Inst_Retired.Any\"][2] = 41"));
    assert!(text.contains("pcu_counts[1][\"\"][0] = 4242"));
    assert!(text.contains("imc_counts[0][0][\"CAS_COUNT_RD\"][1] = 0"));
}
