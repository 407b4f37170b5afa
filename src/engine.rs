//! The sampling engine.
//!
//! One sweep reads every declared counter group in a fixed order, stamping
//! the sample with the cycle counter and wall clock first. Each group is
//! timed independently, purely for overhead reporting; the measurement has
//! no effect on correctness.
//!
//! The engine has two states: `Sampling` (the loop below) and `Draining`,
//! entered once when either the timeline fills or a drain request arrives.
//! Nothing here retries: a register read either succeeds at full width or
//! indicates a configuration/privilege problem that retrying will not fix.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::Result;

use crate::access::{CfgIo, MsrIo};
use crate::layout::{MachineLayout, Scope};
use crate::resolver::{self, RegisterAddress};
use crate::timeline::Timeline;
use crate::topology::Topology;
use crate::tsc;

#[derive(Debug, PartialEq, Eq)]
pub enum StopReason {
    CapacityReached,
    DrainRequested,
}

pub struct Sampler<'a> {
    layout: &'a MachineLayout,
    topo: &'a Topology,
    msr_io: &'a dyn MsrIo,
    cfg_io: &'a dyn CfgIo,
    verbose: bool,
}

impl<'a> Sampler<'a> {
    pub fn new(
        layout: &'a MachineLayout,
        topo: &'a Topology,
        msr_io: &'a dyn MsrIo,
        cfg_io: &'a dyn CfgIo,
        verbose: bool,
    ) -> Self {
        Sampler {
            layout,
            topo,
            msr_io,
            cfg_io,
            verbose,
        }
    }

    /// One complete pass over all counter groups, appended to the timeline.
    pub fn sweep(&self, timeline: &mut Timeline) -> Result<()> {
        timeline.begin_sweep(tsc::rdtscp(), tsc::walltime())?;
        for (gi, group) in self.layout.groups.iter().enumerate() {
            let before = tsc::rdtscp();
            let mut reads: u64 = 0;
            for outer in 0..group.outer_count(self.topo.nr_cpus()) {
                let lproc = match group.scope {
                    Scope::LogicalProcessor => outer,
                    Scope::Package => self.topo.representative(outer),
                };
                for instance in 0..group.instances {
                    for slot in 0..group.slots {
                        let addr = resolver::counter_address(
                            group,
                            &self.layout.pci,
                            outer,
                            instance,
                            slot,
                        );
                        let value = match addr {
                            RegisterAddress::Msr(reg) => self.msr_io.read(lproc, reg)?,
                            RegisterAddress::CfgWord(word) => self.cfg_io.read64(word)?,
                        };
                        timeline.record(gi, group.scalar_index(outer, instance, slot), value);
                        reads += 1;
                    }
                }
            }
            if self.verbose && reads > 0 {
                let elapsed = tsc::rdtscp().wrapping_sub(before);
                eprintln!(
                    "OVERHEAD: reading {} {} counters took {} TSC cycles, {} average",
                    reads,
                    group.name,
                    elapsed,
                    elapsed / reads
                );
            }
        }
        timeline.commit_sweep();
        Ok(())
    }

    /// Sample until the timeline is full or `stop` is raised. On a drain
    /// request: drop the last sample if its sweep never completed, take one
    /// more full sweep to capture final state, and hand control back for
    /// the dump.
    pub fn run(
        &self,
        timeline: &mut Timeline,
        interval: Duration,
        stop: &AtomicBool,
    ) -> Result<StopReason> {
        // Baseline read; deltas in post-processing start from here.
        self.sweep(timeline)?;
        loop {
            if timeline.is_full() {
                return Ok(StopReason::CapacityReached);
            }
            if stop.load(Ordering::Relaxed) {
                if timeline.discard_incomplete() {
                    eprintln!(
                        "DEBUG: drain request arrived during a sweep; discarding the unfinished sample, {} remain",
                        timeline.len()
                    );
                }
                if !timeline.is_full() {
                    self.sweep(timeline)?;
                }
                return Ok(StopReason::DrainRequested);
            }
            thread::sleep(interval);
            self.sweep(timeline)?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{MemCfg, MemMsr};
    use crate::layout::MachineLayout;
    use crate::resolver::pci_cfg_index;

    fn fixture() -> (MachineLayout, Topology, MemMsr, MemCfg) {
        (
            MachineLayout::skylake_xeon(),
            Topology::with_nr_cpus(4).unwrap(),
            MemMsr::default(),
            MemCfg::default(),
        )
    }

    #[test]
    fn test_sweep_records_every_declared_scalar() {
        let (layout, topo, msr_io, cfg_io) = fixture();
        // Programmable counter 1 on processor 2.
        msr_io.preset(2, 0xC2, 1234);
        // CHA box 3 counter 0 in package 1, read through its representative.
        msr_io.preset(3, 0xE08 + 0x10 * 3, 777);
        // IMC package 0, channel 0, DCLK slot: bus 0x3A, device 0x0A,
        // function 2, counter offset 0xD0.
        cfg_io.preset64(pci_cfg_index(0x3A, 0x0A, 0x2, 0xD0), 0x1_0000_0002);

        let sampler = Sampler::new(&layout, &topo, &msr_io, &cfg_io, false);
        let mut tl = Timeline::new(layout.groups, topo.nr_cpus(), 4);
        sampler.sweep(&mut tl).unwrap();

        assert_eq!(tl.len(), 1);
        let (gi, core) = layout.group("core_counts").unwrap();
        assert_eq!(tl.value(gi, core.scalar_index(2, 0, 1), 0), 1234);
        let (gi, cha) = layout.group("cha_counts").unwrap();
        assert_eq!(tl.value(gi, cha.scalar_index(1, 3, 0), 0), 777);
        let (gi, imc) = layout.group("imc_counts").unwrap();
        assert_eq!(tl.value(gi, imc.scalar_index(0, 0, 4), 0), 0x1_0000_0002);
    }

    #[test]
    fn test_run_stops_at_capacity() {
        let (layout, topo, msr_io, cfg_io) = fixture();
        let sampler = Sampler::new(&layout, &topo, &msr_io, &cfg_io, false);
        let mut tl = Timeline::new(layout.groups, topo.nr_cpus(), 3);
        let stop = AtomicBool::new(false);

        let reason = sampler.run(&mut tl, Duration::ZERO, &stop).unwrap();
        assert_eq!(reason, StopReason::CapacityReached);
        assert_eq!(tl.len(), 3);
    }

    #[test]
    fn test_run_drains_with_one_final_sweep() {
        let (layout, topo, msr_io, cfg_io) = fixture();
        let sampler = Sampler::new(&layout, &topo, &msr_io, &cfg_io, false);
        let mut tl = Timeline::new(layout.groups, topo.nr_cpus(), 100);
        let stop = AtomicBool::new(true);

        let reason = sampler.run(&mut tl, Duration::ZERO, &stop).unwrap();
        assert_eq!(reason, StopReason::DrainRequested);
        // The baseline sweep plus the final state capture.
        assert_eq!(tl.len(), 2);
    }

    #[test]
    fn test_short_read_is_fatal_mid_sweep() {
        let (layout, topo, msr_io, cfg_io) = fixture();
        msr_io.fail_on(1, 0x309);

        let sampler = Sampler::new(&layout, &topo, &msr_io, &cfg_io, false);
        let mut tl = Timeline::new(layout.groups, topo.nr_cpus(), 4);
        let err = sampler.sweep(&mut tl).unwrap_err();
        assert!(err.to_string().contains("short read"));
        // The interrupted sweep never committed.
        assert_eq!(tl.len(), 0);
    }
}
