//! Output serialization.
//!
//! The whole timeline is drained exactly once at shutdown into a stream of
//! self-describing assignment lines, one per scalar, carrying the numeric
//! coordinates, the stored label where the group has one, and the raw
//! 64-bit value. Nothing derived is emitted: unit conversion and
//! wraparound correction belong to post-processing, which gets the scale
//! factors once from the header.

use std::io::Write;

use anyhow::Result;

use crate::layout::{CounterGroup, Naming};
use crate::program::Labels;
use crate::timeline::Timeline;
use crate::units::PlatformScalars;

/// Scalar header lines, written once at the top of the output.
pub fn write_header(
    w: &mut dyn Write,
    scalars: &PlatformScalars,
    nr_cpus: usize,
    reference_tsc: u64,
    reference_wall: (i64, i64),
) -> Result<()> {
    writeln!(w, "TSC_ratio = {}", scalars.tsc_ratio)?;
    writeln!(w, "nr_cpus = {}", nr_cpus)?;
    writeln!(w, "Reference_TSC = {}", reference_tsc)?;
    writeln!(
        w,
        "Reference_WallTime = {}.{:06}",
        reference_wall.0, reference_wall.1
    )?;
    writeln!(w, "PROCHOT = {}", scalars.prochot)?;
    writeln!(w, "RAPL_POWER_UNIT = {:.9}", scalars.scales.power)?;
    writeln!(w, "RAPL_PKG_ENERGY_UNIT = {:.9}", scalars.scales.pkg_energy)?;
    writeln!(w, "RAPL_DRAM_ENERGY_UNIT = {:.9}", scalars.scales.dram_energy)?;
    writeln!(w, "RAPL_TIME_UNIT = {:.9}", scalars.scales.time)?;
    writeln!(w, "PACKAGE_TDP = {:.6}", scalars.package_tdp)?;
    for (lproc, ctrl) in scalars.fixed_ctr_ctrl.iter().enumerate() {
        writeln!(w, "IA32_FIXED_CTR_CTRL[{}] = {:#x}", lproc, ctrl)?;
    }
    Ok(())
}

/// Walk the timeline once, emitting every sample in chronological order.
pub fn write_samples(
    w: &mut dyn Write,
    groups: &[CounterGroup],
    nr_cpus: usize,
    timeline: &Timeline,
    labels: &Labels,
) -> Result<()> {
    for i in 0..timeline.len() {
        writeln!(w, "tsc[{}] = {}", i, timeline.tsc(i))?;
        let (sec, usec) = timeline.wall(i);
        writeln!(w, "walltime[0][{}] = {}", i, sec)?;
        writeln!(w, "walltime[1][{}] = {}", i, usec)?;

        for (gi, group) in groups.iter().enumerate() {
            for outer in 0..group.outer_count(nr_cpus) {
                for instance in 0..group.instances {
                    for slot in 0..group.slots {
                        let scalar = group.scalar_index(outer, instance, slot);
                        let value = timeline.value(gi, scalar, i);
                        match group.naming {
                            Naming::SlotNames(names) => {
                                writeln!(w, "{}[{}][{}] = {}", names[slot], outer, i, value)?;
                            }
                            Naming::SlotLabels(slot_labels) => {
                                writeln!(
                                    w,
                                    "{}[{}][\"{}\"][{}] = {}",
                                    group.name, outer, slot_labels[slot], i, value
                                )?;
                            }
                            Naming::Labelled if group.instances > 1 => {
                                writeln!(
                                    w,
                                    "{}[{}][{}][\"{}\"][{}] = {}",
                                    group.name,
                                    outer,
                                    instance,
                                    labels.get(gi, scalar),
                                    i,
                                    value
                                )?;
                            }
                            Naming::Labelled => {
                                writeln!(
                                    w,
                                    "{}[{}][\"{}\"][{}] = {}",
                                    group.name,
                                    outer,
                                    labels.get(gi, scalar),
                                    i,
                                    value
                                )?;
                            }
                        }
                    }
                }
            }
        }
    }
    Ok(())
}
