//! Counter program loader.
//!
//! Consumes the declarative event-assignment files, resolves each record to
//! a register address, writes the control values, and keeps the label text
//! that gives every counter its identity in the dump. Assignments are loaded
//! once before sampling starts and are immutable afterwards.
//!
//! Any malformed or missing input is fatal here, before a single counter is
//! read: running with a partially-programmed counter set would produce a
//! timeline nobody can interpret.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{ensure, Context, Result};

use crate::access::{CfgIo, MsrIo};
use crate::layout::{msr, CounterGroup, MachineLayout, LABEL_MAX, NUM_SOCKETS};
use crate::resolver::{self, RegisterAddress};
use crate::topology::Topology;

/// Label text keyed by (group, scalar coordinate), filled during programming
/// and read only by the dump.
#[derive(Debug)]
pub struct Labels {
    per_group: Vec<Vec<String>>,
}

impl Labels {
    pub fn new(groups: &[CounterGroup], nr_cpus: usize) -> Self {
        Labels {
            per_group: groups
                .iter()
                .map(|g| vec![String::new(); g.scalar_count(nr_cpus)])
                .collect(),
        }
    }

    /// Bounded store: oversized labels are truncated rather than refused.
    fn set(&mut self, group: usize, scalar: usize, label: &str) {
        let mut text = label.to_string();
        if text.len() > LABEL_MAX {
            let mut end = LABEL_MAX;
            while !text.is_char_boundary(end) {
                end -= 1;
            }
            text.truncate(end);
        }
        self.per_group[group][scalar] = text;
    }

    pub fn get(&self, group: usize, scalar: usize) -> &str {
        &self.per_group[group][scalar]
    }
}

/// Per-processor control assignment: applies to every logical processor in
/// the inclusive scope range, at a register number given in the record.
#[derive(Debug, PartialEq)]
pub struct CoreControlRecord {
    pub core_min: usize,
    pub core_max: usize,
    pub reg: u64,
    pub value: u64,
    pub label: String,
}

/// Per-processor PerfEvtSel assignment; `slot` names the counter the label
/// belongs to.
#[derive(Debug, PartialEq)]
pub struct CoreEvtselRecord {
    pub core_min: usize,
    pub core_max: usize,
    pub reg: u64,
    pub slot: usize,
    pub value: u64,
    pub label: String,
}

#[derive(Debug, PartialEq)]
pub struct PcuEvtselRecord {
    pub package: usize,
    pub slot: usize,
    pub value: u64,
    pub label: String,
}

#[derive(Debug, PartialEq)]
pub struct ChaEvtselRecord {
    pub package: usize,
    pub cha: usize,
    pub slot: usize,
    pub value: u64,
    pub label: String,
}

/// IMC assignment addressed as (memory controller, DDR sub-channel); the
/// resolver collapses the pair into the flat channel index.
#[derive(Debug, PartialEq)]
pub struct ImcEvtselRecord {
    pub package: usize,
    pub unit: usize,
    pub subunit: usize,
    pub slot: usize,
    pub value: u64,
    pub label: String,
}

fn parse_dec(field: &str) -> Result<usize> {
    field
        .parse()
        .with_context(|| format!("bad decimal field {:?}", field))
}

fn parse_hex(field: &str) -> Result<u64> {
    let digits = field.trim_start_matches("0x");
    u64::from_str_radix(digits, 16).with_context(|| format!("bad hex field {:?}", field))
}

/// Split one input line into exactly `n` whitespace-delimited fields.
/// Blank lines yield `None`.
fn fields_of(line: &str, n: usize, what: &str, lineno: usize) -> Result<Option<Vec<String>>> {
    let fields: Vec<String> = line.split_whitespace().map(str::to_string).collect();
    if fields.is_empty() {
        return Ok(None);
    }
    ensure!(
        fields.len() == n,
        "malformed {} record at line {}: expected {} fields, found {}",
        what,
        lineno,
        n,
        fields.len()
    );
    Ok(Some(fields))
}

pub fn parse_core_control<R: BufRead>(input: R) -> Result<Vec<CoreControlRecord>> {
    let mut records = Vec::new();
    for (idx, line) in input.lines().enumerate() {
        let line = line?;
        let Some(f) = fields_of(&line, 5, "core control", idx + 1)? else {
            continue;
        };
        records.push(CoreControlRecord {
            core_min: parse_dec(&f[0])?,
            core_max: parse_dec(&f[1])?,
            reg: parse_hex(&f[2])?,
            value: parse_hex(&f[3])?,
            label: f[4].clone(),
        });
    }
    Ok(records)
}

pub fn parse_core_evtsel<R: BufRead>(input: R) -> Result<Vec<CoreEvtselRecord>> {
    let mut records = Vec::new();
    for (idx, line) in input.lines().enumerate() {
        let line = line?;
        let Some(f) = fields_of(&line, 6, "core PerfEvtSel", idx + 1)? else {
            continue;
        };
        records.push(CoreEvtselRecord {
            core_min: parse_dec(&f[0])?,
            core_max: parse_dec(&f[1])?,
            reg: parse_hex(&f[2])?,
            slot: parse_dec(&f[3])?,
            value: parse_hex(&f[4])?,
            label: f[5].clone(),
        });
    }
    Ok(records)
}

pub fn parse_pcu_evtsel<R: BufRead>(input: R) -> Result<Vec<PcuEvtselRecord>> {
    let mut records = Vec::new();
    for (idx, line) in input.lines().enumerate() {
        let line = line?;
        let Some(f) = fields_of(&line, 4, "PCU PerfEvtSel", idx + 1)? else {
            continue;
        };
        records.push(PcuEvtselRecord {
            package: parse_dec(&f[0])?,
            slot: parse_dec(&f[1])?,
            value: parse_hex(&f[2])?,
            label: f[3].clone(),
        });
    }
    Ok(records)
}

pub fn parse_cha_evtsel<R: BufRead>(input: R) -> Result<Vec<ChaEvtselRecord>> {
    let mut records = Vec::new();
    for (idx, line) in input.lines().enumerate() {
        let line = line?;
        let Some(f) = fields_of(&line, 5, "CHA PerfEvtSel", idx + 1)? else {
            continue;
        };
        records.push(ChaEvtselRecord {
            package: parse_dec(&f[0])?,
            cha: parse_dec(&f[1])?,
            slot: parse_dec(&f[2])?,
            value: parse_hex(&f[3])?,
            label: f[4].clone(),
        });
    }
    Ok(records)
}

pub fn parse_imc_evtsel<R: BufRead>(input: R) -> Result<Vec<ImcEvtselRecord>> {
    let mut records = Vec::new();
    for (idx, line) in input.lines().enumerate() {
        let line = line?;
        let Some(f) = fields_of(&line, 6, "IMC PerfEvtSel", idx + 1)? else {
            continue;
        };
        records.push(ImcEvtselRecord {
            package: parse_dec(&f[0])?,
            unit: parse_dec(&f[1])?,
            subunit: parse_dec(&f[2])?,
            slot: parse_dec(&f[3])?,
            value: parse_hex(&f[4])?,
            label: f[5].clone(),
        });
    }
    Ok(records)
}

fn open_input(dir: &Path, name: &str) -> Result<BufReader<File>> {
    let path = dir.join(name);
    let file = File::open(&path)
        .with_context(|| format!("failed to open counter input file {}", path.display()))?;
    Ok(BufReader::new(file))
}

/// Program every declared counter from the input files in `dir` and return
/// the label table. Control writes go through the same resolver the sampler
/// uses; any failed or short write aborts the run.
pub fn load_and_program(
    dir: &Path,
    layout: &MachineLayout,
    topo: &Topology,
    msr_io: &dyn MsrIo,
    cfg_io: &dyn CfgIo,
    verbose: bool,
) -> Result<Labels> {
    let mut labels = Labels::new(layout.groups, topo.nr_cpus());

    // Core control registers (not PerfEvtSel): fixed-counter enables,
    // freeze controls, and the like, at record-supplied register numbers.
    for rec in parse_core_control(open_input(dir, "core_msr_control.input")?)
        .context("in core_msr_control.input")?
    {
        ensure_core_range(rec.core_min, rec.core_max, topo)?;
        if verbose {
            eprintln!(
                "DEBUG: core control {}..={} MSR {:#x} := {:#x} ({})",
                rec.core_min, rec.core_max, rec.reg, rec.value, rec.label
            );
        }
        for lproc in rec.core_min..=rec.core_max {
            msr_io.write(lproc, rec.reg, rec.value)?;
        }
    }

    // Core PerfEvtSel registers; these carry the labels for core_counts.
    let (core_idx, core_group) = layout
        .group("core_counts")
        .expect("layout lacks core_counts");
    for rec in parse_core_evtsel(open_input(dir, "core_msr_perfevtsel.input")?)
        .context("in core_msr_perfevtsel.input")?
    {
        ensure_core_range(rec.core_min, rec.core_max, topo)?;
        ensure!(
            rec.slot < core_group.slots,
            "core PerfEvtSel slot {} out of range",
            rec.slot
        );
        for lproc in rec.core_min..=rec.core_max {
            msr_io.write(lproc, rec.reg, rec.value)?;
            labels.set(
                core_idx,
                core_group.scalar_index(lproc, 0, rec.slot),
                &rec.label,
            );
        }
    }

    // The UBox fixed counter (uncore clock) just needs its enable bit; no
    // input record describes it.
    for package in 0..NUM_SOCKETS {
        msr_io.write(
            topo.representative(package),
            msr::U_MSR_PMON_FIXED_CTL,
            0x0040_0000,
        )?;
    }

    let (pcu_idx, pcu_group) = layout.group("pcu_counts").expect("layout lacks pcu_counts");
    for rec in
        parse_pcu_evtsel(open_input(dir, "pcu_perfevtsel.input")?).context("in pcu_perfevtsel.input")?
    {
        ensure!(rec.package < NUM_SOCKETS, "PCU package {} out of range", rec.package);
        ensure!(
            rec.slot < pcu_group.ctl_slots,
            "PCU slot {} out of range",
            rec.slot
        );
        write_resolved(
            resolver::control_address(pcu_group, &layout.pci, rec.package, 0, rec.slot),
            rec.package,
            rec.value,
            topo,
            msr_io,
            cfg_io,
        )?;
        labels.set(pcu_idx, pcu_group.scalar_index(rec.package, 0, rec.slot), &rec.label);
    }

    // CHA: slots 0-3 are counter controls, 4-5 are the box filters. Filters
    // are programmed but input-only; no label is kept for them.
    let (cha_idx, cha_group) = layout.group("cha_counts").expect("layout lacks cha_counts");
    for rec in
        parse_cha_evtsel(open_input(dir, "cha_perfevtsel.input")?).context("in cha_perfevtsel.input")?
    {
        ensure!(rec.package < NUM_SOCKETS, "CHA package {} out of range", rec.package);
        ensure!(rec.cha < cha_group.instances, "CHA box {} out of range", rec.cha);
        ensure!(
            rec.slot < cha_group.ctl_slots,
            "CHA control slot {} out of range",
            rec.slot
        );
        write_resolved(
            resolver::control_address(cha_group, &layout.pci, rec.package, rec.cha, rec.slot),
            rec.package,
            rec.value,
            topo,
            msr_io,
            cfg_io,
        )?;
        if rec.slot < cha_group.slots {
            labels.set(
                cha_idx,
                cha_group.scalar_index(rec.package, rec.cha, rec.slot),
                &rec.label,
            );
        }
    }

    let (imc_idx, imc_group) = layout.group("imc_counts").expect("layout lacks imc_counts");
    for rec in
        parse_imc_evtsel(open_input(dir, "imc_perfevtsel.input")?).context("in imc_perfevtsel.input")?
    {
        ensure!(rec.package < NUM_SOCKETS, "IMC package {} out of range", rec.package);
        ensure!(rec.subunit < 3, "IMC subchannel {} out of range", rec.subunit);
        let channel = resolver::imc_channel(rec.unit, rec.subunit);
        ensure!(
            channel < imc_group.instances,
            "IMC channel {} (unit {}, subunit {}) out of range",
            channel,
            rec.unit,
            rec.subunit
        );
        ensure!(
            rec.slot < imc_group.ctl_slots,
            "IMC control slot {} out of range",
            rec.slot
        );
        write_resolved(
            resolver::control_address(imc_group, &layout.pci, rec.package, channel, rec.slot),
            rec.package,
            rec.value,
            topo,
            msr_io,
            cfg_io,
        )?;
        labels.set(
            imc_idx,
            imc_group.scalar_index(rec.package, channel, rec.slot),
            &rec.label,
        );
    }

    Ok(labels)
}

fn ensure_core_range(core_min: usize, core_max: usize, topo: &Topology) -> Result<()> {
    ensure!(
        core_min <= core_max && core_max < topo.nr_cpus(),
        "core range {}..={} outside the {} active processors",
        core_min,
        core_max,
        topo.nr_cpus()
    );
    Ok(())
}

fn write_resolved(
    addr: RegisterAddress,
    package: usize,
    value: u64,
    topo: &Topology,
    msr_io: &dyn MsrIo,
    cfg_io: &dyn CfgIo,
) -> Result<()> {
    match addr {
        RegisterAddress::Msr(reg) => msr_io.write(topo.representative(package), reg, value),
        // Config-space control registers are 32 bits wide.
        RegisterAddress::CfgWord(word) => cfg_io.write32(word, value as u32),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{MemCfg, MemMsr};
    use crate::resolver::pci_cfg_index;
    use std::io::Cursor;

    #[test]
    fn test_parse_core_evtsel() {
        let input = "0 3 186 0 0x0043041F INST_RETIRED\n\n4 7 187 1 4301C2 UOPS_RETIRED\n";
        let recs = parse_core_evtsel(Cursor::new(input)).unwrap();
        assert_eq!(recs.len(), 2);
        assert_eq!(
            recs[0],
            CoreEvtselRecord {
                core_min: 0,
                core_max: 3,
                reg: 0x186,
                slot: 0,
                value: 0x0043_041F,
                label: "INST_RETIRED".to_string(),
            }
        );
        assert_eq!(recs[1].reg, 0x187);
        assert_eq!(recs[1].slot, 1);
    }

    #[test]
    fn test_parse_rejects_malformed_record() {
        let err = parse_cha_evtsel(Cursor::new("0 1 2\n")).unwrap_err();
        assert!(err.to_string().contains("malformed"));
        let err = parse_imc_evtsel(Cursor::new("0 0 0 0 zz LABEL\n")).unwrap_err();
        assert!(err.to_string().contains("bad hex field"));
    }

    fn write_inputs(dir: &Path, imc_line: &str) {
        std::fs::write(
            dir.join("core_msr_control.input"),
            "0 3 0x38f 0x70000000f Enable_all_counters\n",
        )
        .unwrap();
        std::fs::write(
            dir.join("core_msr_perfevtsel.input"),
            "0 3 186 0 43041F INST_RETIRED\n",
        )
        .unwrap();
        std::fs::write(dir.join("pcu_perfevtsel.input"), "0 0 0x400000 PCU_CLOCKTICKS\n").unwrap();
        std::fs::write(
            dir.join("cha_perfevtsel.input"),
            "1 2 0 0x400000 CHA_CLOCKTICKS\n1 2 5 0x3b FILTER1_DEFAULT\n",
        )
        .unwrap();
        std::fs::write(dir.join("imc_perfevtsel.input"), imc_line).unwrap();
    }

    #[test]
    fn test_load_and_program_writes_controls_and_labels() {
        let dir = tempfile::tempdir().unwrap();
        write_inputs(dir.path(), "0 0 1 2 0x400304 CAS_COUNT_RD\n");

        let layout = MachineLayout::skylake_xeon();
        let topo = Topology::with_nr_cpus(8).unwrap();
        let msr_io = MemMsr::default();
        let cfg_io = MemCfg::default();

        let labels =
            load_and_program(dir.path(), &layout, &topo, &msr_io, &cfg_io, false).unwrap();

        // Core control applied to every processor in the range.
        for lproc in 0..=3 {
            assert_eq!(msr_io.get(lproc, 0x38F), Some(0x7_0000_000F));
            assert_eq!(msr_io.get(lproc, 0x186), Some(0x43_041F));
        }
        assert_eq!(msr_io.get(4, 0x38F), None);

        // UBox fixed-counter enable on both representatives.
        assert_eq!(msr_io.get(0, msr::U_MSR_PMON_FIXED_CTL), Some(0x0040_0000));
        assert_eq!(msr_io.get(7, msr::U_MSR_PMON_FIXED_CTL), Some(0x0040_0000));

        // PCU control through package 0's representative.
        assert_eq!(msr_io.get(0, msr::PCU_MSR_PMON_CTL), Some(0x40_0000));

        // CHA box 2 control and filter on package 1's representative.
        assert_eq!(msr_io.get(7, 0xE01 + 0x10 * 2), Some(0x40_0000));
        assert_eq!(msr_io.get(7, 0xE01 + 0x10 * 2 + 5), Some(0x3B));

        // IMC channel 3*0+1 = 1, slot 2: bus 0x3A, device 0x0A, function 6,
        // control offset 0xE0.
        let word = pci_cfg_index(0x3A, 0x0A, 0x6, 0xE0);
        assert_eq!(cfg_io.get(word), Some(0x40_0304));

        // Labels stored at the matching coordinates.
        let (core_idx, core) = layout.group("core_counts").unwrap();
        assert_eq!(labels.get(core_idx, core.scalar_index(2, 0, 0)), "INST_RETIRED");
        let (cha_idx, cha) = layout.group("cha_counts").unwrap();
        assert_eq!(
            labels.get(cha_idx, cha.scalar_index(1, 2, 0)),
            "CHA_CLOCKTICKS"
        );
        let (imc_idx, imc) = layout.group("imc_counts").unwrap();
        assert_eq!(
            labels.get(imc_idx, imc.scalar_index(0, 1, 2)),
            "CAS_COUNT_RD"
        );
        // Unprogrammed coordinates keep an empty label.
        assert_eq!(labels.get(imc_idx, imc.scalar_index(0, 0, 0)), "");
    }

    #[test]
    fn test_load_rejects_out_of_range_channel() {
        let dir = tempfile::tempdir().unwrap();
        write_inputs(dir.path(), "0 2 0 0 0x400304 CAS_COUNT_RD\n");

        let layout = MachineLayout::skylake_xeon();
        let topo = Topology::with_nr_cpus(8).unwrap();
        let err = load_and_program(
            dir.path(),
            &layout,
            &topo,
            &MemMsr::default(),
            &MemCfg::default(),
            false,
        )
        .unwrap_err();
        assert!(err.to_string().contains("out of range"));
    }

    #[test]
    fn test_missing_input_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let layout = MachineLayout::skylake_xeon();
        let topo = Topology::with_nr_cpus(4).unwrap();
        let err = load_and_program(
            dir.path(),
            &layout,
            &topo,
            &MemMsr::default(),
            &MemCfg::default(),
            false,
        )
        .unwrap_err();
        assert!(err.to_string().contains("failed to open counter input file"));
    }

    #[test]
    fn test_oversized_label_is_truncated() {
        let layout = MachineLayout::skylake_xeon();
        let mut labels = Labels::new(layout.groups, 4);
        let long = "X".repeat(200);
        labels.set(1, 0, &long);
        assert_eq!(labels.get(1, 0).len(), LABEL_MAX);
    }
}
