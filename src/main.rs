use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use clap::Parser;

use hwsweep::access::{
    discover_mmconfig_base, CfgIo, MmioWindow, MsrDevFiles, MMCONFIG_WINDOW_BYTES,
};
use hwsweep::dump;
use hwsweep::engine::{Sampler, StopReason};
use hwsweep::layout::{MachineLayout, MAX_SAMPLES};
use hwsweep::program;
use hwsweep::resolver::pci_cfg_index;
use hwsweep::signal;
use hwsweep::timeline::Timeline;
use hwsweep::topology::Topology;
use hwsweep::tsc;
use hwsweep::units::PlatformScalars;

#[derive(Debug, Parser)]
#[command(
    about = "Program and sample core and uncore performance counters into a timeline dump"
)]
struct Command {
    /// Sampling interval: one value is nanoseconds, two are seconds then
    /// nanoseconds; no value means one second.
    #[arg(num_args = 0..=2)]
    interval: Vec<u64>,
    /// Print programming and per-sweep overhead diagnostics.
    #[arg(short, long)]
    verbose: bool,
    /// Output file; defaults to <short-hostname>.perfcounts.out.
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// Directory holding the *.input event-assignment files.
    #[arg(long, default_value = ".")]
    input_dir: PathBuf,
}

fn sampling_interval(args: &[u64]) -> Result<Duration> {
    match args {
        [] => Ok(Duration::new(1, 0)),
        [ns] => {
            ensure!(
                *ns < 1_000_000_000,
                "sampling interval in ns cannot exceed 1,000,000,000"
            );
            Ok(Duration::new(0, *ns as u32))
        }
        [secs, ns] => {
            ensure!(
                *ns < 1_000_000_000,
                "sampling interval in ns cannot exceed 1,000,000,000"
            );
            Ok(Duration::new(*secs, *ns as u32))
        }
        _ => unreachable!("clap caps the interval at two values"),
    }
}

/// Every node writes into the same directory, so the file name carries the
/// hostname, truncated at the first dot.
fn default_output_path() -> Result<PathBuf> {
    let host = nix::unistd::gethostname().context("failed to get hostname")?;
    let host = host.to_string_lossy().into_owned();
    let short = host.split('.').next().unwrap_or(&host).to_string();
    Ok(PathBuf::from(format!("{}.perfcounts.out", short)))
}

fn run(opts: Command) -> Result<()> {
    let interval = sampling_interval(&opts.interval)?;
    let layout = MachineLayout::detect()?;
    let topo = Topology::probe()?;
    if opts.verbose {
        eprintln!(
            "INFO: {} active logical processors, sampling every {:?}",
            topo.nr_cpus(),
            interval
        );
    }

    let msr_io = MsrDevFiles::open_all(topo.nr_cpus())?;
    let base = discover_mmconfig_base()?;
    let cfg_io = MmioWindow::map(base, MMCONFIG_WINDOW_BYTES)?;

    // There is no framing or checksum on config-space reads, so prove the
    // mapping against the known-good signature register before trusting any
    // uncore address derived from it.
    let sig = layout.pci.signature;
    let found = cfg_io.read32(pci_cfg_index(sig.bus, sig.device, sig.function, 0))?;
    ensure!(
        found == sig.expect,
        "config-space signature mismatch at {:02x}:{:02x}.{}: expected {:#010x}, found {:#010x}",
        sig.bus,
        sig.device,
        sig.function,
        sig.expect,
        found
    );

    let stop = signal::install()?;

    let labels = program::load_and_program(
        &opts.input_dir,
        &layout,
        &topo,
        &msr_io,
        &cfg_io,
        opts.verbose,
    )?;

    let scalars = PlatformScalars::read(&msr_io, &topo)?;

    let path = match opts.output {
        Some(path) => path,
        None => default_output_path()?,
    };
    let file = File::create(&path)
        .with_context(|| format!("failed to create output file {}", path.display()))?;
    let mut out = BufWriter::new(file);
    dump::write_header(
        &mut out,
        &scalars,
        topo.nr_cpus(),
        tsc::rdtscp(),
        tsc::walltime(),
    )?;

    let mut timeline = Timeline::new(layout.groups, topo.nr_cpus(), MAX_SAMPLES);
    let sampler = Sampler::new(&layout, &topo, &msr_io, &cfg_io, opts.verbose);
    match sampler.run(&mut timeline, interval, stop)? {
        StopReason::CapacityReached => {
            eprintln!("INFO: timeline full after {} samples", timeline.len())
        }
        StopReason::DrainRequested => eprintln!(
            "INFO: caught SIGCONT, draining {} samples and shutting down",
            timeline.len()
        ),
    }

    let before = tsc::rdtscp();
    dump::write_samples(&mut out, layout.groups, topo.nr_cpus(), &timeline, &labels)?;
    out.flush()?;
    if opts.verbose {
        eprintln!(
            "OVERHEAD: writing all output took {} TSC cycles",
            tsc::rdtscp().wrapping_sub(before)
        );
    }
    Ok(())
}

fn main() -> Result<()> {
    let opts = Command::parse();
    run(opts)
}
