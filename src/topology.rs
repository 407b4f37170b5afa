//! Static processor/package mapping built once at startup.
//!
//! Uncore state is shared by every processor in a package, so each package
//! gets one designated representative through which all socket-scope and
//! uncore accesses go. The assignment below (processor 0 for package 0, the
//! last enumerated processor for package 1) is a policy valid only for the
//! symmetric dual-package nodes this tool targets, where processor numbering
//! is contiguous per package; general topologies would need real
//! processor-to-package discovery.

use anyhow::{ensure, Result};

use crate::layout::{MAX_LPROCS, NUM_SOCKETS};

pub struct Topology {
    nr_cpus: usize,
    proc_in_pkg: [usize; NUM_SOCKETS],
}

impl Topology {
    /// Enumerate active logical processors.
    pub fn probe() -> Result<Self> {
        let nr = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
        ensure!(nr > 0, "failed to count online processors");
        Self::with_nr_cpus(nr as usize)
    }

    pub fn with_nr_cpus(nr_cpus: usize) -> Result<Self> {
        ensure!(
            nr_cpus >= NUM_SOCKETS,
            "need at least one processor per package, found {}",
            nr_cpus
        );
        ensure!(
            nr_cpus <= MAX_LPROCS,
            "{} processors exceeds the supported maximum of {}",
            nr_cpus,
            MAX_LPROCS
        );
        Ok(Topology {
            nr_cpus,
            proc_in_pkg: [0, nr_cpus - 1],
        })
    }

    pub fn nr_cpus(&self) -> usize {
        self.nr_cpus
    }

    /// The logical processor used for all socket-scope and uncore accesses
    /// in `package`.
    pub fn representative(&self, package: usize) -> usize {
        self.proc_in_pkg[package]
    }

    /// Package owning `lproc` under the contiguous-numbering policy.
    pub fn package_of(&self, lproc: usize) -> usize {
        assert!(lproc < self.nr_cpus);
        if lproc < self.nr_cpus / 2 {
            0
        } else {
            1
        }
    }
}
