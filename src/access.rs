//! Register-access channels.
//!
//! Two channels exist, both opened once at startup and owned for the process
//! lifetime: one MSR device file per logical processor, and one mapped window
//! over PCI configuration space. The sampling engine and the program loader
//! reach hardware only through the [`MsrIo`] and [`CfgIo`] traits, so tests
//! run against the in-memory implementations at the bottom of this module.
//!
//! A short read or write is treated as no better than no access at all:
//! silently storing a partial value would corrupt downstream computations
//! that depend on monotonic raw counters, so every width mismatch is fatal
//! and nothing is retried.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;

use anyhow::{bail, Context, Result};

/// Per-logical-processor register file access.
pub trait MsrIo {
    fn read(&self, lproc: usize, reg: u64) -> Result<u64>;
    fn write(&self, lproc: usize, reg: u64, value: u64) -> Result<()>;
}

/// PCI configuration-space access by 32-bit-word index.
pub trait CfgIo {
    fn read32(&self, word: u32) -> Result<u32>;
    fn write32(&self, word: u32, value: u32) -> Result<()>;

    /// A 64-bit counter field read as two consecutive config words.
    fn read64(&self, word: u32) -> Result<u64> {
        let low = self.read32(word)?;
        let high = self.read32(word + 1)?;
        Ok(((high as u64) << 32) | low as u64)
    }
}

/// The `/dev/cpu/N/msr` device files, one per active logical processor.
pub struct MsrDevFiles {
    files: Vec<File>,
}

impl MsrDevFiles {
    pub fn open_all(nr_cpus: usize) -> Result<Self> {
        let mut files = Vec::with_capacity(nr_cpus);
        for lproc in 0..nr_cpus {
            let path = format!("/dev/cpu/{}/msr", lproc);
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(&path)
                .with_context(|| format!("failed to open {}", path))?;
            files.push(file);
        }
        Ok(MsrDevFiles { files })
    }
}

impl MsrIo for MsrDevFiles {
    fn read(&self, lproc: usize, reg: u64) -> Result<u64> {
        let mut buf = [0u8; 8];
        let n = self.files[lproc]
            .read_at(&mut buf, reg)
            .with_context(|| format!("failed to read MSR {:#x} on processor {}", reg, lproc))?;
        if n != 8 {
            bail!(
                "short read of MSR {:#x} on processor {}: {} bytes",
                reg,
                lproc,
                n
            );
        }
        Ok(u64::from_ne_bytes(buf))
    }

    fn write(&self, lproc: usize, reg: u64, value: u64) -> Result<()> {
        let n = self.files[lproc]
            .write_at(&value.to_ne_bytes(), reg)
            .with_context(|| format!("failed to write MSR {:#x} on processor {}", reg, lproc))?;
        if n != 8 {
            // A half-applied control configuration is unsafe to sample from.
            bail!(
                "short write of MSR {:#x} on processor {}: {} bytes",
                reg,
                lproc,
                n
            );
        }
        Ok(())
    }
}

/// Paths the ACPI MCFG table may appear under.
const ACPI_MCFG_PATHS: [&str; 2] = [
    "/sys/firmware/acpi/tables/MCFG",
    "/sys/firmware/acpi/tables/MCFG1",
];

/// Byte offset of the base address field in the MCFG table.
const MCFG_BASE_OFFSET: u64 = 44;

/// Read the MMCONFIG base address from the ACPI tables.
pub fn discover_mmconfig_base() -> Result<u64> {
    for path in ACPI_MCFG_PATHS {
        let Ok(file) = File::open(path) else {
            continue;
        };
        let mut buf = [0u8; 8];
        if let Ok(8) = file.read_at(&mut buf, MCFG_BASE_OFFSET) {
            return Ok(u64::from_le_bytes(buf));
        }
    }
    bail!("cannot find the MMCONFIG base address in the ACPI MCFG tables");
}

/// 256 MiB covers every bus/device/function/offset the index formula can
/// produce for buses 0-255.
pub const MMCONFIG_WINDOW_BYTES: usize = 0x1000_0000;

/// Process-wide mapping of PCI configuration space, established once and
/// never remapped.
pub struct MmioWindow {
    ptr: *mut u32,
    words: usize,
}

impl MmioWindow {
    /// Map `size` bytes of `/dev/mem` starting at the discovered base.
    /// The fd may be closed right after mmap; the mapping persists.
    pub fn map(base: u64, size: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/mem")
            .context("failed to open /dev/mem")?;
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                base as libc::off_t,
            )
        };
        if ptr == libc::MAP_FAILED {
            bail!(
                "cannot mmap PCI configuration space from /dev/mem at {:#x}: {}",
                base,
                std::io::Error::last_os_error()
            );
        }
        Ok(MmioWindow {
            ptr: ptr as *mut u32,
            words: size / 4,
        })
    }
}

impl CfgIo for MmioWindow {
    fn read32(&self, word: u32) -> Result<u32> {
        assert!((word as usize) < self.words);
        Ok(unsafe { self.ptr.add(word as usize).read_volatile() })
    }

    fn write32(&self, word: u32, value: u32) -> Result<()> {
        assert!((word as usize) < self.words);
        unsafe { self.ptr.add(word as usize).write_volatile(value) };
        Ok(())
    }
}

impl Drop for MmioWindow {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.words * 4);
        }
    }
}

/// In-memory MSR channel for tests and dry runs. Unwritten registers read
/// as zero; registers marked failing simulate a short read.
#[derive(Default)]
pub struct MemMsr {
    regs: RefCell<HashMap<(usize, u64), u64>>,
    failing: RefCell<HashSet<(usize, u64)>>,
}

impl MemMsr {
    pub fn preset(&self, lproc: usize, reg: u64, value: u64) {
        self.regs.borrow_mut().insert((lproc, reg), value);
    }

    pub fn fail_on(&self, lproc: usize, reg: u64) {
        self.failing.borrow_mut().insert((lproc, reg));
    }

    pub fn get(&self, lproc: usize, reg: u64) -> Option<u64> {
        self.regs.borrow().get(&(lproc, reg)).copied()
    }
}

impl MsrIo for MemMsr {
    fn read(&self, lproc: usize, reg: u64) -> Result<u64> {
        if self.failing.borrow().contains(&(lproc, reg)) {
            bail!("short read of MSR {:#x} on processor {}: 0 bytes", reg, lproc);
        }
        Ok(self.get(lproc, reg).unwrap_or(0))
    }

    fn write(&self, lproc: usize, reg: u64, value: u64) -> Result<()> {
        if self.failing.borrow().contains(&(lproc, reg)) {
            bail!("short write of MSR {:#x} on processor {}: 0 bytes", reg, lproc);
        }
        self.preset(lproc, reg, value);
        Ok(())
    }
}

/// In-memory configuration-space window for tests and dry runs.
#[derive(Default)]
pub struct MemCfg {
    words: RefCell<HashMap<u32, u32>>,
}

impl MemCfg {
    pub fn preset(&self, word: u32, value: u32) {
        self.words.borrow_mut().insert(word, value);
    }

    pub fn preset64(&self, word: u32, value: u64) {
        self.preset(word, value as u32);
        self.preset(word + 1, (value >> 32) as u32);
    }

    pub fn get(&self, word: u32) -> Option<u32> {
        self.words.borrow().get(&word).copied()
    }
}

impl CfgIo for MemCfg {
    fn read32(&self, word: u32) -> Result<u32> {
        Ok(self.get(word).unwrap_or(0))
    }

    fn write32(&self, word: u32, value: u32) -> Result<()> {
        self.preset(word, value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read64_combines_words() {
        let cfg = MemCfg::default();
        cfg.preset(0x1400, 0xdead_beef);
        cfg.preset(0x1401, 0x0000_1234);
        assert_eq!(cfg.read64(0x1400).unwrap(), 0x0000_1234_dead_beef);
    }

    #[test]
    fn test_mem_msr_roundtrip() {
        let msr = MemMsr::default();
        msr.write(3, 0xC1, 42).unwrap();
        assert_eq!(msr.read(3, 0xC1).unwrap(), 42);
        assert_eq!(msr.read(3, 0xC2).unwrap(), 0);
    }

    #[test]
    fn test_mem_msr_short_read_is_error() {
        let msr = MemMsr::default();
        msr.fail_on(0, 0x309);
        let err = msr.read(0, 0x309).unwrap_err();
        assert!(err.to_string().contains("short read"));
    }
}
