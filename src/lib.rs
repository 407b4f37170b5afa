//! hwsweep: programs and samples all of the core and uncore hardware
//! performance counters on a node, then dumps the whole timeline.
//!
//! The job of this tool is not to think; thinking happens in
//! post-processing. Its job is to program counters from declarative input,
//! sweep every counter group at a fixed interval into a bounded in-memory
//! timeline, and emit everything in a format that loses no information.
//!
//! # Modules
//!
//! - [`layout`] - counter-group declarations and machine-specific tables
//! - [`resolver`] - coordinate-to-register-address resolution
//! - [`topology`] - processor/package mapping and representatives
//! - [`access`] - MSR device files and the PCI config-space window
//! - [`program`] - event-assignment loading and counter programming
//! - [`engine`] - the sampling sweep loop
//! - [`timeline`] - fixed-capacity sample store
//! - [`dump`] - output serialization
//! - [`units`] - read-once platform scale factors
//! - [`signal`] - SIGCONT drain request
//! - [`tsc`] - cycle counter and wall-clock stamps

pub mod access;
pub mod dump;
pub mod engine;
pub mod layout;
pub mod program;
pub mod resolver;
pub mod signal;
pub mod timeline;
pub mod topology;
pub mod tsc;
pub mod units;
