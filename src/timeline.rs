//! Fixed-capacity timeline of samples.
//!
//! Storage for every declared scalar is allocated and zeroed up front, so
//! sampling never allocates. The store is append-only: one sample per
//! completed sweep, in strict chronological order. The `valid` flag is the
//! drain protocol of the sampling loop: cleared immediately before a sweep
//! begins and set when it commits, so a drain triggered while a sweep was in
//! flight can tell whether the most recent sample can be trusted.

use anyhow::{bail, Result};

use crate::layout::CounterGroup;

struct GroupSeries {
    /// Scalars contributed by this group to each sample.
    scalars: usize,
    /// `scalars * capacity` values, sample-major.
    values: Vec<u64>,
}

pub struct Timeline {
    capacity: usize,
    len: usize,
    valid: bool,
    tsc: Vec<u64>,
    wall: Vec<(i64, i64)>,
    groups: Vec<GroupSeries>,
}

impl Timeline {
    pub fn new(groups: &[CounterGroup], nr_cpus: usize, capacity: usize) -> Self {
        let groups = groups
            .iter()
            .map(|g| {
                let scalars = g.scalar_count(nr_cpus);
                GroupSeries {
                    scalars,
                    values: vec![0; scalars * capacity],
                }
            })
            .collect();
        Timeline {
            capacity,
            len: 0,
            valid: true,
            tsc: vec![0; capacity],
            wall: vec![(0, 0); capacity],
            groups,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.len == self.capacity
    }

    /// Open the next sample slot: clear the valid flag and stamp the
    /// timestamps. Refuses (rather than wraps) once capacity is reached.
    pub fn begin_sweep(&mut self, tsc: u64, wall: (i64, i64)) -> Result<()> {
        if self.is_full() {
            bail!(
                "timeline full: refusing to append beyond {} samples",
                self.capacity
            );
        }
        self.valid = false;
        self.tsc[self.len] = tsc;
        self.wall[self.len] = wall;
        Ok(())
    }

    /// Store one scalar of the in-flight sample.
    pub fn record(&mut self, group: usize, scalar: usize, value: u64) {
        debug_assert!(!self.valid, "record outside an open sweep");
        let series = &mut self.groups[group];
        assert!(scalar < series.scalars);
        series.values[self.len * series.scalars + scalar] = value;
    }

    /// Close the in-flight sample; it is now part of the timeline.
    pub fn commit_sweep(&mut self) {
        self.len += 1;
        self.valid = true;
    }

    /// Drain-time recovery: if the valid flag was never set for the most
    /// recent tick, the boundary of the last sample cannot be trusted and it
    /// is dropped. Returns whether a sample was discarded.
    pub fn discard_incomplete(&mut self) -> bool {
        if !self.valid && self.len > 0 {
            self.len -= 1;
            self.valid = true;
            true
        } else {
            false
        }
    }

    pub fn tsc(&self, sample: usize) -> u64 {
        assert!(sample < self.len);
        self.tsc[sample]
    }

    pub fn wall(&self, sample: usize) -> (i64, i64) {
        assert!(sample < self.len);
        self.wall[sample]
    }

    pub fn value(&self, group: usize, scalar: usize, sample: usize) -> u64 {
        assert!(sample < self.len);
        let series = &self.groups[group];
        assert!(scalar < series.scalars);
        series.values[sample * series.scalars + scalar]
    }
}
