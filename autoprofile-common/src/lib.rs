//! Snapshot data shared between heap snapshot producers and the profiler engine.
//!
//! A [`Snapshot`] follows the pprof layout: a list of sample types naming the
//! value dimensions, and samples whose `values` line up with those types and
//! whose stacks are stored leaf-first.

use std::collections::HashSet;

use thiserror::Error;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("snapshot has no sample types")]
    NoSampleTypes,
    #[error("sample {index} has {found} values, expected {expected}")]
    ValueCount {
        index: usize,
        found: usize,
        expected: usize,
    },
    #[error("sample {index} references location with id 0")]
    ZeroLocationId { index: usize },
    #[error("location {id} is used with different addresses")]
    ConflictingLocation { id: u64 },
}

/// Names one value dimension of every sample, e.g. `inuse_space` / `bytes`.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ValueType {
    pub kind: String,
    pub unit: String,
}

impl ValueType {
    pub fn new(kind: &str, unit: &str) -> Self {
        Self {
            kind: kind.to_owned(),
            unit: unit.to_owned(),
        }
    }
}

/// One resolved source position of a location. A location carries several
/// lines when calls were inlined; the first line is the innermost one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Line {
    pub function: String,
    pub file: String,
    pub line: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Location {
    /// Non-zero id, unique per address within a snapshot
    pub id: u64,
    /// Absolute instruction address, 0 when unknown
    pub address: u64,
    /// Empty until symbolized
    pub lines: Vec<Line>,
}

impl Location {
    pub fn new(id: u64, address: u64) -> Self {
        Self {
            id,
            address,
            lines: Vec::new(),
        }
    }

    pub fn with_line(mut self, function: &str, file: &str, line: u32) -> Self {
        self.lines.push(Line {
            function: function.to_owned(),
            file: file.to_owned(),
            line,
        });
        self
    }

    pub fn is_symbolized(&self) -> bool {
        !self.lines.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Sample {
    /// Leaf-first, as captured
    pub locations: Vec<Location>,
    /// One value per [`Snapshot::sample_types`] entry
    pub values: Vec<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Snapshot {
    pub sample_types: Vec<ValueType>,
    pub samples: Vec<Sample>,
}

impl Snapshot {
    pub fn new(sample_types: Vec<ValueType>) -> Self {
        Self {
            sample_types,
            samples: Vec::new(),
        }
    }

    /// Position of the sample type called `kind`.
    pub fn value_index(&self, kind: &str) -> Option<usize> {
        self.sample_types.iter().position(|t| t.kind == kind)
    }

    pub fn locations_mut(&mut self) -> impl Iterator<Item = &mut Location> {
        self.samples
            .iter_mut()
            .flat_map(|sample| sample.locations.iter_mut())
    }

    /// Structural checks: every sample carries one value per sample type and
    /// location ids are non-zero and consistently bound to one address. A
    /// snapshot without samples needs no sample types.
    pub fn check_valid(&self) -> Result<(), SnapshotError> {
        if self.sample_types.is_empty() && !self.samples.is_empty() {
            return Err(SnapshotError::NoSampleTypes);
        }

        let expected = self.sample_types.len();
        let mut seen = HashSet::new();
        for (index, sample) in self.samples.iter().enumerate() {
            if sample.values.len() != expected {
                return Err(SnapshotError::ValueCount {
                    index,
                    found: sample.values.len(),
                    expected,
                });
            }
            for location in &sample.locations {
                if location.id == 0 {
                    return Err(SnapshotError::ZeroLocationId { index });
                }
                seen.insert((location.id, location.address));
            }
        }

        let mut ids = HashSet::new();
        for (id, _) in &seen {
            if !ids.insert(*id) {
                return Err(SnapshotError::ConflictingLocation { id: *id });
            }
        }

        Ok(())
    }
}
