use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    hash::Hash,
    ops::{Add, AddAssign},
};

use hashbrown::{hash_map::Entry, HashMap};
use itertools::Itertools;
use ldc_primitives::consts::num_to_comma_separated;
use serde::{Deserialize, Serialize};

use crate::loader::LoadErrorKind;

/// A report of the loads performed by an execution.
#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadReport {
    /// The number of successful loads.
    pub loads: u64,
    /// The number of code bytes appended to the code region.
    pub bytes_loaded: u64,
    /// The number of times the stack was moved onto the heap.
    pub evacuations: u64,
    /// The rejected loads, by kind.
    pub rejections: HashMap<LoadErrorKind, u64>,
}

impl LoadReport {
    pub(crate) fn record_load(&mut self, len: u64) {
        self.loads += 1;
        self.bytes_loaded += len;
    }

    pub(crate) fn record_evacuation(&mut self) {
        self.evacuations += 1;
    }

    pub(crate) fn record_rejection(&mut self, kind: LoadErrorKind) {
        *self.rejections.entry(kind).or_default() += 1;
    }

    /// Compute the total number of rejected loads.
    #[must_use]
    pub fn total_rejections(&self) -> u64 {
        self.rejections.values().sum()
    }
}

/// Combines two `HashMap`s together. If a key is in both maps, the values are added together.
fn hashmap_add_assign<K, V>(lhs: &mut HashMap<K, V>, rhs: HashMap<K, V>)
where
    K: Eq + Hash,
    V: AddAssign,
{
    for (k, v) in rhs {
        match lhs.entry(k) {
            Entry::Occupied(e) => *e.into_mut() += v,
            Entry::Vacant(e) => drop(e.insert(v)),
        }
    }
}

impl AddAssign for LoadReport {
    fn add_assign(&mut self, rhs: Self) {
        self.loads += rhs.loads;
        self.bytes_loaded += rhs.bytes_loaded;
        self.evacuations += rhs.evacuations;
        hashmap_add_assign(&mut self.rejections, rhs.rejections);
    }
}

impl Add for LoadReport {
    type Output = Self;

    fn add(mut self, rhs: Self) -> Self::Output {
        self += rhs;
        self
    }
}

impl Display for LoadReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        writeln!(
            f,
            "loads: {} ({} bytes), evacuations: {}",
            num_to_comma_separated(self.loads),
            num_to_comma_separated(self.bytes_loaded),
            num_to_comma_separated(self.evacuations)
        )?;

        writeln!(f, "rejections ({} total):", self.total_rejections())?;
        let width = self.rejections.keys().map(|kind| kind.to_string().len()).max().unwrap_or(0);
        for (kind, count) in self.rejections.iter().sorted_by_key(|(kind, count)| (!**count, **kind))
        {
            writeln!(f, "  {:<width$} {}", kind.to_string(), num_to_comma_separated(count))?;
        }

        Ok(())
    }
}
