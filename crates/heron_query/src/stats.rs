//! Stats aggregation algebra: per-row counting into accumulators and
//! cross-peer folding of partial results.

use std::collections::HashMap;
use std::sync::Arc;

use heron_data::catalog::Column;
use heron_data::store::RowRef;

use crate::filter::Filter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsKind {
    Counter,
    Sum,
    Min,
    Max,
    Average,
}

/// One requested stats expression: a kind, an optional predicate and an
/// optional projected column (Sum/Min/Max/Average).
#[derive(Debug, Clone)]
pub struct StatsSpec {
    pub kind: StatsKind,
    pub filter: Option<Filter>,
    pub column: Option<Arc<Column>>,
}

impl StatsSpec {
    pub fn counter(filter: Filter) -> Self {
        Self {
            kind: StatsKind::Counter,
            filter: Some(filter),
            column: None,
        }
    }

    pub fn over(kind: StatsKind, column: Arc<Column>) -> Self {
        Self {
            kind,
            filter: None,
            column: Some(column),
        }
    }
}

/// Running state of one stats expression inside one group.
#[derive(Debug, Clone, PartialEq)]
pub struct StatsAccumulator {
    pub kind: StatsKind,
    pub value: f64,
    pub count: i64,
}

impl StatsAccumulator {
    fn new(kind: StatsKind) -> Self {
        Self {
            kind,
            value: 0.0,
            count: 0,
        }
    }

    /// Fold a contribution in. Used both for per-row counting and for
    /// merging partial peer results, so the semantics must agree:
    /// Counter/Sum/Average add values and counts, Min/Max keep the
    /// extremum, ignoring empty (count = 0) contributions.
    pub fn apply_value(&mut self, value: f64, count: i64) {
        match self.kind {
            StatsKind::Counter | StatsKind::Sum | StatsKind::Average => {
                self.value += value;
                self.count += count;
            }
            StatsKind::Min => {
                if count > 0 {
                    if self.count == 0 || value < self.value {
                        self.value = value;
                    }
                    self.count += count;
                }
            }
            StatsKind::Max => {
                if count > 0 {
                    if self.count == 0 || value > self.value {
                        self.value = value;
                    }
                    self.count += count;
                }
            }
        }
    }

    /// Final scalar for the response. Empty accumulators finalize to 0,
    /// including Average (never NaN).
    pub fn finalize(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        match self.kind {
            StatsKind::Average => self.value / self.count as f64,
            _ => self.value,
        }
    }
}

/// Fresh zero-state accumulators matching a stats spec list.
pub fn create_stats_copy(specs: &[StatsSpec]) -> Vec<StatsAccumulator> {
    specs.iter().map(|s| StatsAccumulator::new(s.kind)).collect()
}

/// Count one row into a group's accumulators.
pub fn count_stats(specs: &[StatsSpec], row: &RowRef, accumulators: &mut [StatsAccumulator]) {
    for (spec, acc) in specs.iter().zip(accumulators.iter_mut()) {
        if let Some(f) = &spec.filter {
            if !f.matches_row(row) {
                continue;
            }
        }
        match spec.kind {
            StatsKind::Counter => acc.apply_value(1.0, 1),
            _ => {
                let projected = spec
                    .column
                    .as_ref()
                    .map(|c| row.value(c).to_float())
                    .unwrap_or(0.0);
                acc.apply_value(projected, 1);
            }
        }
    }
}

/// Per-request stats merge state, keyed by the composite group key.
#[derive(Debug, Default)]
pub struct ResultSetStats {
    pub stats: HashMap<String, Vec<StatsAccumulator>>,
    pub total: usize,
    pub rows_scanned: usize,
}

impl ResultSetStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a partial result from one peer into this one.
    pub fn merge(&mut self, other: ResultSetStats) {
        for (key, accumulators) in other.stats {
            match self.stats.get_mut(&key) {
                None => {
                    self.stats.insert(key, accumulators);
                }
                Some(existing) => {
                    for (mine, theirs) in existing.iter_mut().zip(accumulators.iter()) {
                        mine.apply_value(theirs.value, theirs.count);
                    }
                }
            }
        }
        self.total += other.total;
        self.rows_scanned += other.rows_scanned;
    }
}
