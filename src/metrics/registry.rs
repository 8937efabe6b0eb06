//! The registry mutex protects only the `key -> Row` maps; it is never held
//! across a row's own mutex or across caller-supplied work.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::row::{Row, RowDisplay};

/// A per-key count/duration accumulator with atomic snapshot rotation.
///
/// `Count` and `Duration` calls on the same key are linearizable with
/// respect to each other via the row's own mutex; [`MetricRegistry::reset`]
/// is linearizable with respect to all operations via the registry mutex,
/// which it holds only for the map swap itself.
///
/// Cloning a `MetricRegistry` is cheap and shares the same underlying
/// state — clone it into every task that needs to record metrics rather
/// than wrapping it in an `Arc` yourself.
#[derive(Clone)]
pub struct MetricRegistry {
    inner: Arc<Mutex<Maps>>,
}

struct Maps {
    current: HashMap<String, Arc<Row>>,
    prev: HashMap<String, Arc<Row>>,
}

impl Default for MetricRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricRegistry {
    /// Creates an empty registry with no rows in either `current` or `prev`.
    ///
    /// Unlike the source (`metric.NewMemoryMetric`), this constructor does
    /// not arm its own reset schedule — scheduling a periodic `reset()` is
    /// an application concern (see crate docs); call [`MetricRegistry::reset`]
    /// from whatever cron/timer the embedding application already runs.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Maps {
                current: HashMap::new(),
                prev: HashMap::new(),
            })),
        }
    }

    fn row(&self, key: &str) -> Arc<Row> {
        let mut maps = self.inner.lock().expect("metric registry mutex poisoned");
        if let Some(row) = maps.current.get(key) {
            return Arc::clone(row);
        }
        let row = Arc::new(Row::new());
        maps.current.insert(key.to_string(), Arc::clone(&row));
        row
    }

    /// Increments `key`'s count by 1, creating the row if it doesn't exist.
    pub fn count(&self, key: &str) {
        self.row(key).count();
    }

    /// Adds `dur` to `key`'s running total and records it as a sample,
    /// creating the row if it doesn't exist.
    pub fn duration(&self, key: &str, dur: Duration) {
        self.row(key).duration(dur);
    }

    /// Atomically moves `current` into `prev` and reinstalls an empty
    /// `current`. No row is ever shared between the two maps after this
    /// call returns.
    pub fn reset(&self) {
        let mut maps = self.inner.lock().expect("metric registry mutex poisoned");
        maps.prev = std::mem::take(&mut maps.current);
    }

    /// Returns a snapshot of every row in `current`, sorted by key
    /// ascending.
    pub fn current_metric(&self) -> Vec<RowDisplay> {
        let maps = self.inner.lock().expect("metric registry mutex poisoned");
        let mut rows: Vec<RowDisplay> = maps
            .current
            .iter()
            .map(|(key, row)| row.display(key))
            .collect();
        rows.sort_by(|a, b| a.key.cmp(&b.key));
        rows
    }

    /// Returns a snapshot of every row in `prev`, sorted by key ascending.
    pub fn prev_metric(&self) -> Vec<RowDisplay> {
        let maps = self.inner.lock().expect("metric registry mutex poisoned");
        let mut rows: Vec<RowDisplay> = maps
            .prev
            .iter()
            .map(|(key, row)| row.display(key))
            .collect();
        rows.sort_by(|a, b| a.key.cmp(&b.key));
        rows
    }

    /// Returns the duration at rank `ceil(percentile * N)` (1-indexed from
    /// the smallest sample) for `key`'s current row. `percentile` is
    /// expected in `[0, 1]`. Returns `Duration::ZERO` for an unknown key or
    /// a row with zero samples — unknown keys are not an error (§7).
    ///
    /// Note this lazily creates the row like the source does (`getRow` is
    /// called unconditionally), so querying an unknown key leaves behind an
    /// empty row in `current`.
    pub fn duration_percentile(&self, key: &str, percentile: f64) -> Duration {
        self.row(key).percentile(percentile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_and_duration_create_row_lazily() {
        let reg = MetricRegistry::new();
        assert!(reg.current_metric().is_empty());
        reg.count("route");
        assert_eq!(reg.current_metric().len(), 1);
        assert_eq!(reg.current_metric()[0].count, 1);
    }

    #[test]
    fn reset_moves_current_to_prev_atomically() {
        let reg = MetricRegistry::new();
        for i in 1..=100u64 {
            reg.duration("k", Duration::from_millis(i));
        }
        reg.count("k");
        reg.reset();

        assert!(reg.current_metric().is_empty());
        let prev = reg.prev_metric();
        assert_eq!(prev.len(), 1);
        assert_eq!(prev[0].count, 1);
        assert_eq!(prev[0].percentile_68, Duration::from_millis(69));

        reg.count("k");
        let current = reg.current_metric();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].count, 1);
        assert_eq!(current[0].percentile_68, Duration::ZERO);
    }

    #[test]
    fn unknown_key_percentile_is_zero() {
        let reg = MetricRegistry::new();
        assert_eq!(reg.duration_percentile("nope", 0.5), Duration::ZERO);
    }

    #[test]
    fn rows_are_sorted_by_key() {
        let reg = MetricRegistry::new();
        reg.count("zebra");
        reg.count("apple");
        reg.count("mango");
        let keys: Vec<&str> = reg
            .current_metric()
            .iter()
            .map(|r| r.key.as_str())
            .collect();
        assert_eq!(keys, vec!["apple", "mango", "zebra"]);
    }

    #[test]
    fn clone_shares_underlying_state() {
        let reg = MetricRegistry::new();
        let reg2 = reg.clone();
        reg.count("k");
        reg2.count("k");
        assert_eq!(reg.current_metric()[0].count, 2);
    }
}
