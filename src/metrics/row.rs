//! Per-key metric aggregate: a count, a running total duration, and an
//! order-statistic tree of individual durations.

use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use super::os_tree::OsTree;

/// Human-readable snapshot of a [`Row`], returned by
/// [`super::registry::MetricRegistry::current_metric`] and friends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowDisplay {
    /// The key this row was recorded under, e.g. an HTTP path+method.
    pub key: String,
    pub count: u64,
    pub total_duration: Duration,
    pub average_duration: Duration,
    pub percentile_68: Duration,
    pub percentile_95: Duration,
    pub percentile_997: Duration,
}

impl fmt::Display for RowDisplay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "key: {}, count: {}, dur: {:?}, aveDur: {:?}, p68: {:?}, p95: {:?}, p99.7: {:?}",
            self.key,
            self.count,
            self.total_duration,
            self.average_duration,
            self.percentile_68,
            self.percentile_95,
            self.percentile_997
        )
    }
}

struct RowState {
    count: u64,
    total_duration: Duration,
    durations: OsTree,
}

/// A single key's count/duration accumulator.
///
/// All fields live behind one internal mutex (the "row mutex" in the
/// design notes) which is never held across I/O and never acquired while
/// the registry mutex is held — the registry only ever hands out an
/// `Arc<Row>` and releases its own lock before a caller touches the row.
pub struct Row {
    state: Mutex<RowState>,
}

impl Default for Row {
    fn default() -> Self {
        Self::new()
    }
}

impl Row {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RowState {
                count: 0,
                total_duration: Duration::ZERO,
                durations: OsTree::new(),
            }),
        }
    }

    /// Increments the row's count by 1.
    pub fn count(&self) {
        let mut state = self.state.lock().expect("row mutex poisoned");
        state.count += 1;
    }

    /// Adds `dur` to the row's running total and records it as a sample.
    pub fn duration(&self, dur: Duration) {
        let mut state = self.state.lock().expect("row mutex poisoned");
        state.total_duration += dur;
        state
            .durations
            .insert_no_replace(dur.as_nanos().min(i64::MAX as u128) as i64);
    }

    /// Returns the duration at rank `ceil(percentile * N)`, 1-indexed from
    /// the smallest sample. `percentile` is expected in `[0, 1]`; a row
    /// with zero samples returns `Duration::ZERO`.
    pub fn percentile(&self, percentile: f64) -> Duration {
        let state = self.state.lock().expect("row mutex poisoned");
        percentile_of(&state.durations, percentile)
    }

    /// Renders a full snapshot of this row under `key`.
    pub fn display(&self, key: &str) -> RowDisplay {
        let state = self.state.lock().expect("row mutex poisoned");
        let average_duration = if state.count == 0 {
            Duration::ZERO
        } else {
            state.total_duration / u32::try_from(state.count).unwrap_or(u32::MAX)
        };
        RowDisplay {
            key: key.to_string(),
            count: state.count,
            total_duration: state.total_duration,
            average_duration,
            percentile_68: percentile_of(&state.durations, 0.6827),
            percentile_95: percentile_of(&state.durations, 0.9545),
            percentile_997: percentile_of(&state.durations, 0.9973),
        }
    }
}

fn percentile_of(durations: &OsTree, percentile: f64) -> Duration {
    if durations.is_empty() {
        return Duration::ZERO;
    }
    let rank = (percentile * durations.len() as f64).ceil() as i64;
    let rank = rank.max(1) as usize;
    match durations.get_by_rank(rank) {
        Some(nanos) => Duration::from_nanos(nanos.max(0) as u64),
        None => Duration::ZERO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_accumulates() {
        let row = Row::new();
        row.count();
        row.count();
        row.count();
        assert_eq!(row.display("k").count, 3);
    }

    #[test]
    fn duration_accumulates_total() {
        let row = Row::new();
        row.duration(Duration::from_millis(10));
        row.duration(Duration::from_millis(20));
        let d = row.display("k");
        assert_eq!(d.total_duration, Duration::from_millis(30));
    }

    #[test]
    fn average_duration_is_total_over_count() {
        let row = Row::new();
        row.count();
        row.count();
        row.duration(Duration::from_millis(10));
        row.duration(Duration::from_millis(20));
        let d = row.display("k");
        // average_duration is independent of count() calls in the source
        // design; it divides total_duration by Count, which both Count()
        // and Duration() share.
        assert_eq!(d.average_duration, Duration::from_millis(30) / 2);
    }

    #[test]
    fn empty_row_percentile_is_zero() {
        let row = Row::new();
        assert_eq!(row.percentile(0.5), Duration::ZERO);
        assert_eq!(row.display("k").percentile_68, Duration::ZERO);
    }

    #[test]
    fn percentiles_over_one_to_one_hundred_milliseconds() {
        let row = Row::new();
        for i in 1..=100u64 {
            row.duration(Duration::from_millis(i));
        }
        let d = row.display("k");
        assert_eq!(d.percentile_68, Duration::from_millis(69));
        assert_eq!(d.percentile_95, Duration::from_millis(96));
        assert_eq!(d.percentile_997, Duration::from_millis(100));
    }

    #[test]
    fn display_format_matches_source_layout() {
        let row = Row::new();
        row.count();
        row.duration(Duration::from_millis(5));
        let rendered = row.display("route").to_string();
        assert!(rendered.starts_with("key: route, count: 1, dur:"));
        assert!(rendered.contains("p68:"));
        assert!(rendered.contains("p99.7:"));
    }
}
