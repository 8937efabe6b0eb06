//! Per-key count/duration accumulator with percentile queries and atomic
//! snapshot rotation.
//!
//! [`MetricRegistry`] is the entry point: it hands out [`row::Row`]s keyed
//! by an arbitrary string (an HTTP `path method`, a broker topic, anything
//! the caller wants to track) and lets [`registry::MetricRegistry::reset`]
//! roll the whole set into a `prev` snapshot without blocking concurrent
//! writers for more than the time it takes to swap two maps.

mod os_tree;
mod registry;
mod row;

pub use registry::MetricRegistry;
pub use row::{Row, RowDisplay};
