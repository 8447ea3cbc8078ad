//! Invalidation fan-out.
//!
//! A mutation declares the key filters whose data its write can change. After
//! the write settles, the fan-out marks every matching entry stale and
//! refetches the observed ones concurrently.

use tracing::debug;

use crate::cache::{InvalidateOptions, InvalidationReport, KeyFilter, QueryCache};

/// Drop filters that are repeated or covered by another filter in the set.
///
/// The union of matched keys is unchanged; order of the survivors is kept.
pub fn dedupe_filters(filters: &[KeyFilter]) -> Vec<KeyFilter> {
    let mut kept = Vec::new();
    for (i, filter) in filters.iter().enumerate() {
        let redundant = filters.iter().enumerate().any(|(j, other)| {
            i != j
                && filter.is_covered_by(other)
                && (!other.is_covered_by(filter) || j < i)
        });
        if !redundant {
            kept.push(filter.clone());
        }
    }
    kept
}

/// A declared set of filters to invalidate together.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FanOut {
    filters: Vec<KeyFilter>,
    options: InvalidateOptions,
}

impl FanOut {
    pub fn new(filters: impl IntoIterator<Item = KeyFilter>) -> Self {
        let filters: Vec<KeyFilter> = filters.into_iter().collect();
        Self {
            filters: dedupe_filters(&filters),
            options: InvalidateOptions::default(),
        }
    }

    pub fn with_refetch_active(mut self, refetch_active: bool) -> Self {
        self.options.refetch_active = refetch_active;
        self
    }

    pub fn filters(&self) -> &[KeyFilter] {
        &self.filters
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub async fn run(&self, cache: &QueryCache) -> InvalidationReport {
        if self.filters.is_empty() {
            return InvalidationReport::default();
        }
        let report = cache.invalidate_many(&self.filters, self.options).await;
        debug!(
            filters = self.filters.len(),
            invalidated = report.invalidated.len(),
            refetched = report.refetched.len(),
            failed = report.failed.len(),
            "Fan-out complete"
        );
        report
    }
}
