//! Search requests and result merging across chunks.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use strata_common::LogMessage;

/// Match-all query text.
pub const MATCH_ALL_QUERY: &str = "*";

/// Bucket documents by timestamp into fixed-width intervals.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateHistogram {
    pub interval_ms: i64,
}

/// Exact match on a document field.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldFilter {
    pub field: String,
    pub value: String,
}

/// A query against one partition's chunks.
///
/// `query_text` is a whitespace-separated conjunction of terms. A bare term
/// matches a token of the message text or any field value; `field:value`
/// matches a field exactly. Empty text or `*` matches everything.
/// The time range is inclusive on both ends.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SearchQuery {
    pub dataset: String,
    pub query_text: String,
    pub start_time_ms: i64,
    pub end_time_ms: i64,
    pub limit: usize,
    pub aggregation: Option<DateHistogram>,
    pub filters: Vec<FieldFilter>,
}

impl SearchQuery {
    pub fn new(
        dataset: impl Into<String>,
        query_text: impl Into<String>,
        start_time_ms: i64,
        end_time_ms: i64,
        limit: usize,
    ) -> Self {
        Self {
            dataset: dataset.into(),
            query_text: query_text.into(),
            start_time_ms,
            end_time_ms,
            limit,
            aggregation: None,
            filters: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_histogram(mut self, interval_ms: i64) -> Self {
        self.aggregation = Some(DateHistogram { interval_ms });
        self
    }

    #[must_use]
    pub fn with_filter(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.filters.push(FieldFilter {
            field: field.into(),
            value: value.into(),
        });
        self
    }

    /// Whether `[start_ms, end_ms]` intersects the query range.
    #[must_use]
    pub const fn overlaps(&self, start_ms: i64, end_ms: i64) -> bool {
        start_ms <= self.end_time_ms && end_ms >= self.start_time_ms
    }

    #[must_use]
    pub const fn contains(&self, timestamp_ms: i64) -> bool {
        timestamp_ms >= self.start_time_ms && timestamp_ms <= self.end_time_ms
    }

    /// Bucket key for a timestamp, if the query aggregates.
    #[must_use]
    pub fn bucket_key(&self, timestamp_ms: i64) -> Option<i64> {
        self.aggregation
            .as_ref()
            .filter(|h| h.interval_ms > 0)
            .map(|h| timestamp_ms.div_euclid(h.interval_ms) * h.interval_ms)
    }
}

/// What one chunk contributes to a query.
#[derive(Clone, Debug, Default)]
pub struct UnitSearchResult {
    /// Matching documents, newest first, at most `limit`.
    pub hits: Vec<LogMessage>,
    /// All matching documents, before the limit.
    pub total_hits: u64,
    pub buckets: BTreeMap<i64, u64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistogramBucket {
    pub key_ms: i64,
    pub doc_count: u64,
}

/// Merged answer to a query.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SearchResult {
    pub hits: Vec<LogMessage>,
    pub total_hits: u64,
    pub buckets: Vec<HistogramBucket>,
    pub took_micros: u64,
    /// Units that errored or missed the deadline.
    pub failed_nodes: u32,
    pub total_nodes: u32,
    pub total_snapshots: u32,
    /// Units that answered in time.
    pub snapshots_with_replicas: u32,
}

/// Newest first; id breaks ties so merges are deterministic.
pub(crate) fn sort_hits(hits: &mut [LogMessage]) {
    hits.sort_by(|a, b| {
        b.timestamp_ms
            .cmp(&a.timestamp_ms)
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// Folds per-unit results into a [`SearchResult`].
pub(crate) struct SearchResultAggregator {
    limit: usize,
    hits: Vec<LogMessage>,
    total_hits: u64,
    buckets: BTreeMap<i64, u64>,
    succeeded: u32,
    failed: u32,
}

impl SearchResultAggregator {
    pub(crate) const fn new(limit: usize) -> Self {
        Self {
            limit,
            hits: Vec::new(),
            total_hits: 0,
            buckets: BTreeMap::new(),
            succeeded: 0,
            failed: 0,
        }
    }

    pub(crate) fn add(&mut self, unit: UnitSearchResult) {
        self.succeeded += 1;
        self.total_hits += unit.total_hits;
        self.hits.extend(unit.hits);
        for (key, count) in unit.buckets {
            *self.buckets.entry(key).or_default() += count;
        }
    }

    pub(crate) const fn add_failure(&mut self) {
        self.failed += 1;
    }

    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn finish(mut self, took: Duration) -> SearchResult {
        sort_hits(&mut self.hits);
        self.hits.truncate(self.limit);
        let queried = self.succeeded + self.failed;
        SearchResult {
            hits: self.hits,
            total_hits: self.total_hits,
            buckets: self
                .buckets
                .into_iter()
                .map(|(key_ms, doc_count)| HistogramBucket { key_ms, doc_count })
                .collect(),
            took_micros: took.as_micros() as u64,
            failed_nodes: self.failed,
            total_nodes: queried,
            total_snapshots: queried,
            snapshots_with_replicas: self.succeeded,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str, ts: i64) -> LogMessage {
        LogMessage {
            id: id.to_string(),
            timestamp_ms: ts,
            service_name: None,
            message: String::new(),
            fields: BTreeMap::new(),
        }
    }

    #[test]
    fn test_bucket_key_floors_to_interval() {
        let q = SearchQuery::new("ds", "*", 0, 100, 10).with_histogram(10);
        assert_eq!(q.bucket_key(0), Some(0));
        assert_eq!(q.bucket_key(19), Some(10));
        assert_eq!(q.bucket_key(-1), Some(-10));
        assert_eq!(SearchQuery::new("ds", "*", 0, 1, 1).bucket_key(5), None);
    }

    #[test]
    fn test_overlap_is_inclusive() {
        let q = SearchQuery::new("ds", "*", 100, 200, 10);
        assert!(q.overlaps(200, 300));
        assert!(q.overlaps(0, 100));
        assert!(!q.overlaps(201, 300));
        assert!(!q.overlaps(0, 99));
    }

    #[test]
    fn test_aggregator_merges_units() {
        let mut agg = SearchResultAggregator::new(2);
        agg.add(UnitSearchResult {
            hits: vec![doc("a", 10), doc("b", 30)],
            total_hits: 2,
            buckets: BTreeMap::from([(0, 2)]),
        });
        agg.add(UnitSearchResult {
            hits: vec![doc("c", 20)],
            total_hits: 1,
            buckets: BTreeMap::from([(0, 1), (10, 1)]),
        });
        agg.add_failure();

        let result = agg.finish(Duration::from_micros(42));
        assert_eq!(result.total_hits, 3);
        let ids: Vec<_> = result.hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
        assert_eq!(
            result.buckets,
            vec![
                HistogramBucket {
                    key_ms: 0,
                    doc_count: 3
                },
                HistogramBucket {
                    key_ms: 10,
                    doc_count: 1
                }
            ]
        );
        assert_eq!(result.took_micros, 42);
        assert_eq!(result.total_nodes, 3);
        assert_eq!(result.failed_nodes, 1);
        assert_eq!(result.snapshots_with_replicas, 2);
    }
}
