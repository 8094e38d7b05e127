//! Shared types for fetching per-variant aggregates from the analytics store.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Accumulated counts for one variant since the test started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateBucket {
    /// Unique exposed page sessions (a cardinality estimate).
    pub size: u64,
    /// Conversion events.
    pub hits: u64,
}

impl AggregateBucket {
    pub fn new(size: u64, hits: u64) -> Self {
        Self { size, hits }
    }
}

/// Buckets ordered by variant index. Index 0 is the control.
pub type Aggregates = Vec<AggregateBucket>;

/// One bucket row as returned by the data source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchedBucket {
    pub variant_index: usize,
    pub impressions: u64,
    pub conversions: u64,
}

/// Result of one delta fetch. Both fields empty is a valid "nothing new" answer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchedAggregates {
    pub timestamp_max: Option<i64>,
    pub buckets: Vec<FetchedBucket>,
}

impl FetchedAggregates {
    pub fn is_empty(&self) -> bool {
        self.timestamp_max.is_none() && self.buckets.is_empty()
    }
}

/// Everything a data source needs to scope a delta query to one test on one subject.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateQuery {
    pub test_id: String,
    pub subject_id: u64,
    /// Only events strictly newer than this epoch-millis cursor count.
    pub since: i64,
    /// Bool filter narrowing the overall event set.
    pub query_filter: Value,
    /// Bool filter selecting conversion events.
    pub goal_filter: Value,
    /// Event type counted as a conversion (goal with any `:selector` suffix removed).
    pub goal_event: String,
}

impl AggregateQuery {
    /// Event attribute holding the variant index a visitor was shown.
    pub fn variant_attribute(&self) -> String {
        format!("test_{}_{}", self.test_id, self.subject_id)
    }
}

/// Analytics query layer consumed by the lifecycle controller.
pub trait AggregateSource: Send + Sync {
    fn fetch_aggregates(&self, query: &AggregateQuery) -> Result<FetchedAggregates>;
}

/// Place fetched rows at their variant index in a zero-filled vector.
///
/// Rows for the same index are summed. Rows pointing past the configured
/// variant list come from an earlier configuration and are dropped.
pub fn sort_buckets(fetched: &[FetchedBucket], variant_count: usize) -> Aggregates {
    let mut sorted = vec![AggregateBucket::default(); variant_count];
    for row in fetched {
        match sorted.get_mut(row.variant_index) {
            Some(bucket) => {
                bucket.size = bucket.size.saturating_add(row.impressions);
                bucket.hits = bucket.hits.saturating_add(row.conversions);
            }
            None => tracing::warn!(
                "[abtest] Dropping bucket for unknown variant {} (test has {} variants)",
                row.variant_index,
                variant_count
            ),
        }
    }
    sorted
}
