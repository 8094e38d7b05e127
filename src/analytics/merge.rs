//! Merge of incremental per-variant aggregates into persisted state.
//!
//! Cardinality estimates cannot be unioned after the fact, so the incoming
//! side is always a delta covering only events newer than the stored cursor.
//! The lifecycle controller scopes every fetch that way; this module relies on
//! it and simply adds.

use super::types::{AggregateBucket, Aggregates};

/// Add `incoming` deltas to `previous`, variant by variant.
///
/// The result is as long as the longer input; a variant missing on one side
/// counts as zero there. Sums saturate so counts never decrease.
pub fn merge_aggregates(previous: &[AggregateBucket], incoming: &[AggregateBucket]) -> Aggregates {
    let len = previous.len().max(incoming.len());
    (0..len)
        .map(|i| {
            let prev = previous.get(i).copied().unwrap_or_default();
            let delta = incoming.get(i).copied().unwrap_or_default();
            AggregateBucket {
                size: prev.size.saturating_add(delta.size),
                hits: prev.hits.saturating_add(delta.hits),
            }
        })
        .collect()
}
