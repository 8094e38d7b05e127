pub mod events;
pub mod filter;
pub mod hll;
pub mod merge;
pub mod search;
pub mod types;

pub use merge::merge_aggregates;
pub use types::{
    sort_buckets, AggregateBucket, AggregateQuery, AggregateSource, Aggregates, FetchedAggregates,
    FetchedBucket,
};
