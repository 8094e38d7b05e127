//! Aggregate source backed by a newline-delimited JSON event log.
//!
//! Each line is one analytics event:
//!
//! ```json
//! { "event_type": "click", "event_timestamp": 1700000000000,
//!   "attributes": { "test_titles_42": "1", "pageSession": "abc",
//!                   "eventTestId": "titles", "eventPostId": "42" } }
//! ```
//!
//! Impressions are unique `pageSession` values per variant (HyperLogLog
//! estimate); conversions are goal events carrying the test and subject ids.

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use serde_json::{json, Value};

use super::filter;
use super::hll::HllSketch;
use super::types::{AggregateQuery, AggregateSource, FetchedAggregates, FetchedBucket};
use crate::error::{AbTestError, Result};

pub struct EventLogSource {
    path: PathBuf,
}

impl EventLogSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AggregateSource for EventLogSource {
    fn fetch_aggregates(&self, query: &AggregateQuery) -> Result<FetchedAggregates> {
        let file = match std::fs::File::open(&self.path) {
            Ok(f) => f,
            // No events recorded yet.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(FetchedAggregates::default())
            }
            Err(e) => {
                return Err(AbTestError::DataSource(format!(
                    "cannot open event log {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };
        let lines = BufReader::new(file).lines().map(|line| {
            line.map_err(|e| AbTestError::DataSource(format!("event log read failed: {}", e)))
        });
        aggregate_events(lines, query)
    }
}

#[derive(Default)]
struct VariantTally {
    sessions: HllSketch,
    conversions: u64,
}

/// Bucket events newer than `query.since` by variant.
pub fn aggregate_events<I>(lines: I, query: &AggregateQuery) -> Result<FetchedAggregates>
where
    I: IntoIterator<Item = Result<String>>,
{
    let variant_attr = format!("attributes.{}", query.variant_attribute());
    let scope = filter::with_clauses(
        &query.query_filter,
        vec![
            json!({ "exists": { "field": variant_attr } }),
            json!({ "range": { "event_timestamp": { "gt": query.since } } }),
        ],
    );
    let goal = filter::with_clauses(
        &query.goal_filter,
        vec![
            json!({ "term": { "event_type": query.goal_event } }),
            json!({ "term": { "attributes.eventTestId": query.test_id } }),
            json!({ "term": { "attributes.eventPostId": query.subject_id } }),
        ],
    );

    let mut tallies: BTreeMap<usize, VariantTally> = BTreeMap::new();
    let mut timestamp_max: Option<i64> = None;
    let mut skipped = 0usize;

    for line in lines {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let event: Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(_) => {
                skipped += 1;
                continue;
            }
        };
        if !filter::matches(&scope, &event)? {
            continue;
        }
        let Some(variant) = variant_index(&event, &query.variant_attribute()) else {
            skipped += 1;
            continue;
        };
        if let Some(ts) = event.get("event_timestamp").and_then(Value::as_i64) {
            timestamp_max = Some(timestamp_max.map_or(ts, |m| m.max(ts)));
        }

        let tally = tallies.entry(variant).or_default();
        if let Some(session) = event
            .get("attributes")
            .and_then(|a| a.get("pageSession"))
            .and_then(Value::as_str)
        {
            tally.sessions.insert(session);
        }
        if filter::matches(&goal, &event)? {
            tally.conversions += 1;
        }
    }

    if skipped > 0 {
        tracing::warn!(
            "[abtest] Skipped {} unreadable events for test {} on subject {}",
            skipped,
            query.test_id,
            query.subject_id
        );
    }

    let buckets = tallies
        .into_iter()
        .map(|(variant_index, tally)| FetchedBucket {
            variant_index,
            impressions: tally.sessions.estimate(),
            conversions: tally.conversions,
        })
        .collect();

    Ok(FetchedAggregates {
        timestamp_max,
        buckets,
    })
}

fn variant_index(event: &Value, attribute: &str) -> Option<usize> {
    match event.get("attributes")?.get(attribute)? {
        Value::String(s) => s.trim().parse().ok(),
        Value::Number(n) => n.as_u64().map(|n| n as usize),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn query(since: i64) -> AggregateQuery {
        AggregateQuery {
            test_id: "titles".to_string(),
            subject_id: 42,
            since,
            query_filter: json!({}),
            goal_filter: json!({}),
            goal_event: "click".to_string(),
        }
    }

    fn event(ts: i64, event_type: &str, variant: &str, session: &str) -> String {
        json!({
            "event_type": event_type,
            "event_timestamp": ts,
            "attributes": {
                "test_titles_42": variant,
                "pageSession": session,
                "eventTestId": "titles",
                "eventPostId": "42",
                "url": "https://example.com/listing/"
            }
        })
        .to_string()
    }

    fn ok_lines(lines: Vec<String>) -> Vec<Result<String>> {
        lines.into_iter().map(Ok).collect()
    }

    #[test]
    fn counts_unique_sessions_and_goal_events_per_variant() {
        let lines = ok_lines(vec![
            event(10, "pageView", "0", "s1"),
            event(11, "pageView", "0", "s2"),
            event(12, "click", "0", "s2"),
            event(13, "pageView", "1", "s3"),
            event(14, "click", "1", "s3"),
            event(15, "click", "1", "s3"),
        ]);
        let fetched = aggregate_events(lines, &query(0)).unwrap();
        assert_eq!(fetched.timestamp_max, Some(15));
        assert_eq!(
            fetched.buckets,
            vec![
                FetchedBucket { variant_index: 0, impressions: 2, conversions: 1 },
                FetchedBucket { variant_index: 1, impressions: 1, conversions: 2 },
            ]
        );
    }

    #[test]
    fn ignores_events_at_or_before_cursor() {
        let lines = ok_lines(vec![
            event(10, "click", "0", "s1"),
            event(20, "click", "0", "s2"),
        ]);
        let fetched = aggregate_events(lines, &query(10)).unwrap();
        assert_eq!(fetched.timestamp_max, Some(20));
        assert_eq!(fetched.buckets[0].impressions, 1);
        assert_eq!(fetched.buckets[0].conversions, 1);
    }

    #[test]
    fn ignores_events_from_other_subjects_and_garbage_lines() {
        let other = json!({
            "event_type": "click",
            "event_timestamp": 30,
            "attributes": { "test_titles_7": "1", "pageSession": "x" }
        })
        .to_string();
        let lines = ok_lines(vec![other, "not json".to_string(), String::new()]);
        let fetched = aggregate_events(lines, &query(0)).unwrap();
        assert!(fetched.is_empty());
    }

    #[test]
    fn goal_filter_narrows_conversions() {
        let mut q = query(0);
        q.goal_filter = json!({ "must_not": [{ "prefix": { "attributes.url": "https://example.com/listing/" } }] });
        let lines = ok_lines(vec![event(1, "click", "0", "s1")]);
        let fetched = aggregate_events(lines, &q).unwrap();
        assert_eq!(fetched.buckets[0].impressions, 1);
        assert_eq!(fetched.buckets[0].conversions, 0);
    }

    #[test]
    fn query_filter_excludes_events_entirely() {
        let mut q = query(0);
        q.query_filter = json!({ "must_not": [{ "prefix": { "attributes.url.keyword": "https://example.com/listing/" } }] });
        let lines = ok_lines(vec![event(1, "click", "0", "s1")]);
        assert!(aggregate_events(lines, &q).unwrap().is_empty());
    }

    #[test]
    fn missing_log_file_is_empty_result() {
        let dir = tempfile::tempdir().unwrap();
        let source = EventLogSource::new(dir.path().join("events.ndjson"));
        assert!(source.fetch_aggregates(&query(0)).unwrap().is_empty());
    }

    #[test]
    fn reads_events_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.ndjson");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "{}", event(5, "pageView", "1", "s1")).unwrap();
        writeln!(file, "{}", event(6, "click", "1", "s1")).unwrap();
        drop(file);

        let fetched = EventLogSource::new(&path).fetch_aggregates(&query(0)).unwrap();
        assert_eq!(
            fetched.buckets,
            vec![FetchedBucket { variant_index: 1, impressions: 1, conversions: 1 }]
        );
    }
}
