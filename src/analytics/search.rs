//! Aggregate source backed by a search engine holding the analytics events.
//!
//! One request per cycle: a bool query scoping events to the pair and the
//! cursor, a terms aggregation on the variant attribute with a cardinality
//! of page sessions and a filter on the goal, plus a max on the timestamp.
//! Responses are read with typed keys:
//!
//! ```json
//! { "aggregations": {
//!     "max#timestamp": { "value": 1700000000000 },
//!     "sterms#test": { "buckets": [
//!         { "key": "1",
//!           "cardinality#impressions": { "value": 812 },
//!           "filter#conversions": { "doc_count": 64 } } ] } } }
//! ```

use serde_json::{json, Value};

use super::filter;
use super::types::{AggregateQuery, AggregateSource, FetchedAggregates, FetchedBucket};
use crate::error::{AbTestError, Result};

/// Query parameters sent with every search: no hits, typed aggregation keys.
pub const SEARCH_PARAMS: [(&str, &str); 2] = [
    ("filter_path", "-hits.hits,-aggregations.**._*"),
    ("typed_keys", ""),
];

/// Sends one search body and returns the decoded response.
pub trait SearchTransport: Send + Sync {
    fn search(&self, body: &Value) -> Result<Value>;
}

pub struct SearchAggregateSource<T> {
    transport: T,
}

impl<T: SearchTransport> SearchAggregateSource<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }
}

impl<T: SearchTransport> AggregateSource for SearchAggregateSource<T> {
    fn fetch_aggregates(&self, query: &AggregateQuery) -> Result<FetchedAggregates> {
        let body = build_search_request(query);
        let response = self.transport.search(&body).map_err(|e| match e {
            AbTestError::DataSource(_) => e,
            other => AbTestError::DataSource(format!("search failed: {}", other)),
        })?;
        parse_aggregation_response(&response)
    }
}

/// Search body for the events of one test on one subject newer than the cursor.
pub fn build_search_request(query: &AggregateQuery) -> Value {
    let variant_field = format!("attributes.{}.keyword", query.variant_attribute());
    let scope = filter::with_clauses(
        &query.query_filter,
        vec![
            json!({ "exists": { "field": variant_field } }),
            json!({ "range": { "event_timestamp": { "gt": query.since } } }),
        ],
    );
    let goal = filter::with_clauses(
        &query.goal_filter,
        vec![
            json!({ "term": { "event_type.keyword": query.goal_event } }),
            json!({ "term": { "attributes.eventTestId": query.test_id } }),
            json!({ "term": { "attributes.eventPostId": query.subject_id } }),
        ],
    );
    json!({
        "size": 0,
        "query": { "bool": scope },
        "aggs": {
            "test": {
                "terms": { "field": variant_field },
                "aggs": {
                    "conversions": { "filter": { "bool": goal } },
                    "impressions": {
                        "cardinality": { "field": "attributes.pageSession.keyword" }
                    },
                },
            },
            "timestamp": { "max": { "field": "event_timestamp" } },
        },
        "sort": { "event_timestamp": "desc" },
    })
}

pub fn parse_aggregation_response(response: &Value) -> Result<FetchedAggregates> {
    let Some(aggs) = response.get("aggregations") else {
        return Ok(FetchedAggregates::default());
    };

    // A max over zero documents comes back as null.
    let timestamp_max = aggs
        .get("max#timestamp")
        .and_then(|t| t.get("value"))
        .and_then(Value::as_f64)
        .map(|v| v as i64);

    let mut buckets = Vec::new();
    let rows = aggs
        .get("sterms#test")
        .and_then(|t| t.get("buckets"))
        .and_then(Value::as_array);
    for row in rows.into_iter().flatten() {
        let variant_index = parse_key(row.get("key"))?;
        let impressions = row
            .get("cardinality#impressions")
            .and_then(|v| v.get("value"))
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let conversions = row
            .get("filter#conversions")
            .and_then(|v| v.get("doc_count"))
            .and_then(Value::as_u64)
            .unwrap_or(0);
        buckets.push(FetchedBucket {
            variant_index,
            impressions,
            conversions,
        });
    }

    Ok(FetchedAggregates {
        timestamp_max,
        buckets,
    })
}

fn parse_key(key: Option<&Value>) -> Result<usize> {
    let parsed = match key {
        Some(Value::Number(n)) => n.as_u64().map(|n| n as usize),
        Some(Value::String(s)) => s.trim().parse::<usize>().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| {
        AbTestError::DataSource(format!("bucket key {:?} is not a variant index", key))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Canned(Result<Value>, std::sync::Mutex<Vec<Value>>);

    impl SearchTransport for Canned {
        fn search(&self, body: &Value) -> Result<Value> {
            self.1.lock().unwrap().push(body.clone());
            self.0.clone()
        }
    }

    fn query() -> AggregateQuery {
        AggregateQuery {
            test_id: "titles".to_string(),
            subject_id: 42,
            since: 1_700_000_000_000,
            query_filter: json!({ "must_not": [
                { "prefix": { "attributes.url.keyword": "https://example.com/?p=42" } }
            ] }),
            goal_filter: json!({}),
            goal_event: "click".to_string(),
        }
    }

    #[test]
    fn request_scopes_to_pair_and_cursor() {
        let body = build_search_request(&query());
        let scope = &body["query"]["bool"];
        assert_eq!(
            scope["filter"][0],
            json!({ "exists": { "field": "attributes.test_titles_42.keyword" } })
        );
        assert_eq!(scope["filter"][1]["range"]["event_timestamp"]["gt"], 1_700_000_000_000_i64);
        assert!(scope["must_not"].is_array());

        let test_agg = &body["aggs"]["test"];
        assert_eq!(test_agg["terms"]["field"], "attributes.test_titles_42.keyword");
        let goal = test_agg["aggs"]["conversions"]["filter"]["bool"]["filter"]
            .as_array()
            .unwrap();
        assert_eq!(goal[0], json!({ "term": { "event_type.keyword": "click" } }));
        assert_eq!(goal[2], json!({ "term": { "attributes.eventPostId": 42 } }));
        assert_eq!(body["size"], 0);
    }

    #[test]
    fn source_sends_request_and_decodes_response() {
        let response = json!({ "aggregations": {
            "max#timestamp": { "value": 1_700_000_000_500_i64 },
            "sterms#test": { "buckets": [
                { "key": "0", "cardinality#impressions": { "value": 10 },
                  "filter#conversions": { "doc_count": 1 } } ] } } });
        let transport = Canned(Ok(response), Default::default());
        let source = SearchAggregateSource::new(transport);
        let fetched = source.fetch_aggregates(&query()).unwrap();
        assert_eq!(fetched.timestamp_max, Some(1_700_000_000_500));
        assert_eq!(fetched.buckets.len(), 1);
        assert_eq!(source.transport.1.lock().unwrap().len(), 1);
    }

    #[test]
    fn transport_failure_is_a_data_source_error() {
        let refused = Err(AbTestError::Io("connection refused".into()));
        let transport = Canned(refused, Default::default());
        let err = SearchAggregateSource::new(transport)
            .fetch_aggregates(&query())
            .unwrap_err();
        assert!(matches!(err, AbTestError::DataSource(_)));
        assert!(err.is_transient());
    }

    #[test]
    fn parses_buckets_and_timestamp() {
        let response = json!({
            "hits": { "total": { "value": 1200 } },
            "aggregations": {
                "max#timestamp": { "value": 1_700_000_123_456_i64 },
                "sterms#test": { "buckets": [
                    { "key": "1", "doc_count": 900,
                      "cardinality#impressions": { "value": 500 },
                      "filter#conversions": { "doc_count": 45 } },
                    { "key": 0, "doc_count": 300,
                      "cardinality#impressions": { "value": 480 },
                      "filter#conversions": { "doc_count": 24 } }
                ]}
            }
        });
        let fetched = parse_aggregation_response(&response).unwrap();
        assert_eq!(fetched.timestamp_max, Some(1_700_000_123_456));
        assert_eq!(
            fetched.buckets,
            vec![
                FetchedBucket { variant_index: 1, impressions: 500, conversions: 45 },
                FetchedBucket { variant_index: 0, impressions: 480, conversions: 24 },
            ]
        );
    }

    #[test]
    fn null_timestamp_and_no_buckets_is_empty() {
        let response = json!({
            "aggregations": {
                "max#timestamp": { "value": null },
                "sterms#test": { "buckets": [] }
            }
        });
        assert!(parse_aggregation_response(&response).unwrap().is_empty());
    }

    #[test]
    fn missing_aggregations_is_empty() {
        assert!(parse_aggregation_response(&json!({})).unwrap().is_empty());
    }

    #[test]
    fn missing_sub_aggregations_count_as_zero() {
        let response = json!({ "aggregations": { "sterms#test": { "buckets": [ { "key": "2" } ] } } });
        let fetched = parse_aggregation_response(&response).unwrap();
        assert_eq!(fetched.buckets[0].impressions, 0);
        assert_eq!(fetched.buckets[0].conversions, 0);
    }

    #[test]
    fn non_numeric_key_is_data_source_error() {
        let response = json!({ "aggregations": { "sterms#test": { "buckets": [ { "key": "control" } ] } } });
        assert!(matches!(
            parse_aggregation_response(&response),
            Err(AbTestError::DataSource(_))
        ));
    }
}
