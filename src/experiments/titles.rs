//! Title experiments: visitors see alternative post titles and the winning
//! title replaces the post's own.

use std::sync::Arc;

use serde_json::{json, Value};

use super::config::{FilterRule, TestDefinition, WinnerCallback};
use crate::error::Result;

pub const TITLES_TEST_ID: &str = "titles";

/// Destination for a winning title, usually the post store.
pub trait TitleSink: Send + Sync {
    fn set_title(&self, subject_id: u64, title: &str) -> Result<()>;
}

/// Logs titles instead of storing them.
pub struct LoggedTitleSink;

impl TitleSink for LoggedTitleSink {
    fn set_title(&self, subject_id: u64, title: &str) -> Result<()> {
        tracing::info!("[abtest] Subject {} title set to {:?}", subject_id, title);
        Ok(())
    }
}

struct ApplyTitle {
    sink: Arc<dyn TitleSink>,
}

impl WinnerCallback for ApplyTitle {
    fn on_winner(&self, subject_id: u64, value: &str) -> Result<()> {
        self.sink.set_title(subject_id, value)
    }
}

/// The title test. `permalink` maps a subject to its page URL so clicks made
/// on the subject's own page are left out of the sample.
pub fn titles_test<P>(permalink: P, sink: Arc<dyn TitleSink>) -> TestDefinition
where
    P: Fn(u64) -> Option<String> + Send + Sync + 'static,
{
    TestDefinition::new(TITLES_TEST_ID)
        .with_label("Titles")
        .with_goal("click")
        .with_query_filter(FilterRule::computed(move |_test_id, subject_id| {
            exclude_own_page(permalink(subject_id))
        }))
        .with_winner_callback(ApplyTitle { sink })
}

fn exclude_own_page(url: Option<String>) -> Value {
    match url {
        Some(url) => json!({
            "must_not": [
                { "prefix": { "attributes.url.keyword": url } }
            ]
        }),
        None => json!({}),
    }
}

/// Permalink builder from a template containing `{id}`.
pub fn permalink_from_template(template: &str) -> impl Fn(u64) -> Option<String> + Send + Sync {
    let template = template.to_string();
    move |subject_id| Some(template.replace("{id}", &subject_id.to_string()))
}
