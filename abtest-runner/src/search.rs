use std::time::Duration;

use abtest::analytics::search::{SearchTransport, SEARCH_PARAMS};
use abtest::{AbTestError, Result};
use serde_json::Value;

/// Blocking HTTP transport to a `_search` endpoint.
pub struct HttpSearchTransport {
    agent: ureq::Agent,
    url: String,
}

impl HttpSearchTransport {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
            url: url.into(),
        }
    }
}

impl SearchTransport for HttpSearchTransport {
    fn search(&self, body: &Value) -> Result<Value> {
        let mut request = self.agent.post(&self.url);
        for (key, value) in SEARCH_PARAMS {
            request = request.query(key, value);
        }
        let response = request.send_json(body).map_err(|e| {
            AbTestError::DataSource(format!("search request to {} failed: {}", self.url, e))
        })?;
        response.into_json::<Value>().map_err(|e| {
            AbTestError::DataSource(format!("search response from {} unreadable: {}", self.url, e))
        })
    }
}
