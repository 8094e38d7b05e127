use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::analytics::{filter, Aggregates};
use crate::error::{AbTestError, Result};

pub const DEFAULT_TRAFFIC_PERCENTAGE: u8 = 35;
pub const DEFAULT_TEST_DURATION_MS: i64 = 30 * 24 * 60 * 60 * 1000;

// ── Policy ──────────────────────────────────────────────────────────

/// Thresholds used when calling a winner.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationPolicy {
    /// Minimum of `n*p` and `n*(1-p)` for the normal approximation to hold.
    pub min_expected_count: f64,
    /// A leading variant wins when its p-value is strictly below this.
    pub significance_threshold: f64,
}

impl Default for EvaluationPolicy {
    fn default() -> Self {
        Self {
            min_expected_count: 5.0,
            significance_threshold: 0.01,
        }
    }
}

impl EvaluationPolicy {
    pub fn validate(&self) -> Result<()> {
        if !self.min_expected_count.is_finite() || self.min_expected_count < 0.0 {
            return Err(AbTestError::InvalidConfig(
                "minExpectedCount must be a non-negative number".to_string(),
            ));
        }
        if !(self.significance_threshold > 0.0 && self.significance_threshold < 1.0) {
            return Err(AbTestError::InvalidConfig(
                "significanceThreshold must be in (0.0, 1.0) exclusive".to_string(),
            ));
        }
        Ok(())
    }
}

// ── Test definition ─────────────────────────────────────────────────

type FilterFn = dyn Fn(&str, u64) -> Value + Send + Sync;

/// Bool filter supplied by a test definition, fixed or computed per subject.
#[derive(Clone)]
pub enum FilterRule {
    Static(Value),
    Computed(Arc<FilterFn>),
}

impl FilterRule {
    pub fn computed<F>(f: F) -> Self
    where
        F: Fn(&str, u64) -> Value + Send + Sync + 'static,
    {
        FilterRule::Computed(Arc::new(f))
    }

    pub fn resolve(&self, test_id: &str, subject_id: u64) -> Value {
        match self {
            FilterRule::Static(value) => value.clone(),
            FilterRule::Computed(f) => f(test_id, subject_id),
        }
    }
}

impl Default for FilterRule {
    fn default() -> Self {
        FilterRule::Static(json!({}))
    }
}

impl fmt::Debug for FilterRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterRule::Static(value) => f.debug_tuple("Static").field(value).finish(),
            FilterRule::Computed(_) => f.write_str("Computed(..)"),
        }
    }
}

/// Applies the winning variant to the subject once a test is decided.
pub trait WinnerCallback: Send + Sync {
    fn on_winner(&self, subject_id: u64, value: &str) -> Result<()>;
}

impl<F> WinnerCallback for F
where
    F: Fn(u64, &str) -> Result<()> + Send + Sync,
{
    fn on_winner(&self, subject_id: u64, value: &str) -> Result<()> {
        self(subject_id, value)
    }
}

pub struct NoopWinner;

impl WinnerCallback for NoopWinner {
    fn on_winner(&self, _subject_id: u64, _value: &str) -> Result<()> {
        Ok(())
    }
}

/// Produces the output shown for a variant value.
pub trait VariantRenderer: Send + Sync {
    fn render(&self, value: &str, subject_id: u64, args: &Value) -> String;
}

pub struct PlainRenderer;

impl VariantRenderer for PlainRenderer {
    fn render(&self, value: &str, _subject_id: u64, _args: &Value) -> String {
        value.to_string()
    }
}

#[derive(Clone)]
pub struct TestDefinition {
    pub id: String,
    pub label: String,
    /// Conversion event, optionally `eventType:selector`.
    pub goal: String,
    pub query_filter: FilterRule,
    pub goal_filter: FilterRule,
    pub variant_renderer: Arc<dyn VariantRenderer>,
    pub winner_callback: Arc<dyn WinnerCallback>,
}

impl TestDefinition {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            label: id.clone(),
            id,
            goal: "click".to_string(),
            query_filter: FilterRule::default(),
            goal_filter: FilterRule::default(),
            variant_renderer: Arc::new(PlainRenderer),
            winner_callback: Arc::new(NoopWinner),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_goal(mut self, goal: impl Into<String>) -> Self {
        self.goal = goal.into();
        self
    }

    pub fn with_query_filter(mut self, rule: FilterRule) -> Self {
        self.query_filter = rule;
        self
    }

    pub fn with_goal_filter(mut self, rule: FilterRule) -> Self {
        self.goal_filter = rule;
        self
    }

    pub fn with_renderer(mut self, renderer: impl VariantRenderer + 'static) -> Self {
        self.variant_renderer = Arc::new(renderer);
        self
    }

    pub fn with_winner_callback(mut self, callback: impl WinnerCallback + 'static) -> Self {
        self.winner_callback = Arc::new(callback);
        self
    }

    /// Event type counted as a conversion; any `:selector` part is dropped.
    pub fn goal_event(&self) -> &str {
        self.goal
            .split_once(':')
            .map_or(self.goal.as_str(), |(event, _)| event)
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty()
            || !self
                .id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(AbTestError::InvalidConfig(format!(
                "test id '{}' must be non-empty and use only [A-Za-z0-9_-]",
                self.id
            )));
        }
        if self.goal_event().trim().is_empty() {
            return Err(AbTestError::InvalidConfig(format!(
                "test '{}' has an empty goal event",
                self.id
            )));
        }
        for (name, rule) in [("query", &self.query_filter), ("goal", &self.goal_filter)] {
            if let FilterRule::Static(value) = rule {
                filter::validate_bool_filter(value).map_err(|e| {
                    AbTestError::InvalidConfig(format!("{} filter for '{}': {}", name, self.id, e))
                })?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for TestDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestDefinition")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("goal", &self.goal)
            .field("query_filter", &self.query_filter)
            .field("goal_filter", &self.goal_filter)
            .finish_non_exhaustive()
    }
}

// ── Results ─────────────────────────────────────────────────────────

/// Outcome of the latest evaluation.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(tag = "status", content = "variant", rename_all = "camelCase")]
pub enum Decision {
    #[default]
    NotDecided,
    /// Best rate with an adequate sample, not yet significant.
    Leading(usize),
    /// Significant; terminal for the test instance.
    Decided(usize),
}

impl Decision {
    pub fn winning(&self) -> Option<usize> {
        match self {
            Decision::NotDecided => None,
            Decision::Leading(i) | Decision::Decided(i) => Some(*i),
        }
    }

    pub fn winner(&self) -> Option<usize> {
        match self {
            Decision::Decided(i) => Some(*i),
            _ => None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VariantStat {
    pub value: String,
    pub size: u64,
    pub hits: u64,
    pub rate: f64,
    /// Binomial PMF of `hits` under the control's rate; `None` while the
    /// control has no samples.
    pub p: Option<f64>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ResultsSnapshot {
    /// Epoch millis of the newest event already merged.
    pub timestamp: i64,
    pub aggs: Aggregates,
    pub variants: Vec<VariantStat>,
    pub decision: Decision,
}

impl ResultsSnapshot {
    pub fn starting_at(timestamp: i64) -> Self {
        Self {
            timestamp,
            ..Default::default()
        }
    }

    pub fn winning(&self) -> Option<usize> {
        self.decision.winning()
    }

    pub fn winner(&self) -> Option<usize> {
        self.decision.winner()
    }
}

/// Frozen copy of the results kept when a winner is called.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CompletedResults {
    pub timestamp: i64,
    pub winner: Option<usize>,
    pub variants: Vec<VariantStat>,
}

// ── Test instance ───────────────────────────────────────────────────

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum TestState {
    Unconfigured,
    ConfiguredNotStarted,
    Running,
    Paused,
    EndedNoWinner,
    EndedWinner,
}

impl TestState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TestState::EndedNoWinner | TestState::EndedWinner)
    }
}

/// Per-subject state of one test.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct TestInstance {
    /// Index 0 is the control.
    pub variants: Vec<String>,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    pub traffic_percentage: u8,
    pub started: bool,
    pub paused: bool,
    /// Set once the end time passed without a winner.
    pub ended: bool,
    pub results: ResultsSnapshot,
    pub completed: Vec<CompletedResults>,
}

impl Default for TestInstance {
    fn default() -> Self {
        Self {
            variants: Vec::new(),
            start_time: None,
            end_time: None,
            traffic_percentage: DEFAULT_TRAFFIC_PERCENTAGE,
            started: false,
            paused: false,
            ended: false,
            results: ResultsSnapshot::default(),
            completed: Vec::new(),
        }
    }
}

impl TestInstance {
    pub fn with_variants(variants: Vec<String>) -> Self {
        Self {
            variants,
            ..Default::default()
        }
    }

    pub fn state(&self) -> TestState {
        if self.results.winner().is_some() {
            TestState::EndedWinner
        } else if self.ended {
            TestState::EndedNoWinner
        } else if self.variants.is_empty() {
            TestState::Unconfigured
        } else if !self.started {
            TestState::ConfiguredNotStarted
        } else if self.paused {
            TestState::Paused
        } else {
            TestState::Running
        }
    }

    /// Running and inside its time window.
    pub fn is_live(&self, now: i64) -> bool {
        self.state() == TestState::Running
            && self.start_time.map_or(true, |start| start <= now)
            && !self.is_past_end(now)
    }

    pub fn is_past_end(&self, now: i64) -> bool {
        self.end_time.is_some_and(|end| end <= now)
    }

    pub fn cursor(&self) -> i64 {
        self.results.timestamp
    }
}
