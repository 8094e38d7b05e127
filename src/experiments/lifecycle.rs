//! Per-subject test lifecycle: configuration changes, the evaluation cycle
//! and the side effects of ending a test.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;
use serde_json::Value;

use super::assignment::{assign_variant, Assignment};
use super::config::{
    CompletedResults, Decision, EvaluationPolicy, ResultsSnapshot, TestDefinition, TestInstance,
    TestState, DEFAULT_TEST_DURATION_MS,
};
use super::notify::Notifier;
use super::registry::TestRegistry;
use super::stats;
use super::store::TestStore;
use crate::analytics::{filter, merge_aggregates, sort_buckets, AggregateQuery, AggregateSource};
use crate::error::{AbTestError, Result};

// ── Clock ───────────────────────────────────────────────────────────

pub trait Clock: Send + Sync {
    /// Epoch milliseconds.
    fn now_ms(&self) -> i64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock(AtomicI64);

impl ManualClock {
    pub fn new(now_ms: i64) -> Self {
        Self(AtomicI64::new(now_ms))
    }

    pub fn set(&self, now_ms: i64) {
        self.0.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_ms: i64) {
        self.0.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

// ── Controller ──────────────────────────────────────────────────────

/// What one call to [`TestController::process`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Not running, or already finished; nothing touched.
    Skipped,
    /// The source had nothing newer than the cursor.
    NoData,
    /// No new buckets, but the cursor moved forward.
    CursorAdvanced,
    /// Aggregates merged and re-evaluated; no winner yet.
    Updated,
    WinnerFound(usize),
    /// End time passed without a winner.
    Ended,
}

pub struct TestController {
    registry: TestRegistry,
    store: Arc<dyn TestStore>,
    source: Arc<dyn AggregateSource>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    policy: EvaluationPolicy,
    default_duration_ms: i64,
    locks: DashMap<(String, u64), Arc<Mutex<()>>>,
}

impl TestController {
    pub fn new(
        registry: TestRegistry,
        store: Arc<dyn TestStore>,
        source: Arc<dyn AggregateSource>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            registry,
            store,
            source,
            notifier,
            clock: Arc::new(SystemClock),
            policy: EvaluationPolicy::default(),
            default_duration_ms: DEFAULT_TEST_DURATION_MS,
            locks: DashMap::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_policy(mut self, policy: EvaluationPolicy) -> Result<Self> {
        policy.validate()?;
        self.policy = policy;
        Ok(self)
    }

    pub fn with_default_duration_ms(mut self, duration_ms: i64) -> Result<Self> {
        if duration_ms <= 0 {
            return Err(AbTestError::InvalidConfig(
                "default test duration must be positive".to_string(),
            ));
        }
        self.default_duration_ms = duration_ms;
        Ok(self)
    }

    pub fn registry(&self) -> &TestRegistry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn TestStore> {
        &self.store
    }

    pub fn policy(&self) -> &EvaluationPolicy {
        &self.policy
    }

    pub fn instance(&self, test_id: &str, subject_id: u64) -> Result<TestInstance> {
        self.registry.get(test_id)?;
        self.store.load(test_id, subject_id)
    }

    pub fn state(&self, test_id: &str, subject_id: u64) -> Result<TestState> {
        Ok(self.instance(test_id, subject_id)?.state())
    }

    /// Run `f` as the only writer of one pair: the in-process mutex first,
    /// then the store's lock for writers in other processes. The mutex entry
    /// is dropped again once nobody else is waiting on it.
    fn with_pair<T, F>(&self, test_id: &str, subject_id: u64, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        let key = (test_id.to_string(), subject_id);
        let lock = self.locks.entry(key.clone()).or_default().clone();
        let result = {
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            self.store
                .lock(test_id, subject_id)
                .and_then(|_store_guard| f())
        };
        drop(lock);
        self.locks.remove_if(&key, |_, m| Arc::strong_count(m) == 1);
        result
    }

    /// Load, change and save one instance as the pair's only writer.
    fn modify<F>(&self, test_id: &str, subject_id: u64, change: F) -> Result<TestInstance>
    where
        F: FnOnce(&mut TestInstance, i64) -> Result<()>,
    {
        self.registry.get(test_id)?;
        self.with_pair(test_id, subject_id, || {
            let mut instance = self.store.load(test_id, subject_id)?;
            change(&mut instance, self.clock.now_ms())?;
            self.store.save(test_id, subject_id, &instance)?;
            Ok(instance)
        })
    }

    // ── Configuration ───────────────────────────────────────────────

    /// Replace the variant list. Results are cleared unless the new list only
    /// appends to the old one, since aggregates are kept by position.
    pub fn update_variants(
        &self,
        test_id: &str,
        subject_id: u64,
        variants: Vec<String>,
    ) -> Result<TestInstance> {
        self.modify(test_id, subject_id, |instance, _now| {
            if instance.state() == TestState::EndedWinner {
                return Err(AbTestError::InvalidStatus(format!(
                    "test {} on subject {} already has a winner",
                    test_id, subject_id
                )));
            }
            if instance.started && variants.len() < 2 {
                return Err(AbTestError::InvalidConfig(
                    "a started test needs at least two variants".to_string(),
                ));
            }
            if !variants.starts_with(&instance.variants) {
                tracing::info!(
                    "[abtest] Variants changed for test {} on subject {}, clearing results",
                    test_id,
                    subject_id
                );
                instance.results = ResultsSnapshot::starting_at(instance.start_time.unwrap_or(0));
            }
            instance.variants = variants;
            Ok(())
        })
    }

    pub fn start(&self, test_id: &str, subject_id: u64) -> Result<TestInstance> {
        let default_duration = self.default_duration_ms;
        self.modify(test_id, subject_id, |instance, now| {
            match instance.state() {
                TestState::ConfiguredNotStarted => {}
                TestState::Unconfigured => {
                    return Err(AbTestError::InvalidConfig(
                        "a test needs at least two variants to start".to_string(),
                    ))
                }
                state => {
                    return Err(AbTestError::InvalidStatus(format!(
                        "cannot start from {:?}",
                        state
                    )))
                }
            }
            if instance.variants.len() < 2 {
                return Err(AbTestError::InvalidConfig(
                    "a test needs at least two variants to start".to_string(),
                ));
            }
            let start = *instance.start_time.get_or_insert(now);
            instance.end_time.get_or_insert(start + default_duration);
            if instance.results == ResultsSnapshot::default() {
                instance.results = ResultsSnapshot::starting_at(start);
            }
            instance.started = true;
            instance.paused = false;
            tracing::info!("[abtest] Started test {} on subject {}", test_id, subject_id);
            Ok(())
        })
    }

    pub fn pause(&self, test_id: &str, subject_id: u64) -> Result<TestInstance> {
        self.set_paused(test_id, subject_id, true)
    }

    pub fn resume(&self, test_id: &str, subject_id: u64) -> Result<TestInstance> {
        self.set_paused(test_id, subject_id, false)
    }

    fn set_paused(&self, test_id: &str, subject_id: u64, paused: bool) -> Result<TestInstance> {
        self.modify(test_id, subject_id, |instance, _now| {
            match instance.state() {
                TestState::Running | TestState::Paused => {
                    instance.paused = paused;
                    Ok(())
                }
                state => Err(AbTestError::InvalidStatus(format!(
                    "cannot {} from {:?}",
                    if paused { "pause" } else { "resume" },
                    state
                ))),
            }
        })
    }

    pub fn set_start_time(
        &self,
        test_id: &str,
        subject_id: u64,
        start_ms: i64,
    ) -> Result<TestInstance> {
        self.modify(test_id, subject_id, |instance, _now| {
            ensure_editable(instance)?;
            if instance.end_time.is_some_and(|end| start_ms >= end) {
                return Err(AbTestError::InvalidConfig(
                    "start time must be before the end time".to_string(),
                ));
            }
            instance.start_time = Some(start_ms);
            Ok(())
        })
    }

    pub fn set_end_time(
        &self,
        test_id: &str,
        subject_id: u64,
        end_ms: i64,
    ) -> Result<TestInstance> {
        self.modify(test_id, subject_id, |instance, _now| {
            ensure_editable(instance)?;
            if instance.start_time.is_some_and(|start| end_ms <= start) {
                return Err(AbTestError::InvalidConfig(
                    "end time must be after the start time".to_string(),
                ));
            }
            instance.end_time = Some(end_ms);
            Ok(())
        })
    }

    pub fn set_traffic_percentage(
        &self,
        test_id: &str,
        subject_id: u64,
        percentage: u8,
    ) -> Result<TestInstance> {
        if percentage > 100 {
            return Err(AbTestError::InvalidConfig(format!(
                "traffic percentage {} is above 100",
                percentage
            )));
        }
        self.modify(test_id, subject_id, |instance, _now| {
            ensure_editable(instance)?;
            instance.traffic_percentage = percentage;
            Ok(())
        })
    }

    /// Start over with new variants. Earlier completed results are kept.
    pub fn reset(
        &self,
        test_id: &str,
        subject_id: u64,
        variants: Vec<String>,
    ) -> Result<TestInstance> {
        self.modify(test_id, subject_id, |instance, _now| {
            *instance = TestInstance {
                variants,
                traffic_percentage: instance.traffic_percentage,
                completed: std::mem::take(&mut instance.completed),
                ..Default::default()
            };
            tracing::info!("[abtest] Reset test {} on subject {}", test_id, subject_id);
            Ok(())
        })
    }

    // ── Evaluation cycle ────────────────────────────────────────────

    /// Run one evaluation cycle for a test on one subject.
    pub fn process(&self, test_id: &str, subject_id: u64) -> Result<CycleOutcome> {
        let definition = self.registry.get(test_id)?;
        self.with_pair(test_id, subject_id, || {
            self.run_cycle(&definition, test_id, subject_id)
        })
    }

    fn run_cycle(
        &self,
        definition: &TestDefinition,
        test_id: &str,
        subject_id: u64,
    ) -> Result<CycleOutcome> {
        let now = self.clock.now_ms();
        let mut instance = self.store.load(test_id, subject_id)?;

        match instance.state() {
            TestState::EndedWinner | TestState::EndedNoWinner => {
                return Ok(CycleOutcome::Skipped)
            }
            TestState::Running | TestState::Paused if instance.is_past_end(now) => {
                instance.paused = true;
                instance.ended = true;
                self.store.save(test_id, subject_id, &instance)?;
                tracing::info!(
                    "[abtest] Test {} on subject {} has ended",
                    test_id,
                    subject_id
                );
                if let Err(e) = self.notifier.on_test_ended(test_id, subject_id) {
                    tracing::warn!(
                        "[abtest] Ended notification failed for {}/{}: {}",
                        test_id,
                        subject_id,
                        e
                    );
                }
                return Ok(CycleOutcome::Ended);
            }
            _ => {}
        }
        if !instance.is_live(now) {
            return Ok(CycleOutcome::Skipped);
        }

        let cursor = instance.cursor();
        let query = build_query(definition, subject_id, cursor).inspect_err(|e| {
            tracing::warn!(
                "[abtest] Skipping test {} on subject {}: {}",
                test_id,
                subject_id,
                e
            );
        })?;
        let fetched = self.source.fetch_aggregates(&query).inspect_err(|e| {
            tracing::warn!(
                "[abtest] Fetch failed for test {} on subject {}, retrying next cycle: {}",
                test_id,
                subject_id,
                e
            );
        })?;

        if fetched.buckets.is_empty() {
            return match fetched.timestamp_max {
                Some(ts) if ts > cursor => {
                    instance.results.timestamp = ts;
                    self.store.save(test_id, subject_id, &instance)?;
                    Ok(CycleOutcome::CursorAdvanced)
                }
                _ => Ok(CycleOutcome::NoData),
            };
        }

        let incoming = sort_buckets(&fetched.buckets, instance.variants.len());
        let aggs = merge_aggregates(&instance.results.aggs, &incoming);
        let evaluation = stats::evaluate(&aggs, &instance.variants, &self.policy);
        instance.results = ResultsSnapshot {
            timestamp: fetched.timestamp_max.map_or(cursor, |ts| ts.max(cursor)),
            aggs,
            variants: evaluation.variants,
            decision: evaluation.decision,
        };

        let Decision::Decided(winner) = evaluation.decision else {
            self.store.save(test_id, subject_id, &instance)?;
            tracing::debug!(
                "[abtest] Updated test {} on subject {}: {:?}",
                test_id,
                subject_id,
                instance.results.decision
            );
            return Ok(CycleOutcome::Updated);
        };

        instance.paused = true;
        instance.end_time = Some(now);
        instance.completed.push(CompletedResults {
            timestamp: now,
            winner: Some(winner),
            variants: instance.results.variants.clone(),
        });
        self.store.save(test_id, subject_id, &instance)?;

        let value = instance.variants[winner].as_str();
        tracing::info!(
            "[abtest] Test {} on subject {} found winner {} ({:?})",
            test_id,
            subject_id,
            winner,
            value
        );
        if let Err(e) = self.notifier.on_winner_found(test_id, subject_id, value) {
            tracing::warn!(
                "[abtest] Winner notification failed for {}/{}: {}",
                test_id,
                subject_id,
                e
            );
        }
        if let Err(e) = definition.winner_callback.on_winner(subject_id, value) {
            tracing::warn!(
                "[abtest] Winner callback failed for {}/{}: {}",
                test_id,
                subject_id,
                e
            );
        }
        Ok(CycleOutcome::WinnerFound(winner))
    }

    // ── Output ──────────────────────────────────────────────────────

    /// Output for a subject once its test is decided. Until then, or when the
    /// control won, the caller's default output is returned unchanged.
    pub fn render(
        &self,
        test_id: &str,
        subject_id: u64,
        default_output: &str,
        args: &Value,
    ) -> Result<String> {
        let definition = self.registry.get(test_id)?;
        let instance = self.store.load(test_id, subject_id)?;
        let rendered = match instance.results.winner() {
            Some(i) if i > 0 => instance
                .variants
                .get(i)
                .map(|value| definition.variant_renderer.render(value, subject_id, args)),
            _ => None,
        };
        Ok(rendered.unwrap_or_else(|| default_output.to_string()))
    }

    /// Variant a visitor should see while the test is live, or `None` when
    /// the visitor falls outside the traffic percentage.
    pub fn assign(
        &self,
        test_id: &str,
        subject_id: u64,
        visitor_key: &str,
    ) -> Result<Option<usize>> {
        let instance = self.instance(test_id, subject_id)?;
        if !instance.is_live(self.clock.now_ms()) {
            return Ok(None);
        }
        let assignment = assign_variant(
            test_id,
            subject_id,
            visitor_key,
            instance.traffic_percentage,
            instance.variants.len(),
        );
        Ok(match assignment {
            Assignment::Excluded => None,
            Assignment::Variant(i) => Some(i),
        })
    }
}

fn ensure_editable(instance: &TestInstance) -> Result<()> {
    let state = instance.state();
    if state.is_terminal() {
        return Err(AbTestError::InvalidStatus(format!(
            "test is {:?} and can no longer be edited",
            state
        )));
    }
    Ok(())
}

fn build_query(definition: &TestDefinition, subject_id: u64, since: i64) -> Result<AggregateQuery> {
    let query_filter = definition.query_filter.resolve(&definition.id, subject_id);
    filter::validate_bool_filter(&query_filter).map_err(|e| {
        AbTestError::InvalidConfig(format!("query filter for test {}: {}", definition.id, e))
    })?;
    let goal_filter = definition.goal_filter.resolve(&definition.id, subject_id);
    filter::validate_bool_filter(&goal_filter).map_err(|e| {
        AbTestError::InvalidConfig(format!("goal filter for test {}: {}", definition.id, e))
    })?;
    Ok(AggregateQuery {
        test_id: definition.id.clone(),
        subject_id,
        since,
        query_filter,
        goal_filter,
        goal_event: definition.goal_event().to_string(),
    })
}
