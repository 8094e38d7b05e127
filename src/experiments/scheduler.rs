use std::sync::Arc;
use std::time::Duration;

use super::lifecycle::{CycleOutcome, TestController};
use crate::error::Result;

pub const DEFAULT_PAGE_SIZE: usize = 50;

/// Outcome counts for one pass over every registered test.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickSummary {
    pub skipped: usize,
    pub no_data: usize,
    pub cursor_advanced: usize,
    pub updated: usize,
    pub winners: usize,
    pub ended: usize,
    pub failed: usize,
    /// Failures expected to clear up on their own; included in `failed`.
    pub retrying: usize,
}

impl TickSummary {
    fn record(&mut self, outcome: &Result<CycleOutcome>) {
        match outcome {
            Ok(CycleOutcome::Skipped) => self.skipped += 1,
            Ok(CycleOutcome::NoData) => self.no_data += 1,
            Ok(CycleOutcome::CursorAdvanced) => self.cursor_advanced += 1,
            Ok(CycleOutcome::Updated) => self.updated += 1,
            Ok(CycleOutcome::WinnerFound(_)) => self.winners += 1,
            Ok(CycleOutcome::Ended) => self.ended += 1,
            Err(_) => self.failed += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.skipped
            + self.no_data
            + self.cursor_advanced
            + self.updated
            + self.winners
            + self.ended
            + self.failed
    }
}

/// Process every subject of every registered test, `page_size` subjects at
/// a time. A failing subject or test never stops the rest of the batch.
pub fn run_tick(controller: &TestController, page_size: usize) -> TickSummary {
    let mut summary = TickSummary::default();
    let page_size = page_size.max(1);

    for test_id in controller.registry().ids() {
        let subjects = match controller.store().subjects(&test_id) {
            Ok(subjects) => subjects,
            Err(e) => {
                tracing::warn!("[abtest] Cannot list subjects for test {}: {}", test_id, e);
                summary.failed += 1;
                continue;
            }
        };
        for (page, chunk) in subjects.chunks(page_size).enumerate() {
            tracing::debug!(
                "[abtest] Test {} page {}: {} subjects",
                test_id,
                page + 1,
                chunk.len()
            );
            for &subject_id in chunk {
                let outcome = controller.process(&test_id, subject_id);
                match &outcome {
                    Err(e) if e.is_transient() => {
                        summary.retrying += 1;
                        tracing::warn!(
                            "[abtest] Cycle for test {} on subject {} will be retried: {}",
                            test_id,
                            subject_id,
                            e
                        );
                    }
                    Err(e) => tracing::error!(
                        "[abtest] Cycle failed for test {} on subject {}: {}",
                        test_id,
                        subject_id,
                        e
                    ),
                    Ok(_) => {}
                }
                summary.record(&outcome);
            }
        }
    }
    summary
}

/// Run [`run_tick`] at startup and then on every interval.
pub async fn run_evaluation_loop(
    controller: Arc<TestController>,
    every: Duration,
    page_size: usize,
) {
    log_tick(&run_tick(&controller, page_size));

    let mut interval = tokio::time::interval(every);
    interval.tick().await; // skip first immediate tick
    loop {
        interval.tick().await;
        log_tick(&run_tick(&controller, page_size));
    }
}

fn log_tick(summary: &TickSummary) {
    if summary.winners > 0 || summary.ended > 0 || summary.failed > 0 {
        tracing::info!(
            "[abtest] Evaluated {} subjects: {} winners, {} ended, {} failed",
            summary.total(),
            summary.winners,
            summary.ended,
            summary.failed
        );
    } else {
        tracing::debug!("[abtest] Evaluated {} subjects", summary.total());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::{AggregateQuery, AggregateSource, FetchedAggregates, FetchedBucket};
    use crate::error::AbTestError;
    use crate::experiments::config::{FilterRule, TestDefinition};
    use crate::experiments::lifecycle::ManualClock;
    use crate::experiments::notify::TracingNotifier;
    use crate::experiments::registry::TestRegistry;
    use crate::experiments::store::MemoryTestStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const T0: i64 = 1_700_000_000_000;

    /// Returns a clear winner for subject 2, fails for subject 3.
    #[derive(Default)]
    struct Source {
        calls: AtomicUsize,
    }

    impl AggregateSource for Source {
        fn fetch_aggregates(&self, query: &AggregateQuery) -> Result<FetchedAggregates> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match query.subject_id {
                2 => Ok(FetchedAggregates {
                    timestamp_max: Some(T0 + 1),
                    buckets: vec![
                        FetchedBucket { variant_index: 0, impressions: 1000, conversions: 50 },
                        FetchedBucket { variant_index: 1, impressions: 1000, conversions: 90 },
                    ],
                }),
                3 => Err(AbTestError::DataSource("timeout".to_string())),
                _ => Ok(FetchedAggregates::default()),
            }
        }
    }

    fn controller(source: Arc<Source>, extra: Option<TestDefinition>) -> TestController {
        let mut registry = TestRegistry::new();
        registry.register(TestDefinition::new("titles")).unwrap();
        if let Some(def) = extra {
            registry.register(def).unwrap();
        }
        TestController::new(
            registry,
            Arc::new(MemoryTestStore::new()),
            source,
            Arc::new(TracingNotifier),
        )
        .with_clock(Arc::new(ManualClock::new(T0)))
    }

    fn start(controller: &TestController, test_id: &str, subject_id: u64) {
        controller
            .update_variants(test_id, subject_id, vec!["A".into(), "B".into()])
            .unwrap();
        controller.start(test_id, subject_id).unwrap();
    }

    #[test]
    fn tick_visits_every_subject_across_pages() {
        let source = Arc::new(Source::default());
        let controller = controller(source.clone(), None);
        for subject_id in [1, 4, 5, 6, 7] {
            start(&controller, "titles", subject_id);
        }
        let summary = run_tick(&controller, 2);
        assert_eq!(summary.no_data, 5);
        assert_eq!(summary.total(), 5);
        assert_eq!(source.calls.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn failures_do_not_stop_the_batch() {
        let source = Arc::new(Source::default());
        let broken = TestDefinition::new("broken")
            .with_goal_filter(FilterRule::computed(|_, _| json!(42)));
        let controller = controller(source, Some(broken));
        start(&controller, "broken", 1);
        for subject_id in [1, 2, 3] {
            start(&controller, "titles", subject_id);
        }

        let summary = run_tick(&controller, DEFAULT_PAGE_SIZE);
        assert_eq!(summary.winners, 1);
        assert_eq!(summary.no_data, 1);
        assert_eq!(summary.failed, 2);
        // The source timeout is retried; the malformed filter is not.
        assert_eq!(summary.retrying, 1);

        // The decided subject is skipped from now on.
        let summary = run_tick(&controller, DEFAULT_PAGE_SIZE);
        assert_eq!(summary.skipped, 1);
    }

    #[test]
    fn zero_page_size_is_treated_as_one() {
        let source = Arc::new(Source::default());
        let controller = controller(source, None);
        start(&controller, "titles", 1);
        assert_eq!(run_tick(&controller, 0).total(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn loop_runs_at_startup_and_on_each_interval() {
        let source = Arc::new(Source::default());
        let controller = Arc::new(controller(source.clone(), None));
        start(&controller, "titles", 1);

        let every = Duration::from_secs(3600);
        let _ = tokio::time::timeout(
            every * 5 / 2,
            run_evaluation_loop(controller, every, DEFAULT_PAGE_SIZE),
        )
        .await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    }
}
