use std::sync::Arc;

use crate::error::Result;

/// Subscriber for test outcome events. Errors are logged by the caller and
/// never undo the state change that triggered the event.
pub trait Notifier: Send + Sync {
    fn on_test_ended(&self, test_id: &str, subject_id: u64) -> Result<()>;
    fn on_winner_found(&self, test_id: &str, subject_id: u64, winning_value: &str) -> Result<()>;
}

/// Writes outcome events to the log.
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn on_test_ended(&self, test_id: &str, subject_id: u64) -> Result<()> {
        tracing::info!(
            "[abtest] Test {} on subject {} ended without a winner",
            test_id,
            subject_id
        );
        Ok(())
    }

    fn on_winner_found(&self, test_id: &str, subject_id: u64, winning_value: &str) -> Result<()> {
        tracing::info!(
            "[abtest] Test {} on subject {} found a winner: {:?}",
            test_id,
            subject_id,
            winning_value
        );
        Ok(())
    }
}

/// Fans each event out to every subscriber. Every subscriber is called even
/// when an earlier one fails; the first error is returned.
#[derive(Default, Clone)]
pub struct NotificationHub {
    subscribers: Vec<Arc<dyn Notifier>>,
}

impl NotificationHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.subscribers.push(notifier);
        self
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    fn each(&self, f: impl Fn(&dyn Notifier) -> Result<()>) -> Result<()> {
        let mut first_err = None;
        for subscriber in &self.subscribers {
            if let Err(e) = f(subscriber.as_ref()) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

impl Notifier for NotificationHub {
    fn on_test_ended(&self, test_id: &str, subject_id: u64) -> Result<()> {
        self.each(|n| n.on_test_ended(test_id, subject_id))
    }

    fn on_winner_found(&self, test_id: &str, subject_id: u64, winning_value: &str) -> Result<()> {
        self.each(|n| n.on_winner_found(test_id, subject_id, winning_value))
    }
}
