pub mod assignment;
pub mod config;
pub mod lifecycle;
pub mod notify;
pub mod registry;
pub mod scheduler;
pub mod stats;
pub mod store;
pub mod titles;

pub use config::{
    Decision, EvaluationPolicy, FilterRule, TestDefinition, TestInstance, TestState, VariantStat,
};
pub use lifecycle::{Clock, CycleOutcome, ManualClock, SystemClock, TestController};
pub use notify::{NotificationHub, Notifier, TracingNotifier};
pub use registry::TestRegistry;
pub use scheduler::{run_evaluation_loop, run_tick, TickSummary};
pub use store::{FileTestStore, MemoryTestStore, TestStore};
