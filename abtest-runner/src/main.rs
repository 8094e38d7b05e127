use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

mod search;

use abtest::analytics::events::EventLogSource;
use abtest::analytics::search::SearchAggregateSource;
use abtest::analytics::AggregateSource;
use abtest::experiments::scheduler::DEFAULT_PAGE_SIZE;
use abtest::experiments::titles::{permalink_from_template, titles_test, LoggedTitleSink};
use abtest::experiments::{
    run_evaluation_loop, run_tick, EvaluationPolicy, FileTestStore, NotificationHub,
    TestController, TestRegistry, TracingNotifier,
};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

#[derive(Parser)]
#[command(name = "abtest", about = "Evaluate A/B tests from an analytics event log")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[arg(long, env = "ABTEST_DATA_DIR", default_value = "./data")]
    data_dir: PathBuf,
    /// Newline-delimited JSON events. Defaults to `<data-dir>/events.ndjson`.
    #[arg(long, env = "ABTEST_EVENTS_PATH")]
    events_path: Option<PathBuf>,
    /// Search endpoint (`.../<index>/_search`) to aggregate events from
    /// instead of the event log.
    #[arg(long, env = "ABTEST_SEARCH_URL")]
    search_url: Option<String>,
    #[arg(long, env = "ABTEST_SEARCH_TIMEOUT_SECS", default_value_t = 30)]
    search_timeout_secs: u64,
    #[arg(long, env = "ABTEST_INTERVAL_SECS", default_value_t = 3600)]
    interval_secs: u64,
    #[arg(long, env = "ABTEST_PAGE_SIZE", default_value_t = DEFAULT_PAGE_SIZE)]
    page_size: usize,
    #[arg(long, env = "ABTEST_MIN_EXPECTED_COUNT", default_value_t = 5.0)]
    min_expected_count: f64,
    #[arg(long, env = "ABTEST_SIGNIFICANCE_THRESHOLD", default_value_t = 0.01)]
    significance_threshold: f64,
    #[arg(long, env = "ABTEST_DEFAULT_DURATION_DAYS", default_value_t = 30)]
    default_duration_days: u32,
    /// Subject URL template with an `{id}` placeholder; clicks on that page
    /// are left out of title tests.
    #[arg(long, env = "ABTEST_PERMALINK_TEMPLATE")]
    permalink_template: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Evaluate every test on an interval until interrupted (default)
    Run,
    /// Evaluate every test once and print a summary
    Once,
    /// Print the stored state of a test on one subject
    Status { test_id: String, subject_id: u64 },
    /// Set the variant values, control first
    Variants {
        test_id: String,
        subject_id: u64,
        #[arg(required = true, num_args = 1..)]
        values: Vec<String>,
    },
    Start { test_id: String, subject_id: u64 },
    Pause { test_id: String, subject_id: u64 },
    Resume { test_id: String, subject_id: u64 },
    /// Set the end time (epoch milliseconds)
    EndAt {
        test_id: String,
        subject_id: u64,
        end_ms: i64,
    },
    /// Set the share of visitors included in the test (0-100)
    Traffic {
        test_id: String,
        subject_id: u64,
        percentage: u8,
    },
    /// Clear results and start over with new variants
    Reset {
        test_id: String,
        subject_id: u64,
        #[arg(required = true, num_args = 1..)]
        values: Vec<String>,
    },
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn build_controller(cli: &Cli) -> Result<TestController, Box<dyn std::error::Error>> {
    let store = FileTestStore::new(&cli.data_dir)?;
    let source: Arc<dyn AggregateSource> = match &cli.search_url {
        Some(url) => Arc::new(SearchAggregateSource::new(search::HttpSearchTransport::new(
            url.clone(),
            Duration::from_secs(cli.search_timeout_secs),
        ))),
        None => Arc::new(EventLogSource::new(
            cli.events_path
                .clone()
                .unwrap_or_else(|| cli.data_dir.join("events.ndjson")),
        )),
    };

    let mut registry = TestRegistry::new();
    let template = cli.permalink_template.clone();
    let permalink = move |subject_id: u64| {
        template
            .as_deref()
            .and_then(|t| permalink_from_template(t)(subject_id))
    };
    registry.register(titles_test(permalink, Arc::new(LoggedTitleSink)))?;

    let notifier = NotificationHub::new().subscribe(Arc::new(TracingNotifier));
    let policy = EvaluationPolicy {
        min_expected_count: cli.min_expected_count,
        significance_threshold: cli.significance_threshold,
    };

    let controller = TestController::new(
        registry,
        Arc::new(store),
        source,
        Arc::new(notifier),
    )
    .with_policy(policy)?
    .with_default_duration_ms(i64::from(cli.default_duration_days) * DAY_MS)?;
    Ok(controller)
}

fn print_status(
    controller: &TestController,
    test_id: &str,
    subject_id: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let instance = controller.instance(test_id, subject_id)?;
    let status = serde_json::json!({
        "testId": test_id,
        "subjectId": subject_id,
        "state": instance.state(),
        "instance": instance,
    });
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing();
    let controller = build_controller(&cli)?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            tracing::info!(
                "[abtest] Evaluating {} tests every {}s from {}",
                controller.registry().len(),
                cli.interval_secs,
                cli.data_dir.display()
            );
            let every = Duration::from_secs(cli.interval_secs.max(1));
            tokio::select! {
                _ = run_evaluation_loop(Arc::new(controller), every, cli.page_size) => {}
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("[abtest] Shutting down");
                }
            }
        }
        Command::Once => {
            let summary = run_tick(&controller, cli.page_size);
            println!(
                "evaluated {} subjects: {} winners, {} ended, {} updated, {} no data, {} skipped, {} failed ({} retrying)",
                summary.total(),
                summary.winners,
                summary.ended,
                summary.updated + summary.cursor_advanced,
                summary.no_data,
                summary.skipped,
                summary.failed,
                summary.retrying
            );
        }
        Command::Status {
            test_id,
            subject_id,
        } => print_status(&controller, &test_id, subject_id)?,
        Command::Variants {
            test_id,
            subject_id,
            values,
        } => {
            controller.update_variants(&test_id, subject_id, values)?;
            print_status(&controller, &test_id, subject_id)?;
        }
        Command::Start {
            test_id,
            subject_id,
        } => {
            controller.start(&test_id, subject_id)?;
            print_status(&controller, &test_id, subject_id)?;
        }
        Command::Pause {
            test_id,
            subject_id,
        } => {
            controller.pause(&test_id, subject_id)?;
            print_status(&controller, &test_id, subject_id)?;
        }
        Command::Resume {
            test_id,
            subject_id,
        } => {
            controller.resume(&test_id, subject_id)?;
            print_status(&controller, &test_id, subject_id)?;
        }
        Command::EndAt {
            test_id,
            subject_id,
            end_ms,
        } => {
            controller.set_end_time(&test_id, subject_id, end_ms)?;
            print_status(&controller, &test_id, subject_id)?;
        }
        Command::Traffic {
            test_id,
            subject_id,
            percentage,
        } => {
            controller.set_traffic_percentage(&test_id, subject_id, percentage)?;
            print_status(&controller, &test_id, subject_id)?;
        }
        Command::Reset {
            test_id,
            subject_id,
            values,
        } => {
            controller.reset(&test_id, subject_id, values)?;
            print_status(&controller, &test_id, subject_id)?;
        }
    }
    Ok(())
}
