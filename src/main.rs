//! fleetrun CLI - Test distribution across a lab fleet.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

use fleetrun::config::{self, Config};
use fleetrun::item::TestItem;
use fleetrun::machine::process::ProcessMachine;
use fleetrun::orchestrator::Orchestrator;
use fleetrun::remote::request::Priority;
use fleetrun::remote::{
    self, CliTaskService, RetryPolicy, SUITE_TAG, SuiteTracker, TaskService, TaskState,
    WaitOutcome, task_link,
};

#[derive(Parser)]
#[command(name = "fleetrun")]
#[command(about = "Distribute tests across a lab fleet", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "fleetrun.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the configured tests on the configured machines
    Run {
        /// Only use these hosts (repeatable)
        #[arg(short, long = "machine")]
        machines: Vec<String>,
    },

    /// Print the remote task request for a test without submitting it
    Request {
        /// Test name
        test: String,

        /// Override the configured priority
        #[arg(short, long)]
        priority: Option<Priority>,

        /// Suite tag value
        #[arg(short, long, default_value = "adhoc")]
        suite: String,

        /// Task id of the suite task submitting this request
        #[arg(long, env = "SWARMING_TASK_ID")]
        parent: Option<String>,
    },

    /// Submit the configured tests to the remote executor
    Submit {
        /// Track the tasks until they finish, retrying infrastructure failures
        #[arg(short, long)]
        wait: bool,

        /// Suite tag value
        #[arg(short, long, default_value = "adhoc")]
        suite: String,

        /// Task id of the suite task submitting these tests
        #[arg(long, env = "SWARMING_TASK_ID")]
        parent: Option<String>,

        /// Pick up the suite's existing tasks and submit only the missing tests
        #[arg(short, long)]
        resume: bool,
    },

    /// Show bot counts for a dimension filter
    Bots {
        /// Dimension filter as key=value (repeatable); defaults to the configured dimensions
        #[arg(short, long = "dimension", value_parser = parse_key_val)]
        dimensions: Vec<(String, String)>,
    },

    /// Cancel a remote task (best effort)
    Abort {
        /// Task id
        task_id: String,
    },

    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run { machines } => run_tests(&cli.config, &machines).await,
        Commands::Request {
            test,
            priority,
            suite,
            parent,
        } => print_request(&cli.config, &test, priority, &suite, parent.as_deref()),
        Commands::Submit {
            wait,
            suite,
            parent,
            resume,
        } => {
            let options = SubmitOptions {
                wait,
                resume,
                suite: &suite,
                parent: parent.as_deref(),
            };
            submit_tests(&cli.config, options).await
        }
        Commands::Bots { dimensions } => show_bots(&cli.config, dimensions).await,
        Commands::Abort { task_id } => abort_task(&cli.config, &task_id).await,
        Commands::Validate => validate_config(&cli.config),
    }
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got {:?}", s))?;
    if key.is_empty() {
        return Err(format!("empty key in {:?}", s));
    }
    Ok((key.to_string(), value.to_string()))
}

fn load(config_path: &Path) -> Result<Config> {
    let config = config::load_config(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    info!("Loaded configuration from {}", config_path.display());
    Ok(config)
}

fn executor(config: &Config) -> Result<CliTaskService> {
    let executor = config
        .executor
        .as_ref()
        .context("No [executor] section in config")?;
    Ok(CliTaskService::new(executor)?)
}

async fn run_tests(config_path: &Path, only: &[String]) -> Result<()> {
    let config = load(config_path)?;
    let runner = config
        .runner
        .clone()
        .context("No [runner] section in config")?;

    for host in only {
        if !config.machines.iter().any(|m| &m.hostname == host) {
            bail!("Unknown machine: {}", host);
        }
    }
    let machines: Vec<ProcessMachine> = config
        .machines
        .iter()
        .filter(|m| only.is_empty() || only.contains(&m.hostname))
        .map(|m| ProcessMachine::new(m, runner.clone()))
        .collect();

    let orchestrator = Orchestrator::new(machines, &config.scheduler.results_dir);
    let summary = orchestrator.run(config.tests.clone()).await?;

    println!();
    for report in &summary.reports {
        println!(
            "{}: {} run, {} passed, {} failed",
            report.hostname, report.tests_run, report.passed, report.failed
        );
    }
    for name in &summary.unclaimed {
        println!("not run: {}", name);
    }
    println!(
        "{} of {} tests passed in {:.1}s",
        summary.passed(),
        summary.total_tests,
        summary.duration.as_secs_f64()
    );

    std::process::exit(summary.exit_code());
}

fn print_request(
    config_path: &Path,
    test: &str,
    priority: Option<Priority>,
    suite: &str,
    parent: Option<&str>,
) -> Result<()> {
    let mut config = load(config_path)?;
    if let Some(priority) = priority {
        config.remote.priority = priority;
    }

    let item = config
        .tests
        .iter()
        .find(|t| t.name == test)
        .cloned()
        .unwrap_or_else(|| TestItem::new(test));

    let request = remote::request_for(&item, &config.remote, suite, parent)?;
    println!("{}", serde_json::to_string_pretty(&request)?);
    Ok(())
}

struct SubmitOptions<'a> {
    wait: bool,
    resume: bool,
    suite: &'a str,
    parent: Option<&'a str>,
}

async fn submit_tests(config_path: &Path, options: SubmitOptions<'_>) -> Result<()> {
    let config = load(config_path)?;
    let service = executor(&config)?;

    if config.tests.is_empty() {
        warn!("No tests to submit");
        return Ok(());
    }

    let tags: BTreeMap<String, String> = [(SUITE_TAG.to_string(), options.suite.to_string())]
        .into_iter()
        .collect();
    let requests = config
        .tests
        .iter()
        .map(|test| remote::request_for(test, &config.remote, options.suite, options.parent))
        .collect::<Result<Vec<_>, _>>()?;

    let mut tracker = SuiteTracker::new(RetryPolicy::from(&config.remote));
    let requests = if options.resume {
        let existing = service
            .query_tasks_by_tags(&tags)
            .await
            .with_context(|| format!("Failed to list tasks of suite {}", options.suite))?;
        let total = requests.len();
        let unscheduled = tracker.resume(&existing, requests);
        info!(
            "Resuming suite {}: {} of {} tests not yet scheduled",
            options.suite,
            unscheduled.len(),
            total
        );
        unscheduled
    } else {
        requests
    };

    for request in requests {
        let name = request.name.clone();
        let task_id = tracker
            .submit(&service, request)
            .await
            .with_context(|| format!("Failed to submit {}", name))?;
        println!("{}: {}", name, task_link(service.server(), &task_id));
    }

    if !options.wait {
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_ctrl_c.cancel();
        }
    });

    let outcome = tracker
        .wait_for_results(
            &service,
            &tags,
            config.remote.poll_interval(),
            config.remote.wait_timeout(),
            &cancel,
        )
        .await?;

    println!();
    let results = tracker.results();
    for result in &results {
        let state = result
            .state
            .map(|s| s.to_string())
            .unwrap_or_else(|| "UNKNOWN".to_string());
        println!(
            "{}: {} on {} (tasks: {})",
            result.name,
            state,
            result.dut_name.as_deref().unwrap_or("-"),
            result.attempts.join(", ")
        );
    }

    let all_passed = results
        .iter()
        .all(|r| r.state == Some(TaskState::CompletedSuccess));
    if outcome != WaitOutcome::Finished || !all_passed {
        std::process::exit(1);
    }
    Ok(())
}

async fn show_bots(config_path: &Path, dimensions: Vec<(String, String)>) -> Result<()> {
    let config = load(config_path)?;
    let service = executor(&config)?;

    let filter: BTreeMap<String, String> = if dimensions.is_empty() {
        remote::dimensions(&config.remote)
    } else {
        dimensions.into_iter().collect()
    };

    let counts = service.query_bots_count(&filter).await?;
    println!(
        "count={} busy={} dead={} quarantined={} idle={}",
        counts.count,
        counts.busy,
        counts.dead,
        counts.quarantined,
        counts.idle_count()
    );

    let bots = service.query_bots(&filter).await?;
    for bot in remote::bots::available_bots(&bots) {
        println!("  {}", bot.bot_id);
    }
    Ok(())
}

async fn abort_task(config_path: &Path, task_id: &str) -> Result<()> {
    let config = load(config_path)?;
    let service = executor(&config)?;
    service.abort(task_id).await;
    Ok(())
}

fn validate_config(config_path: &Path) -> Result<()> {
    match config::load_config(config_path) {
        Ok(config) => {
            println!("Configuration is valid!");
            println!();
            println!("Settings:");
            println!("  Results dir: {}", config.scheduler.results_dir.display());
            println!("  Machines: {}", config.machines.len());
            println!("  Tests: {}", config.tests.len());
            println!(
                "  Runner: {}",
                if config.runner.is_some() { "configured" } else { "none" }
            );
            match &config.executor {
                Some(executor) => println!("  Executor: {}", executor.server),
                None => println!("  Executor: none"),
            }
            println!(
                "  Priority: {} ({})",
                config.remote.priority,
                config.remote.priority.value()
            );
            println!(
                "  Retries: {} per test, {} per suite",
                config.remote.test_retries, config.remote.max_retries
            );

            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    }
}
