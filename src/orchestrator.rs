//! Local test distribution across a fleet of machines.
//!
//! The orchestrator owns one shared [`WorkQueue`] and starts one [`Worker`]
//! per machine. Workers compete for tests; each takes the first queued test
//! its machine can run, so a test constrained to rare hardware waits for a
//! machine that has it while everything else flows to whoever is free.
//!
//! # Architecture
//!
//! ```text
//!   Vec<TestItem>
//!        │
//!        ▼
//!   WorkQueue (FIFO, one lock)
//!        │
//!        ├── claim(attrs) ──► Worker(machine 1) ──► Machine::run_test
//!        ├── claim(attrs) ──► Worker(machine 2) ──► Machine::run_test
//!        └── claim(attrs) ──► Worker(machine N) ──► Machine::run_test
//!                                   │
//!                                   ▼
//!                             WorkerReport ──► RunSummary
//! ```
//!
//! A worker stops once the queue holds nothing valid for its machine. The run
//! ends when every worker has stopped. Tests that no machine could run are
//! left in the queue and reported as unclaimed.
//!
//! # Example
//!
//! ```no_run
//! use fleetrun::config::load_config;
//! use fleetrun::machine::process::ProcessMachine;
//! use fleetrun::orchestrator::Orchestrator;
//!
//! #[tokio::main(flavor = "multi_thread")]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("fleetrun.toml"))?;
//!     let runner = config.runner.clone().expect("runner configured");
//!
//!     let machines: Vec<_> = config
//!         .machines
//!         .iter()
//!         .map(|m| ProcessMachine::new(m, runner.clone()))
//!         .collect();
//!
//!     let orchestrator = Orchestrator::new(machines, &config.scheduler.results_dir);
//!     let summary = orchestrator.run(config.tests.clone()).await?;
//!
//!     std::process::exit(summary.exit_code());
//! }
//! ```

pub mod queue;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Context;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::item::TestItem;
use crate::machine::Machine;

pub use queue::WorkQueue;
pub use worker::{Worker, WorkerReport};

/// Outcome of a local distribution run.
///
/// # Exit Codes
///
/// | Code | Meaning |
/// |------|---------|
/// | 0 | Every test ran and passed |
/// | 1 | Some tests failed or were never claimed |
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    /// Number of tests handed to the run.
    pub total_tests: usize,

    /// Per-machine reports, sorted by host name.
    pub reports: Vec<WorkerReport>,

    /// Tests no machine could run, in queue order.
    pub unclaimed: Vec<String>,

    /// Wall-clock time of the run.
    pub duration: Duration,
}

impl RunSummary {
    /// Number of tests executed across all machines.
    pub fn tests_run(&self) -> usize {
        self.reports.iter().map(|r| r.tests_run).sum()
    }

    /// Number of tests that passed.
    pub fn passed(&self) -> usize {
        self.reports.iter().map(|r| r.passed).sum()
    }

    /// Number of tests that failed.
    pub fn failed(&self) -> usize {
        self.reports.iter().map(|r| r.failed).sum()
    }

    /// Returns `true` if every test ran and passed.
    pub fn success(&self) -> bool {
        self.unclaimed.is_empty() && self.failed() == 0 && self.passed() == self.total_tests
    }

    /// Returns the process exit code for this run.
    pub fn exit_code(&self) -> i32 {
        if self.success() { 0 } else { 1 }
    }
}

/// Distributes tests across machines, one worker per machine.
pub struct Orchestrator<M> {
    machines: Vec<M>,
    results_dir: PathBuf,
}

impl<M: Machine> Orchestrator<M> {
    /// Creates an orchestrator over `machines`, writing results under
    /// `results_dir`.
    pub fn new(machines: Vec<M>, results_dir: &Path) -> Self {
        Self {
            machines,
            results_dir: results_dir.to_path_buf(),
        }
    }

    /// Returns the machines of this orchestrator.
    pub fn machines(&self) -> &[M] {
        &self.machines
    }

    /// Runs `items` to completion and waits for every worker.
    ///
    /// Workers run as scoped tasks, which requires a multi-threaded tokio
    /// runtime.
    ///
    /// # Errors
    ///
    /// Returns the first worker error once all workers have stopped. A
    /// failing worker does not stop the others.
    pub async fn run(&self, items: Vec<TestItem>) -> anyhow::Result<RunSummary> {
        let start = Instant::now();
        let total_tests = items.len();

        std::fs::create_dir_all(&self.results_dir).with_context(|| {
            format!("Failed to create results dir: {}", self.results_dir.display())
        })?;

        if self.machines.is_empty() {
            warn!("No machines configured; {} tests will not run", total_tests);
        }
        info!(
            "Distributing {} tests across {} machines",
            total_tests,
            self.machines.len()
        );

        let queue = WorkQueue::new(items);
        let reports: Mutex<Vec<WorkerReport>> = Mutex::new(Vec::new());
        let errors: Mutex<Vec<anyhow::Error>> = Mutex::new(Vec::new());

        // Scoped spawns let workers borrow the queue and machines.
        tokio_scoped::scope(|scope| {
            for machine in &self.machines {
                let queue = &queue;
                let results_dir = self.results_dir.as_path();
                let reports = &reports;
                let errors = &errors;

                scope.spawn(async move {
                    let outcome: anyhow::Result<WorkerReport> = async {
                        Worker::start(machine, queue, results_dir).await?.run().await
                    }
                    .await;

                    match outcome {
                        Ok(report) => reports.lock().await.push(report),
                        Err(e) => {
                            error!("Worker for {} failed: {:#}", machine.hostname(), e);
                            errors.lock().await.push(e);
                        }
                    }
                });
            }
        });

        let mut reports = reports.into_inner();
        reports.sort_by(|a, b| a.hostname.cmp(&b.hostname));
        let unclaimed = queue.names();

        let summary = RunSummary {
            total_tests,
            reports,
            unclaimed,
            duration: start.elapsed(),
        };

        for name in &summary.unclaimed {
            warn!("No machine could run {}", name);
        }
        info!(
            "Run complete: {} run, {} passed, {} failed, {} unclaimed in {:?}",
            summary.tests_run(),
            summary.passed(),
            summary.failed(),
            summary.unclaimed.len(),
            summary.duration
        );

        if let Some(first) = errors.into_inner().into_iter().next() {
            return Err(first);
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::testing::FakeMachine;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_constrained_tests_land_on_matching_machines() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = Orchestrator::new(
            vec![
                FakeMachine::new("m1", &["wifi"]),
                FakeMachine::new("m2", &[]),
            ],
            dir.path(),
        );

        let summary = orchestrator
            .run(vec![
                TestItem::new("A").with_include(["wifi"]),
                TestItem::new("B").with_exclude(["wifi"]),
                TestItem::new("C"),
            ])
            .await
            .unwrap();

        let m1 = &summary.reports[0];
        let m2 = &summary.reports[1];
        assert_eq!(m1.hostname, "m1");
        assert!(m1.claimed.contains(&"A".to_string()));
        assert!(m2.claimed.contains(&"B".to_string()));
        let c_count = summary
            .reports
            .iter()
            .filter(|r| r.claimed.contains(&"C".to_string()))
            .count();
        assert_eq!(c_count, 1);
        assert_eq!(summary.tests_run(), 3);
        assert!(summary.unclaimed.is_empty());
        assert!(summary.success());
        assert_eq!(summary.exit_code(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unrunnable_tests_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = Orchestrator::new(vec![FakeMachine::new("m1", &[])], dir.path());

        let summary = orchestrator
            .run(vec![
                TestItem::new("A").with_include(["cellular"]),
                TestItem::new("B"),
            ])
            .await
            .unwrap();

        assert_eq!(summary.unclaimed, vec!["A"]);
        assert_eq!(summary.passed(), 1);
        assert!(!summary.success());
        assert_eq!(summary.exit_code(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failed_tests_fail_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator =
            Orchestrator::new(vec![FakeMachine::new("m1", &[]).failing("B")], dir.path());

        let summary = orchestrator
            .run(vec![TestItem::new("A"), TestItem::new("B")])
            .await
            .unwrap();

        assert_eq!(summary.tests_run(), 2);
        assert_eq!(summary.failed(), 1);
        assert_eq!(summary.exit_code(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_all_tests_run_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let machines: Vec<_> = (0..4)
            .map(|i| {
                let attrs: &[&str] = if i % 2 == 0 { &["wifi"] } else { &[] };
                FakeMachine::new(&format!("m{}", i), attrs).with_delay(Duration::from_millis(1))
            })
            .collect();
        let orchestrator = Orchestrator::new(machines, dir.path());

        let items: Vec<_> = (0..40)
            .map(|i| match i % 3 {
                0 => TestItem::new(format!("t{}", i)).with_include(["wifi"]),
                1 => TestItem::new(format!("t{}", i)).with_exclude(["wifi"]),
                _ => TestItem::new(format!("t{}", i)),
            })
            .collect();

        let summary = orchestrator.run(items).await.unwrap();

        let mut ran: Vec<String> = orchestrator
            .machines()
            .iter()
            .flat_map(|m| m.ran())
            .collect();
        ran.sort();
        ran.dedup();
        assert_eq!(ran.len(), 40);
        assert_eq!(summary.tests_run(), 40);
        assert!(summary.success());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_worker_error_is_returned_after_others_finish() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = Orchestrator::new(
            vec![
                FakeMachine::new("m1", &["wifi"]).broken_on("A"),
                FakeMachine::new("m2", &[]),
            ],
            dir.path(),
        );

        let err = orchestrator
            .run(vec![
                TestItem::new("A").with_include(["wifi"]),
                TestItem::new("B").with_exclude(["wifi"]),
                TestItem::new("C").with_exclude(["wifi"]),
            ])
            .await
            .unwrap_err();

        assert!(format!("{:#}", err).contains("m1"));
        let mut ran = orchestrator.machines()[1].ran();
        ran.sort();
        assert_eq!(ran, vec!["B", "C"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_empty_run() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = Orchestrator::new(vec![FakeMachine::new("m1", &[])], dir.path());

        let summary = orchestrator.run(Vec::new()).await.unwrap();

        assert_eq!(summary.total_tests, 0);
        assert!(summary.success());
        assert!(dir.path().join("m1").join("keyval").exists());
    }
}
