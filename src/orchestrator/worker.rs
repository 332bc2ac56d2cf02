//! Per-machine worker loop.
//!
//! A [`Worker`] is bound to one [`Machine`] for the whole run. It repeatedly
//! claims a compatible test from the shared [`WorkQueue`], makes sure the
//! machine is provisioned, and runs the test. The machine runs every test in
//! its own child process, and the wait for that process happens with the
//! queue unlocked.
//!
//! # Error Handling
//!
//! | Error | Worker reaction |
//! |-------|-----------------|
//! | Expected ([`MachineError::is_expected`](crate::machine::MachineError::is_expected)) | Logged, counted as failed, next claim |
//! | Internal | Test returned to the queue, worker stops, error propagated |

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use super::WorkQueue;
use crate::item::AttributeSet;
use crate::machine::Machine;

/// Version of the per-machine status record written at worker start.
pub const STATUS_VERSION: u32 = 1;

/// Name of the per-machine metadata file.
pub const KEYVAL_FILE: &str = "keyval";

/// What a worker did during a run.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerReport {
    /// Host name of the machine.
    pub hostname: String,

    /// Attributes the machine was matched with.
    pub attributes: AttributeSet,

    /// Results directory of the machine.
    pub results_dir: PathBuf,

    /// Number of tests executed, passed or failed.
    pub tests_run: usize,

    /// Number of tests that passed.
    pub passed: usize,

    /// Number of tests that failed with an expected error.
    pub failed: usize,

    /// Names of the claimed tests, in claim order.
    pub claimed: Vec<String>,

    /// When the worker started.
    pub started_at: DateTime<Utc>,

    /// When the worker ran out of work.
    pub finished_at: Option<DateTime<Utc>>,
}

/// Runs tests from a shared queue on a single machine.
pub struct Worker<'a, M> {
    machine: &'a M,
    queue: &'a WorkQueue,
    report: WorkerReport,
}

impl<'a, M: Machine> Worker<'a, M> {
    /// Prepares a worker for `machine`.
    ///
    /// Computes the machine's attributes once, creates its results directory
    /// under `results_root`, and writes the machine's keyval record there.
    ///
    /// # Errors
    ///
    /// Returns an error if the attributes cannot be determined or the results
    /// directory cannot be written.
    pub async fn start(machine: &'a M, queue: &'a WorkQueue, results_root: &Path) -> Result<Self> {
        let hostname = machine.hostname().to_string();
        let attributes = machine
            .attributes()
            .await
            .with_context(|| format!("Failed to read attributes of {}", hostname))?;

        let results_dir = results_root.join(&hostname);
        std::fs::create_dir_all(&results_dir).with_context(|| {
            format!("Failed to create results dir: {}", results_dir.display())
        })?;
        write_keyval(
            &results_dir,
            &[
                ("hostname", hostname.as_str()),
                ("status_version", &STATUS_VERSION.to_string()),
            ],
        )?;

        info!("Worker started: {} attributes={:?}", hostname, attributes);

        Ok(Self {
            machine,
            queue,
            report: WorkerReport {
                hostname,
                attributes,
                results_dir,
                tests_run: 0,
                passed: 0,
                failed: 0,
                claimed: Vec::new(),
                started_at: Utc::now(),
                finished_at: None,
            },
        })
    }

    /// Returns the report so far.
    pub fn report(&self) -> &WorkerReport {
        &self.report
    }

    /// Claims and runs tests until none compatible with this machine remain.
    ///
    /// # Errors
    ///
    /// Returns the first internal error. The test being handled at that
    /// moment is pushed back onto the queue first, so it is not lost.
    pub async fn run(mut self) -> Result<WorkerReport> {
        let hostname = self.report.hostname.clone();

        while let Some(test) = self.queue.claim(&self.report.attributes) {
            self.report.claimed.push(test.name.clone());

            if !self.machine.is_provisioned().await
                && let Err(e) = self.machine.provision().await
            {
                error!("Failed to provision {}: {}", hostname, e);
                self.queue.push(test);
                return Err(e).with_context(|| format!("Failed to provision {}", hostname));
            }

            info!("{} running {}", hostname, test);
            match self.machine.run_test(&test, &self.report.results_dir).await {
                Ok(run) => {
                    info!("{} passed {} in {:?}", hostname, run.test, run.duration);
                    self.report.passed += 1;
                }
                Err(e) if e.is_expected() => {
                    error!("Error running test \"{}\" on {}: {}", test, hostname, e);
                    self.report.failed += 1;
                }
                Err(e) => {
                    error!("Exception running test \"{}\" on {}: {}", test, hostname, e);
                    let name = test.name.clone();
                    self.queue.push(test);
                    return Err(e)
                        .with_context(|| format!("Worker for {} aborted on {}", hostname, name));
                }
            }
            self.report.tests_run += 1;
        }

        if self.queue.is_shut_down() {
            warn!("{} stopped: queue shut down", hostname);
        }
        info!("{} completed {} tests.", hostname, self.report.tests_run);

        self.report.finished_at = Some(Utc::now());
        Ok(self.report)
    }
}

/// Appends `key=value` lines to the keyval file in `dir`.
pub fn write_keyval(dir: &Path, pairs: &[(&str, &str)]) -> Result<()> {
    let path = dir.join(KEYVAL_FILE);
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    for (key, value) in pairs {
        writeln!(file, "{}={}", key, value)
            .with_context(|| format!("Failed to write {}", path.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::TestItem;
    use crate::orchestrator::testing::FakeMachine;

    #[tokio::test]
    async fn test_start_writes_keyval() {
        let dir = tempfile::tempdir().unwrap();
        let machine = FakeMachine::new("host1", &["wifi"]);
        let queue = WorkQueue::default();

        let worker = Worker::start(&machine, &queue, dir.path()).await.unwrap();

        let keyval = std::fs::read_to_string(dir.path().join("host1").join(KEYVAL_FILE)).unwrap();
        assert_eq!(keyval, "hostname=host1\nstatus_version=1\n");
        assert_eq!(worker.report().results_dir, dir.path().join("host1"));
    }

    #[tokio::test]
    async fn test_runs_only_compatible_tests() {
        let dir = tempfile::tempdir().unwrap();
        let machine = FakeMachine::new("host1", &[]);
        let queue = WorkQueue::new([
            TestItem::new("a"),
            TestItem::new("b").with_include(["wifi"]),
            TestItem::new("c"),
        ]);

        let report = Worker::start(&machine, &queue, dir.path())
            .await
            .unwrap()
            .run()
            .await
            .unwrap();

        assert_eq!(report.claimed, vec!["a", "c"]);
        assert_eq!(report.tests_run, 2);
        assert_eq!(report.passed, 2);
        assert_eq!(queue.names(), vec!["b"]);
        assert!(report.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_expected_failures_continue() {
        let dir = tempfile::tempdir().unwrap();
        let machine = FakeMachine::new("host1", &[]).failing("a").unreachable_on("b");
        let queue = WorkQueue::new([TestItem::new("a"), TestItem::new("b"), TestItem::new("c")]);

        let report = Worker::start(&machine, &queue, dir.path())
            .await
            .unwrap()
            .run()
            .await
            .unwrap();

        assert_eq!(report.tests_run, 3);
        assert_eq!(report.failed, 2);
        assert_eq!(report.passed, 1);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_internal_error_aborts_and_requeues() {
        let dir = tempfile::tempdir().unwrap();
        let machine = FakeMachine::new("host1", &[]).broken_on("b");
        let queue = WorkQueue::new([TestItem::new("a"), TestItem::new("b"), TestItem::new("c")]);

        let err = Worker::start(&machine, &queue, dir.path())
            .await
            .unwrap()
            .run()
            .await
            .unwrap_err();

        assert!(err.to_string().contains("aborted on b"));
        assert_eq!(machine.ran(), vec!["a", "b"]);
        assert_eq!(queue.names(), vec!["c", "b"]);
    }

    #[tokio::test]
    async fn test_provisions_once_on_first_claim() {
        let dir = tempfile::tempdir().unwrap();
        let machine = FakeMachine::new("host1", &[]).unprovisioned();
        let queue = WorkQueue::new([TestItem::new("a"), TestItem::new("b")]);

        Worker::start(&machine, &queue, dir.path())
            .await
            .unwrap()
            .run()
            .await
            .unwrap();

        assert_eq!(machine.provision_count(), 1);
    }

    #[tokio::test]
    async fn test_no_provision_without_work() {
        let dir = tempfile::tempdir().unwrap();
        let machine = FakeMachine::new("host1", &[]).unprovisioned();
        let queue = WorkQueue::new([TestItem::new("a").with_include(["wifi"])]);

        let report = Worker::start(&machine, &queue, dir.path())
            .await
            .unwrap()
            .run()
            .await
            .unwrap();

        assert_eq!(report.tests_run, 0);
        assert_eq!(machine.provision_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_stops_worker() {
        let dir = tempfile::tempdir().unwrap();
        let machine = FakeMachine::new("host1", &[]);
        let queue = WorkQueue::new([TestItem::new("a")]);
        queue.shutdown();

        let report = Worker::start(&machine, &queue, dir.path())
            .await
            .unwrap()
            .run()
            .await
            .unwrap();

        assert_eq!(report.tests_run, 0);
        assert_eq!(queue.len(), 1);
    }
}
