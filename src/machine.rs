//! Machine traits and implementations for running tests on lab hosts.
//!
//! A [`Machine`] is the handle a worker holds for one host. It knows the
//! host's attributes, whether the shared test client is installed on it, and
//! how to run a single test with its output written under a results
//! directory.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Machine                             │
//! │                                                              │
//! │  attributes()      ──► AttributeSet (computed once)          │
//! │  is_provisioned()  ──► bool                                  │
//! │  provision()       ──► installs the shared client            │
//! │  run_test(item, dir) ──► TestRun | MachineError              │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Built-in Machines
//!
//! | Machine | Module | Description |
//! |---------|--------|-------------|
//! | Process | [`process`] | Runs each test as a spawned child process |
//!
//! # Error Handling
//!
//! All machine operations return [`MachineResult<T>`]. Errors are split into
//! *expected* failures, which are data about a test or host, and internal
//! failures, which mean the scheduler itself is broken. See
//! [`MachineError::is_expected`].

pub mod process;

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use crate::item::{AttributeSet, TestItem};

/// Result type for machine operations.
pub type MachineResult<T> = Result<T, MachineError>;

/// Errors that can occur while running tests on a machine.
///
/// Errors fall into two categories:
/// - **Expected**: `TestFailed`, `Unreachable`, `Timeout` - the test or host
///   misbehaved; the worker logs them and moves on
/// - **Internal**: everything else - the worker stops and propagates
///
/// # Example
///
/// ```
/// use fleetrun::machine::MachineError;
///
/// let err = MachineError::TestFailed { test: "dummy_Fail".into(), exit_code: 1 };
/// assert!(err.is_expected());
///
/// let err = MachineError::ExecFailed("no such shell".into());
/// assert!(!err.is_expected());
/// ```
#[derive(Debug, thiserror::Error)]
pub enum MachineError {
    /// The test ran and reported failure.
    #[error("Test {test} failed with exit code {exit_code}")]
    TestFailed {
        /// Name of the failing test.
        test: String,
        /// Exit code of the test process.
        exit_code: i32,
    },

    /// The host could not be reached.
    #[error("Host unreachable: {0}")]
    Unreachable(String),

    /// The test exceeded its time budget and was killed.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Installing the shared test client failed.
    #[error("Failed to provision machine: {0}")]
    ProvisionFailed(String),

    /// A command could not be started.
    #[error("Failed to execute command: {0}")]
    ExecFailed(String),

    /// I/O error while preparing logs or result directories.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other machine errors.
    #[error("Machine error: {0}")]
    Other(#[from] anyhow::Error),
}

impl MachineError {
    /// Returns `true` if this error describes a test or host failure rather
    /// than a scheduler bug.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            MachineError::TestFailed { .. } | MachineError::Unreachable(_) | MachineError::Timeout(_)
        )
    }
}

/// A completed, passing test execution.
#[derive(Debug, Clone)]
pub struct TestRun {
    /// Name of the test that ran.
    pub test: String,

    /// Directory holding the captured stdout and stderr.
    pub log_dir: PathBuf,

    /// Wall-clock time the test took.
    pub duration: Duration,
}

/// A host that tests can be run on.
///
/// Implementations must be `Send + Sync`: each machine is owned by exactly
/// one worker, but workers run as concurrent tasks.
#[async_trait]
pub trait Machine: Send + Sync {
    /// Returns the host name of this machine.
    fn hostname(&self) -> &str;

    /// Computes the set of attributes that are true for this machine.
    ///
    /// Workers call this once at start and keep the result for their
    /// whole lifetime.
    async fn attributes(&self) -> MachineResult<AttributeSet>;

    /// Returns whether the shared test client is already installed.
    async fn is_provisioned(&self) -> bool;

    /// Installs the shared test client.
    ///
    /// Must be idempotent: calling it on a provisioned machine is a no-op.
    async fn provision(&self) -> MachineResult<()>;

    /// Runs one test, writing its output under `results_dir`.
    ///
    /// Each call must run in its own child process so that a crashing test
    /// cannot corrupt the caller or a concurrently running test.
    ///
    /// # Errors
    ///
    /// - `MachineError::TestFailed` - the test ran and failed
    /// - `MachineError::Unreachable` - the host could not be reached
    /// - `MachineError::Timeout` - the test ran too long
    async fn run_test(&self, test: &TestItem, results_dir: &Path) -> MachineResult<TestRun>;
}
