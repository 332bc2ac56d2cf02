//! Configuration schema definitions for fleetrun.
//!
//! This module defines all configuration types that can be deserialized from
//! TOML configuration files.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── SchedulerConfig        - Results directory for local runs
//! ├── RunnerConfig           - How local machines run tests (optional)
//! ├── MachineConfig[]        - Hosts and their static attributes
//! ├── TestItem[]             - Tests with include/exclude constraints
//! ├── ExecutorConfig         - Remote executor endpoint and credentials (optional)
//! └── RemoteConfig           - Defaults for remote task requests and retries
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::item::TestItem;
use crate::remote::request::{DEFAULT_EXPIRATION_SECS, DEFAULT_TIMEOUT_SECS, Priority};

/// Root configuration structure for fleetrun.
///
/// # TOML Structure
///
/// ```toml
/// [scheduler]
/// results_dir = "results"
///
/// [runner]
/// run_command = "ssh {host} run-test {test} {args}"
///
/// [[machines]]
/// hostname = "chromeos1-row1-host1"
/// attributes = ["wifi"]
///
/// [[tests]]
/// name = "network_WiFiConnect"
/// include = ["wifi"]
/// ```
///
/// # Example
///
/// ```
/// use fleetrun::config::Config;
///
/// let config: Config = toml::from_str(r#"
///     [[machines]]
///     hostname = "host1"
///
///     [[tests]]
///     name = "dummy_Pass"
/// "#).unwrap();
/// assert_eq!(config.machines.len(), 1);
/// assert!(config.runner.is_none());
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Settings for local distribution runs.
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// How tests are run on local machines. Required by `fleetrun run`.
    pub runner: Option<RunnerConfig>,

    /// Machines available for local distribution.
    #[serde(default)]
    pub machines: Vec<MachineConfig>,

    /// Tests to schedule.
    #[serde(default)]
    pub tests: Vec<TestItem>,

    /// Remote executor endpoint. Required by the remote subcommands.
    pub executor: Option<ExecutorConfig>,

    /// Defaults for remote task requests.
    #[serde(default)]
    pub remote: RemoteConfig,
}

/// Settings for local distribution runs.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `results_dir` | `results` |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchedulerConfig {
    /// Root directory for results; each machine gets a subdirectory.
    #[serde(default = "default_results_dir")]
    pub results_dir: PathBuf,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            results_dir: default_results_dir(),
        }
    }
}

fn default_results_dir() -> PathBuf {
    PathBuf::from("results")
}

/// How tests are run on local machines.
///
/// Commands are executed via `{shell} -c "{command}"`, one child process per
/// test. See [`crate::machine::process`] for the template placeholders.
///
/// # Example
///
/// ```toml
/// [runner]
/// run_command = "ssh {host} autotest-run --results {results_dir} {test} {args}"
/// provision_command = "ssh {host} install-autotest"
/// attributes_command = "host-labels {host}"
/// test_timeout_secs = 1800
///
/// [runner.env]
/// PYTHONUNBUFFERED = "1"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunnerConfig {
    /// Shell used to run commands.
    ///
    /// Default: `/bin/sh`
    #[serde(default = "default_shell")]
    pub shell: String,

    /// Template for running a single test.
    pub run_command: String,

    /// Template that installs the shared test client on a host.
    ///
    /// Runs at most once per machine, before its first test.
    pub provision_command: Option<String>,

    /// Template that prints extra host attributes, one per line.
    pub attributes_command: Option<String>,

    /// Maximum run time for a single test in seconds.
    ///
    /// Default: 3600 (1 hour)
    #[serde(default = "default_test_timeout")]
    pub test_timeout_secs: u64,

    /// Exit codes of the run command that mean the host was unreachable.
    ///
    /// Default: `[255]` (ssh connection failure)
    #[serde(default = "default_unreachable_exit_codes")]
    pub unreachable_exit_codes: Vec<i32>,

    /// Environment variables set for every command.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

fn default_shell() -> String {
    "/bin/sh".to_string()
}

fn default_test_timeout() -> u64 {
    3600
}

fn default_unreachable_exit_codes() -> Vec<i32> {
    vec![255]
}

/// A machine available for local distribution.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MachineConfig {
    /// Host name of the machine.
    pub hostname: String,

    /// Attributes that are true for this machine.
    #[serde(default)]
    pub attributes: Vec<String>,
}

/// Remote executor endpoint and credentials.
///
/// # Example
///
/// ```toml
/// [executor]
/// server = "https://chromeos-swarming.appspot.com"
/// service_account = "~/creds/service_account.json"
/// client = "~/chromiumos/chromite/third_party/swarming.client/swarming.py"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutorConfig {
    /// Base URL of the remote executor.
    pub server: String,

    /// Path to the service-account credential file. `~` is expanded.
    pub service_account: PathBuf,

    /// Executor client command. Split with shell-words; `~` is expanded.
    ///
    /// Default: `swarming.py`
    #[serde(default = "default_client")]
    pub client: String,

    /// Timeout for a single client invocation in seconds.
    ///
    /// Default: 60
    #[serde(default = "default_client_timeout")]
    pub timeout_secs: u64,
}

fn default_client() -> String {
    "swarming.py".to_string()
}

fn default_client_timeout() -> u64 {
    60
}

/// Defaults for remote task requests and the retry policy.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `priority` | `Default` (140) |
/// | `user` | `fleetrun` |
/// | `expiration_secs` | 600 |
/// | `execution_timeout_secs` | 3600 |
/// | `grace_period_secs` | 3600 |
/// | `io_timeout_secs` | 3600 |
/// | `test_retries` | 0 |
/// | `max_retries` | 0 |
/// | `retry_test_failures` | false |
/// | `poll_interval_secs` | 30 |
/// | `wait_timeout_secs` | 0 (no limit) |
/// | `dut_state` | `ready` |
///
/// # Fallback Slices
///
/// Every request has a primary slice with the full set of dimensions. Each
/// `[[remote.fallback_dimensions]]` table adds one more slice, tried once the
/// previous one expires. A fallback slice starts from the base dimensions
/// (without `provisionable-cros-version`) and applies its table on top; a key
/// set to `""` is dropped.
///
/// ```toml
/// [remote]
/// build = "eve-release/R70-11011.0.0"
///
/// [[remote.fallback_dimensions]]
/// dut_state = ""
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RemoteConfig {
    /// Priority tier for submitted tasks.
    #[serde(default)]
    pub priority: Priority,

    /// User the tasks are submitted as.
    #[serde(default = "default_user")]
    pub user: String,

    /// Seconds a slice may wait for a capable bot.
    #[serde(default = "default_expiration")]
    pub expiration_secs: u64,

    /// Seconds a task may run before it is terminated.
    #[serde(default = "default_remote_timeout")]
    pub execution_timeout_secs: u64,

    /// Seconds between SIGTERM and SIGKILL.
    #[serde(default = "default_remote_timeout")]
    pub grace_period_secs: u64,

    /// Seconds without output before a task is considered hung.
    #[serde(default = "default_remote_timeout")]
    pub io_timeout_secs: u64,

    /// Retries allowed per test.
    #[serde(default)]
    pub test_retries: u32,

    /// Retries allowed across the whole suite.
    #[serde(default)]
    pub max_retries: u32,

    /// Also retry tasks that completed with a test failure.
    #[serde(default)]
    pub retry_test_failures: bool,

    /// Seconds between task polls while waiting.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Give up waiting after this many seconds. 0 waits forever.
    #[serde(default)]
    pub wait_timeout_secs: u64,

    /// Logical DUT pool (`cq`, `bvt`, `suites`, ...), mapped to a `label-pool` dimension.
    pub pool: Option<String>,

    /// Board, used as the `label-board` dimension.
    pub board: Option<String>,

    /// Extra dimensions added to every task.
    #[serde(default)]
    pub dimensions: HashMap<String, String>,

    /// Command prefix run on the bot; the test name and arguments are appended.
    #[serde(default = "default_remote_command")]
    pub command: Vec<String>,

    /// Required `dut_state` of the bot. Empty means any state.
    #[serde(default = "default_dut_state")]
    pub dut_state: String,

    /// Build under test. Adds a `provisionable-cros-version` dimension to the
    /// primary slice and a `build` tag.
    pub build: Option<String>,

    /// Relaxed dimension sets, one fallback slice each.
    #[serde(default)]
    pub fallback_dimensions: Vec<HashMap<String, String>>,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            priority: Priority::default(),
            user: default_user(),
            expiration_secs: default_expiration(),
            execution_timeout_secs: default_remote_timeout(),
            grace_period_secs: default_remote_timeout(),
            io_timeout_secs: default_remote_timeout(),
            test_retries: 0,
            max_retries: 0,
            retry_test_failures: false,
            poll_interval_secs: default_poll_interval(),
            wait_timeout_secs: 0,
            pool: None,
            board: None,
            dimensions: HashMap::new(),
            command: default_remote_command(),
            dut_state: default_dut_state(),
            build: None,
            fallback_dimensions: Vec::new(),
        }
    }
}

impl RemoteConfig {
    /// Interval between task polls.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    /// Overall wait limit, if any.
    pub fn wait_timeout(&self) -> Option<Duration> {
        (self.wait_timeout_secs > 0).then(|| Duration::from_secs(self.wait_timeout_secs))
    }
}

fn default_user() -> String {
    "fleetrun".to_string()
}

fn default_expiration() -> u64 {
    DEFAULT_EXPIRATION_SECS
}

fn default_remote_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_poll_interval() -> u64 {
    30
}

fn default_dut_state() -> String {
    "ready".to_string()
}

fn default_remote_command() -> Vec<String> {
    vec!["run-test".to_string()]
}
