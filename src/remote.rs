//! Remote task scheduling.
//!
//! Instead of owning machines, the remote path hands each test to a remote
//! executor as a [`TaskRequest`](request::TaskRequest) and tracks the
//! resulting task until it reaches a terminal state.
//!
//! ```text
//!  TestItem ──► TaskRequestBuilder ──► TaskRequest
//!                                          │
//!                                          ▼ trigger
//!                                     TaskService ◄── query / cancel
//!                                          │
//!                                          ▼
//!                                    SuiteTracker ──► retry eligible tasks
//! ```
//!
//! # Modules
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`request`] | Priorities and the typed request builder |
//! | [`state`] | Task states, classification, task records |
//! | [`bots`] | Bot counts and availability |
//! | [`client`] | The [`TaskService`] trait and its command line implementation |
//! | [`suite`] | Retry and completion tracking |

pub mod bots;
pub mod client;
pub mod request;
pub mod state;
pub mod suite;

use std::collections::BTreeMap;

use crate::config::RemoteConfig;
use crate::item::TestItem;

pub use client::{CliTaskService, RemoteError, RemoteResult, TaskService, task_link};
pub use request::{Priority, RequestError, TaskRequest, TaskRequestBuilder};
pub use state::{TaskRecord, TaskState};
pub use suite::{RetryPolicy, SuiteTracker, WaitOutcome};

/// Tag that groups the tasks of one suite.
pub const SUITE_TAG: &str = "suite";

/// Tag and field naming the suite task that submitted a task.
pub const PARENT_TAG: &str = "parent_task_id";

/// Dimension pinning the build a bot must be able to provision.
pub const BUILD_DIMENSION: &str = "provisionable-cros-version";

/// Bot dimensions for `config`: its extra dimensions plus the pool, board and
/// DUT state labels, when set.
pub fn dimensions(config: &RemoteConfig) -> BTreeMap<String, String> {
    let mut dims: BTreeMap<String, String> = config
        .dimensions
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    if let Some(pool) = &config.pool {
        dims.insert("label-pool".to_string(), request::dut_pool_label(pool));
    }
    if let Some(board) = &config.board {
        dims.insert("label-board".to_string(), board.clone());
    }
    if !config.dut_state.is_empty() {
        dims.insert("dut_state".to_string(), config.dut_state.clone());
    }
    dims
}

/// Dimensions of every slice of a request, primary slice first.
///
/// The primary slice also requires the configured build. Each fallback
/// overlays its table on the base dimensions, dropping keys set to `""`.
pub fn slice_dimensions(config: &RemoteConfig) -> Vec<BTreeMap<String, String>> {
    let base = dimensions(config);

    let mut primary = base.clone();
    if let Some(build) = &config.build {
        primary.insert(BUILD_DIMENSION.to_string(), build.clone());
    }

    let mut slices = vec![primary];
    for overlay in &config.fallback_dimensions {
        let mut dims = base.clone();
        for (key, value) in overlay {
            if value.is_empty() {
                dims.remove(key);
            } else {
                dims.insert(key.clone(), value.clone());
            }
        }
        slices.push(dims);
    }
    slices
}

/// Builds the remote request for `test`.
///
/// The command is the configured prefix followed by the test name and its
/// `key=value` arguments; every slice runs the same command. Every task is
/// tagged with the suite name, and with `parent` when the suite itself runs
/// as a task.
///
/// # Errors
///
/// Returns an error if the configured command is empty.
pub fn request_for(
    test: &TestItem,
    config: &RemoteConfig,
    suite: &str,
    parent: Option<&str>,
) -> Result<TaskRequest, RequestError> {
    let mut command = config.command.clone();
    if !command.is_empty() {
        command.push(test.name.clone());
        command.extend(test.args_as_words());
    }

    let mut builder = TaskRequestBuilder::new(test.name.clone())
        .priority(config.priority)
        .user(config.user.clone())
        .tag(SUITE_TAG, suite)
        .tag("test", &test.name)
        .expiration_secs(config.expiration_secs)
        .execution_timeout_secs(config.execution_timeout_secs)
        .grace_period_secs(config.grace_period_secs)
        .io_timeout_secs(config.io_timeout_secs);
    if let Some(build) = &config.build {
        builder = builder.tag("build", build);
    }
    if let Some(parent) = parent {
        builder = builder.tag(PARENT_TAG, parent).parent_task_id(parent);
    }
    for dims in slice_dimensions(config) {
        builder = builder.slice(command.clone(), dims);
    }
    builder.build()
}
