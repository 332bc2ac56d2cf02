//! Remote task states and task records.
//!
//! ```text
//! PENDING --(bot assigned)--> RUNNING
//! RUNNING --> COMPLETED_SUCCESS | COMPLETED_FAILURE
//! RUNNING/PENDING --> EXPIRED [retryable] | CANCELED [never retried]
//! RUNNING --> TIMED_OUT [retryable] | BOT_DIED [retryable]
//! PENDING --> NO_RESOURCE [retryable]
//! ```
//!
//! The executor reports a finished task as `COMPLETED` plus a separate
//! `failure` flag; [`classify`] folds the two into one [`TaskState`].
//! States outside this table (`KILLED`, `CLIENT_ERROR`, ...) parse as
//! `UNKNOWN`, which is terminal and never retried.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Task state as reported by the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RawTaskState {
    Pending,
    Running,
    Completed,
    Expired,
    Canceled,
    TimedOut,
    BotDied,
    NoResource,
    /// Any state not listed above.
    #[serde(other)]
    Unknown,
}

/// Classified task state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Pending,
    Running,
    CompletedSuccess,
    CompletedFailure,
    Expired,
    Canceled,
    TimedOut,
    BotDied,
    NoResource,
    Unknown,
}

/// Folds a raw state and the failure flag into a [`TaskState`].
pub fn classify(raw: RawTaskState, failure: bool) -> TaskState {
    match raw {
        RawTaskState::Pending => TaskState::Pending,
        RawTaskState::Running => TaskState::Running,
        RawTaskState::Completed if failure => TaskState::CompletedFailure,
        RawTaskState::Completed => TaskState::CompletedSuccess,
        RawTaskState::Expired => TaskState::Expired,
        RawTaskState::Canceled => TaskState::Canceled,
        RawTaskState::TimedOut => TaskState::TimedOut,
        RawTaskState::BotDied => TaskState::BotDied,
        RawTaskState::NoResource => TaskState::NoResource,
        RawTaskState::Unknown => TaskState::Unknown,
    }
}

impl TaskState {
    /// Returns `true` once the task can no longer change state.
    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskState::Pending | TaskState::Running)
    }

    /// Returns `true` for infrastructure failures worth resubmitting.
    ///
    /// Cancellation is deliberate and never retried.
    pub fn is_retry_eligible(self) -> bool {
        matches!(
            self,
            TaskState::Expired | TaskState::TimedOut | TaskState::BotDied | TaskState::NoResource
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Pending => "PENDING",
            TaskState::Running => "RUNNING",
            TaskState::CompletedSuccess => "COMPLETED (SUCCESS)",
            TaskState::CompletedFailure => "COMPLETED (FAILURE)",
            TaskState::Expired => "EXPIRED",
            TaskState::Canceled => "CANCELED",
            TaskState::TimedOut => "TIMED_OUT",
            TaskState::BotDied => "BOT_DIED",
            TaskState::NoResource => "NO_RESOURCE",
            TaskState::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A bot dimension as reported on a task; values are lists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotDimension {
    pub key: String,
    #[serde(default)]
    pub value: Vec<String>,
}

/// A task as returned by the executor's task queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    #[serde(default)]
    pub name: String,
    pub state: RawTaskState,
    #[serde(default)]
    pub failure: bool,
    #[serde(default)]
    pub bot_dimensions: Vec<BotDimension>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl TaskRecord {
    /// Classified state of this task.
    pub fn final_state(&self) -> TaskState {
        classify(self.state, self.failure)
    }

    /// Name of the DUT the task ran on, if a bot was assigned.
    pub fn dut_name(&self) -> Option<&str> {
        self.bot_dimensions
            .iter()
            .find(|d| d.key == "dut_name")
            .and_then(|d| d.value.first())
            .map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_completed() {
        assert_eq!(classify(RawTaskState::Completed, true), TaskState::CompletedFailure);
        assert_eq!(classify(RawTaskState::Completed, false), TaskState::CompletedSuccess);
        assert_eq!(classify(RawTaskState::BotDied, true), TaskState::BotDied);
    }

    #[test]
    fn test_retry_eligibility() {
        assert!(!TaskState::Canceled.is_retry_eligible());
        assert!(TaskState::BotDied.is_retry_eligible());
        assert!(TaskState::Expired.is_retry_eligible());
        assert!(TaskState::TimedOut.is_retry_eligible());
        assert!(TaskState::NoResource.is_retry_eligible());
        assert!(!TaskState::CompletedFailure.is_retry_eligible());
        assert!(!TaskState::Running.is_retry_eligible());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!TaskState::Pending.is_terminal());
        assert!(!TaskState::Running.is_terminal());
        assert!(TaskState::Canceled.is_terminal());
        assert!(TaskState::CompletedSuccess.is_terminal());
        assert!(TaskState::Unknown.is_terminal());
    }

    #[test]
    fn test_unlisted_states_are_terminal_and_not_retried() {
        let records: Vec<TaskRecord> = serde_json::from_str(
            r#"[
                {"task_id": "1", "state": "KILLED"},
                {"task_id": "2", "state": "CLIENT_ERROR", "failure": true},
                {"task_id": "3", "state": "BOT_DIED"}
            ]"#,
        )
        .unwrap();

        let states: Vec<_> = records.iter().map(|r| r.final_state()).collect();
        assert_eq!(
            states,
            vec![TaskState::Unknown, TaskState::Unknown, TaskState::BotDied]
        );
        assert!(!TaskState::Unknown.is_retry_eligible());
        assert_eq!(TaskState::Unknown.to_string(), "UNKNOWN");
    }

    #[test]
    fn test_parse_task_record() {
        let record: TaskRecord = serde_json::from_str(
            r#"{
                "task_id": "3f5a",
                "name": "dummy_Pass",
                "state": "COMPLETED",
                "failure": true,
                "bot_dimensions": [
                    {"key": "pool", "value": ["ChromeOSSkylab"]},
                    {"key": "dut_name", "value": ["chromeos1-row1-host1"]}
                ],
                "tags": ["suite:bvt"],
                "costs_usd": [0.01]
            }"#,
        )
        .unwrap();

        assert_eq!(record.final_state(), TaskState::CompletedFailure);
        assert_eq!(record.dut_name(), Some("chromeos1-row1-host1"));
    }

    #[test]
    fn test_pending_task_has_no_dut() {
        let record: TaskRecord =
            serde_json::from_str(r#"{"task_id": "1", "state": "NO_RESOURCE"}"#).unwrap();

        assert_eq!(record.final_state(), TaskState::NoResource);
        assert_eq!(record.dut_name(), None);
    }
}
