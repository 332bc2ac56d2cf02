//! Typed remote task requests.
//!
//! A [`TaskRequest`] describes one remote task as an ordered list of
//! [`TaskSlice`]s. The executor tries the slices in order: if no bot matches
//! a slice's dimensions before its `expiration_secs` runs out, it falls back
//! to the next one.
//!
//! Requests are built with [`TaskRequestBuilder`] and are immutable after
//! [`build`](TaskRequestBuilder::build). Serialization is order stable: struct
//! fields serialize in declaration order and dimensions are sorted by key.
//!
//! ```
//! use fleetrun::remote::request::{Priority, TaskRequestBuilder};
//!
//! let request = TaskRequestBuilder::new("dummy_Pass")
//!     .priority(Priority::Cq)
//!     .tag("suite", "bvt-inline")
//!     .slice(
//!         vec!["run-test".into(), "dummy_Pass".into()],
//!         [("pool", "DUT_POOL_CQ"), ("board", "eve")],
//!     )
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(request.priority, 50);
//! assert_eq!(request.task_slices[0].properties.dimensions[0].key, "board");
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Seconds a slice waits for a capable bot before falling back.
pub const DEFAULT_EXPIRATION_SECS: u64 = 600;

/// Default execution, grace and I/O timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 3600;

/// Errors from building a request.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum RequestError {
    /// The request has no slices.
    #[error("Request {0} has no task slices")]
    NoSlices(String),

    /// A slice has an empty command.
    #[error("Slice {index} of request {name} has an empty command")]
    EmptyCommand {
        /// Request name.
        name: String,
        /// Zero-based slice index.
        index: usize,
    },

    /// The priority name is not a known tier.
    #[error("Unknown priority: {0}")]
    UnknownPriority(String),
}

/// Scheduling priority tiers. Lower numeric values run first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum Priority {
    /// Emergency work (49).
    Super,
    /// Commit queue (50).
    #[serde(rename = "CQ")]
    Cq,
    /// Pre-flight queue (80).
    #[serde(rename = "PFQ")]
    Pfq,
    /// Build verification (110).
    Build,
    /// Everything else (140).
    #[default]
    Default,
    /// Post-build suites (170).
    PostBuild,
    /// Daily suites (200).
    Daily,
    /// Weekly suites (230).
    Weekly,
}

impl Priority {
    /// Every tier, most urgent first.
    pub const ALL: [Priority; 8] = [
        Priority::Super,
        Priority::Cq,
        Priority::Pfq,
        Priority::Build,
        Priority::Default,
        Priority::PostBuild,
        Priority::Daily,
        Priority::Weekly,
    ];

    /// Numeric priority sent to the executor.
    pub fn value(self) -> u32 {
        match self {
            Priority::Super => 49,
            Priority::Cq => 50,
            Priority::Pfq => 80,
            Priority::Build => 110,
            Priority::Default => 140,
            Priority::PostBuild => 170,
            Priority::Daily => 200,
            Priority::Weekly => 230,
        }
    }

    /// Name used in configuration and on the command line.
    pub fn name(self) -> &'static str {
        match self {
            Priority::Super => "Super",
            Priority::Cq => "CQ",
            Priority::Pfq => "PFQ",
            Priority::Build => "Build",
            Priority::Default => "Default",
            Priority::PostBuild => "PostBuild",
            Priority::Daily => "Daily",
            Priority::Weekly => "Weekly",
        }
    }

    /// `(name, value)` for every tier, sorted by value.
    pub fn sorted() -> Vec<(&'static str, u32)> {
        let mut tiers: Vec<_> = Self::ALL.iter().map(|p| (p.name(), p.value())).collect();
        tiers.sort_by_key(|&(_, value)| value);
        tiers
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Priority {
    type Err = RequestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|p| p.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| RequestError::UnknownPriority(s.to_string()))
    }
}

/// Maps a logical DUT pool name to its executor label.
///
/// Unknown pools are passed through unchanged.
pub fn dut_pool_label(pool: &str) -> String {
    match pool {
        "cq" => "DUT_POOL_CQ",
        "bvt" => "DUT_POOL_BVT",
        "suites" => "DUT_POOL_SUITES",
        "cts" => "DUT_POOL_CTS",
        "arc-presubmit" => "DUT_POOL_CTS_PERBUILD",
        other => other,
    }
    .to_string()
}

/// One bot dimension constraint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimension {
    /// Dimension name, e.g. `label-pool`.
    pub key: String,
    /// Required value.
    pub value: String,
}

/// What a slice runs and how long it may take.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskProperties {
    /// Command run on the bot.
    pub command: Vec<String>,
    /// Bot constraints, sorted by key.
    pub dimensions: Vec<Dimension>,
    /// Seconds the task may run before it is terminated.
    pub execution_timeout_secs: u64,
    /// Seconds between SIGTERM and SIGKILL.
    pub grace_period_secs: u64,
    /// Seconds without output before the task is considered hung.
    pub io_timeout_secs: u64,
}

/// One fallback attempt of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSlice {
    /// Seconds this slice may wait for a capable bot before the next one is tried.
    pub expiration_secs: u64,
    /// What the slice runs.
    pub properties: TaskProperties,
}

/// A complete remote task request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    /// Task name, normally the test name.
    pub name: String,
    /// Id of the suite task this task belongs to; empty for none.
    pub parent_task_id: String,
    /// Numeric priority; lower runs first.
    pub priority: u32,
    /// `key:value` strings.
    pub tags: Vec<String>,
    /// User the task is submitted as.
    pub user: String,
    /// Slices tried in order until one finds a bot.
    pub task_slices: Vec<TaskSlice>,
}

impl TaskRequest {
    /// Renders the request as the JSON document the executor expects.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Builder for [`TaskRequest`].
///
/// Timeouts set on the builder apply to every slice.
#[derive(Debug, Clone)]
pub struct TaskRequestBuilder {
    name: String,
    parent_task_id: String,
    priority: Priority,
    tags: Vec<String>,
    user: String,
    slices: Vec<(Vec<String>, Vec<Dimension>)>,
    expiration_secs: u64,
    execution_timeout_secs: u64,
    grace_period_secs: u64,
    io_timeout_secs: u64,
}

impl TaskRequestBuilder {
    /// Starts a request named `name` with default priority and timeouts.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parent_task_id: String::new(),
            priority: Priority::Default,
            tags: Vec::new(),
            user: String::new(),
            slices: Vec::new(),
            expiration_secs: DEFAULT_EXPIRATION_SECS,
            execution_timeout_secs: DEFAULT_TIMEOUT_SECS,
            grace_period_secs: DEFAULT_TIMEOUT_SECS,
            io_timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }

    /// Sets the priority tier.
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the parent suite task id.
    pub fn parent_task_id(mut self, id: impl Into<String>) -> Self {
        self.parent_task_id = id.into();
        self
    }

    /// Sets the submitting user.
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    /// Adds a `key:value` tag.
    pub fn tag(mut self, key: &str, value: &str) -> Self {
        self.tags.push(format!("{}:{}", key, value));
        self
    }

    /// Sets the per-slice expiration.
    pub fn expiration_secs(mut self, secs: u64) -> Self {
        self.expiration_secs = secs;
        self
    }

    /// Sets the execution timeout.
    pub fn execution_timeout_secs(mut self, secs: u64) -> Self {
        self.execution_timeout_secs = secs;
        self
    }

    /// Sets the grace period between SIGTERM and SIGKILL.
    pub fn grace_period_secs(mut self, secs: u64) -> Self {
        self.grace_period_secs = secs;
        self
    }

    /// Sets the I/O timeout.
    pub fn io_timeout_secs(mut self, secs: u64) -> Self {
        self.io_timeout_secs = secs;
        self
    }

    /// Appends a fallback slice running `command` on a bot with `dimensions`.
    ///
    /// Dimensions are sorted by key. A key given twice keeps its last value.
    pub fn slice<I, K, V>(mut self, command: Vec<String>, dimensions: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let sorted: BTreeMap<String, String> = dimensions
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        let dimensions = sorted
            .into_iter()
            .map(|(key, value)| Dimension { key, value })
            .collect();
        self.slices.push((command, dimensions));
        self
    }

    /// Builds the request.
    ///
    /// # Errors
    ///
    /// Returns an error if no slice was added or a slice has an empty
    /// command.
    pub fn build(self) -> Result<TaskRequest, RequestError> {
        if self.slices.is_empty() {
            return Err(RequestError::NoSlices(self.name));
        }
        if let Some(index) = self.slices.iter().position(|(cmd, _)| cmd.is_empty()) {
            return Err(RequestError::EmptyCommand {
                name: self.name,
                index,
            });
        }

        let task_slices = self
            .slices
            .into_iter()
            .map(|(command, dimensions)| TaskSlice {
                expiration_secs: self.expiration_secs,
                properties: TaskProperties {
                    command,
                    dimensions,
                    execution_timeout_secs: self.execution_timeout_secs,
                    grace_period_secs: self.grace_period_secs,
                    io_timeout_secs: self.io_timeout_secs,
                },
            })
            .collect();

        Ok(TaskRequest {
            name: self.name,
            parent_task_id: self.parent_task_id,
            priority: self.priority.value(),
            tags: self.tags,
            user: self.user,
            task_slices,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(name: &str) -> Vec<String> {
        vec!["run-test".to_string(), name.to_string()]
    }

    #[test]
    fn test_priority_order() {
        let values: Vec<u32> = Priority::ALL.iter().map(|p| p.value()).collect();
        assert!(values.windows(2).all(|w| w[0] < w[1]));
        assert!(Priority::Super < Priority::Cq);
        assert!(Priority::Daily < Priority::Weekly);
    }

    #[test]
    fn test_priority_sorted_table() {
        let sorted = Priority::sorted();
        assert_eq!(sorted.first(), Some(&("Super", 49)));
        assert_eq!(sorted.last(), Some(&("Weekly", 230)));
        assert_eq!(sorted.len(), 8);
    }

    #[test]
    fn test_priority_from_str() {
        assert_eq!("cq".parse::<Priority>().unwrap(), Priority::Cq);
        assert_eq!("PostBuild".parse::<Priority>().unwrap(), Priority::PostBuild);
        assert_eq!(
            "urgent".parse::<Priority>().unwrap_err(),
            RequestError::UnknownPriority("urgent".to_string())
        );
    }

    #[test]
    fn test_dimensions_sorted_by_key() {
        let request = TaskRequestBuilder::new("t")
            .slice(cmd("t"), [("pool", "x"), ("board", "y")])
            .build()
            .unwrap();

        let json = serde_json::to_value(&request.task_slices[0].properties.dimensions).unwrap();
        assert_eq!(
            json,
            serde_json::json!([
                {"key": "board", "value": "y"},
                {"key": "pool", "value": "x"}
            ])
        );
    }

    #[test]
    fn test_request_json_shape() {
        let request = TaskRequestBuilder::new("dummy_Pass")
            .priority(Priority::Build)
            .user("fleetrun")
            .parent_task_id("parent1")
            .tag("suite", "bvt")
            .slice(cmd("dummy_Pass"), [("pool", "DUT_POOL_BVT")])
            .build()
            .unwrap();

        let json = request.to_json().unwrap();
        assert!(json.starts_with(
            r#"{"name":"dummy_Pass","parent_task_id":"parent1","priority":110,"tags":["suite:bvt"],"user":"fleetrun","task_slices":"#
        ));
        assert!(json.contains(
            r#"{"expiration_secs":600,"properties":{"command":["run-test","dummy_Pass"],"dimensions":[{"key":"pool","value":"DUT_POOL_BVT"}],"execution_timeout_secs":3600,"grace_period_secs":3600,"io_timeout_secs":3600}}"#
        ));
    }

    #[test]
    fn test_fallback_slices_keep_order() {
        let request = TaskRequestBuilder::new("t")
            .expiration_secs(60)
            .slice(cmd("t"), [("dut_state", "ready")])
            .slice(cmd("t"), [("dut_state", "needs_repair")])
            .build()
            .unwrap();

        assert_eq!(request.task_slices.len(), 2);
        assert_eq!(request.task_slices[1].properties.dimensions[0].value, "needs_repair");
        assert!(request.task_slices.iter().all(|s| s.expiration_secs == 60));
    }

    #[test]
    fn test_build_rejects_missing_slices() {
        assert_eq!(
            TaskRequestBuilder::new("t").build().unwrap_err(),
            RequestError::NoSlices("t".to_string())
        );
        assert_eq!(
            TaskRequestBuilder::new("t")
                .slice(Vec::new(), [("pool", "x")])
                .build()
                .unwrap_err(),
            RequestError::EmptyCommand {
                name: "t".to_string(),
                index: 0
            }
        );
    }

    #[test]
    fn test_dut_pool_label() {
        assert_eq!(dut_pool_label("cq"), "DUT_POOL_CQ");
        assert_eq!(dut_pool_label("arc-presubmit"), "DUT_POOL_CTS_PERBUILD");
        assert_eq!(dut_pool_label("DUT_POOL_QUOTA"), "DUT_POOL_QUOTA");
    }
}
