//! Tracking a suite of remote tasks through to completion.
//!
//! A [`SuiteTracker`] remembers the request behind every task it submitted so
//! it can resubmit the request when the task fails for an infrastructure
//! reason. Retries are bounded twice: each test has its own budget and the
//! suite as a whole has another.
//!
//! The tracker never sleeps on its own. [`SuiteTracker::wait_for_results`]
//! polls at the interval the caller passes in, and stops early on a
//! [`CancellationToken`] or an overall deadline.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::client::{RemoteResult, TaskService};
use super::request::TaskRequest;
use super::state::{TaskRecord, TaskState};
use crate::config::RemoteConfig;

/// Retry budgets for a suite.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries allowed per test.
    pub test_retries: u32,
    /// Retries allowed across the whole suite.
    pub max_retries: u32,
    /// Also retry tasks that completed with a test failure.
    pub retry_test_failures: bool,
}

impl From<&RemoteConfig> for RetryPolicy {
    fn from(config: &RemoteConfig) -> Self {
        Self {
            test_retries: config.test_retries,
            max_retries: config.max_retries,
            retry_test_failures: config.retry_test_failures,
        }
    }
}

/// How [`SuiteTracker::wait_for_results`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Every task finished and no retry is pending.
    Finished,
    /// The cancellation token fired; unfinished tasks were aborted.
    Canceled,
    /// The deadline passed; unfinished tasks were aborted.
    TimedOut,
}

/// Final view of one test in the suite.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestResult {
    pub name: String,
    /// Most recent task id.
    pub task_id: String,
    /// `None` until the executor has reported the latest task.
    pub state: Option<TaskState>,
    pub dut_name: Option<String>,
    /// Every task id tried, oldest first.
    pub attempts: Vec<String>,
}

#[derive(Debug, Clone)]
struct TrackedTest {
    request: TaskRequest,
    remaining_retries: u32,
    previous_task_ids: Vec<String>,
}

/// Retry and completion bookkeeping for one suite of remote tasks.
#[derive(Debug)]
pub struct SuiteTracker {
    /// Keyed by the test's current task id.
    tests: HashMap<String, TrackedTest>,
    /// Latest record seen for each tracked task id.
    active: HashMap<String, TaskRecord>,
    pending_retries: Vec<String>,
    test_retries: u32,
    max_retries: u32,
    retry_test_failures: bool,
}

impl SuiteTracker {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            tests: HashMap::new(),
            active: HashMap::new(),
            pending_retries: Vec::new(),
            test_retries: policy.test_retries,
            max_retries: policy.max_retries,
            retry_test_failures: policy.retry_test_failures,
        }
    }

    /// Remaining suite-wide retry budget.
    pub fn remaining_retries(&self) -> u32 {
        self.max_retries
    }

    /// Starts tracking a task created from `request`.
    pub fn track(&mut self, task_id: impl Into<String>, request: TaskRequest) {
        self.tests.insert(
            task_id.into(),
            TrackedTest {
                request,
                remaining_retries: self.test_retries,
                previous_task_ids: Vec::new(),
            },
        );
    }

    /// Rebuilds bookkeeping from tasks already submitted for this suite and
    /// returns the requests that still need submitting, in order.
    ///
    /// Each request is matched with the tasks of the same name. The
    /// unfinished one, or else the first one listed, becomes the tracked
    /// task and the others count as earlier attempts. Every earlier attempt
    /// is charged to both the test's and the suite's retry budget.
    pub fn resume(
        &mut self,
        tasks: &[TaskRecord],
        requests: impl IntoIterator<Item = TaskRequest>,
    ) -> Vec<TaskRequest> {
        let mut unscheduled = Vec::new();

        for request in requests {
            let attempts: Vec<&TaskRecord> =
                tasks.iter().filter(|t| t.name == request.name).collect();
            let Some(first) = attempts.first() else {
                unscheduled.push(request);
                continue;
            };

            let mut unfinished = attempts.iter().filter(|t| !t.final_state().is_terminal());
            let current = unfinished.next().unwrap_or(first);
            if let Some(other) = unfinished.next() {
                warn!(
                    "{} has more than one unfinished task ({}, {}); tracking {}",
                    request.name, current.task_id, other.task_id, current.task_id
                );
            }

            let retries_used = u32::try_from(attempts.len() - 1).unwrap_or(u32::MAX);
            let previous_task_ids: Vec<String> = attempts
                .iter()
                .filter(|t| t.task_id != current.task_id)
                .map(|t| t.task_id.clone())
                .collect();
            info!(
                "Resuming {} as task {} ({} earlier attempts)",
                request.name,
                current.task_id,
                previous_task_ids.len()
            );

            self.max_retries = self.max_retries.saturating_sub(retries_used);
            self.tests.insert(
                current.task_id.clone(),
                TrackedTest {
                    request,
                    remaining_retries: self.test_retries.saturating_sub(retries_used),
                    previous_task_ids,
                },
            );
            self.active.insert(current.task_id.clone(), (**current).clone());
        }

        unscheduled
    }

    /// Submits `request` and tracks the resulting task.
    pub async fn submit<S: TaskService + ?Sized>(
        &mut self,
        service: &S,
        request: TaskRequest,
    ) -> RemoteResult<String> {
        let task_id = service.trigger(&request).await?;
        self.track(task_id.clone(), request);
        Ok(task_id)
    }

    /// Returns `true` if `task` should be resubmitted.
    pub fn should_retry(&self, task: &TaskRecord) -> bool {
        let Some(test) = self.tests.get(&task.task_id) else {
            return false;
        };
        let state = task.final_state();
        let eligible = state.is_retry_eligible()
            || (self.retry_test_failures && state == TaskState::CompletedFailure);
        eligible && test.remaining_retries > 0 && self.max_retries > 0
    }

    /// Records the latest task states and selects tasks to retry.
    ///
    /// Records for tasks this tracker does not own, including tasks already
    /// replaced by a retry, are ignored.
    pub fn handle_results(&mut self, tasks: impl IntoIterator<Item = TaskRecord>) {
        for task in tasks {
            if !self.tests.contains_key(&task.task_id) {
                continue;
            }
            if self.should_retry(&task) && !self.pending_retries.contains(&task.task_id) {
                debug!("Task {} ({}) selected for retry", task.task_id, task.final_state());
                self.pending_retries.push(task.task_id.clone());
            }
            self.active.insert(task.task_id.clone(), task);
        }
    }

    /// Task ids waiting to be retried.
    pub fn pending_retries(&self) -> &[String] {
        &self.pending_retries
    }

    /// Resubmits the test behind `task_id` and returns the new task id.
    ///
    /// Bookkeeping moves to the new id with one retry fewer, and the suite
    /// budget shrinks by one.
    pub async fn retry<S: TaskService + ?Sized>(
        &mut self,
        service: &S,
        task_id: &str,
    ) -> RemoteResult<String> {
        self.pending_retries.retain(|id| id != task_id);
        let Some(mut test) = self.tests.remove(task_id) else {
            warn!("Task {} is not tracked; not retrying", task_id);
            return Ok(task_id.to_string());
        };

        let new_id = match service.trigger(&test.request).await {
            Ok(id) => id,
            Err(e) => {
                self.tests.insert(task_id.to_string(), test);
                return Err(e);
            }
        };

        info!(
            "Retrying {} as task {} (was {}, {} test retries left)",
            test.request.name,
            new_id,
            task_id,
            test.remaining_retries.saturating_sub(1)
        );
        test.remaining_retries = test.remaining_retries.saturating_sub(1);
        test.previous_task_ids.push(task_id.to_string());
        self.max_retries = self.max_retries.saturating_sub(1);
        self.active.remove(task_id);
        self.tests.insert(new_id.clone(), test);
        Ok(new_id)
    }

    /// Returns `true` once every tracked task is terminal and nothing is
    /// pending retry.
    pub fn is_finished(&self) -> bool {
        self.pending_retries.is_empty()
            && self.tests.keys().all(|id| {
                self.active
                    .get(id)
                    .is_some_and(|t| t.final_state().is_terminal())
            })
    }

    /// Aborts every tracked task that has not reached a terminal state.
    pub async fn abort_unfinished<S: TaskService + ?Sized>(&self, service: &S) {
        for id in self.tests.keys() {
            let terminal = self
                .active
                .get(id)
                .is_some_and(|t| t.final_state().is_terminal());
            if !terminal {
                service.abort(id).await;
            }
        }
    }

    /// Polls tasks carrying `tags` until the suite finishes.
    ///
    /// Each round queries the tasks, records their states and resubmits the
    /// ones selected for retry. Between rounds it sleeps for
    /// `poll_interval`. If `cancel` fires or `deadline` passes first,
    /// unfinished tasks are aborted.
    ///
    /// # Errors
    ///
    /// Returns the first query or resubmission error, after aborting the
    /// unfinished tasks. Retries not yet resubmitted stay pending.
    pub async fn wait_for_results<S: TaskService + ?Sized>(
        &mut self,
        service: &S,
        tags: &BTreeMap<String, String>,
        poll_interval: Duration,
        deadline: Option<Duration>,
        cancel: &CancellationToken,
    ) -> RemoteResult<WaitOutcome> {
        let start = Instant::now();

        loop {
            if let Err(e) = self.poll_once(service, tags).await {
                warn!("Polling suite failed: {}; aborting unfinished tasks", e);
                self.abort_unfinished(service).await;
                return Err(e);
            }

            if self.is_finished() {
                info!("Suite finished: {} tests", self.tests.len());
                return Ok(WaitOutcome::Finished);
            }

            if deadline.is_some_and(|d| start.elapsed() >= d) {
                warn!("Suite timed out after {:?}; aborting unfinished tasks", start.elapsed());
                self.abort_unfinished(service).await;
                return Ok(WaitOutcome::TimedOut);
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    warn!("Suite canceled; aborting unfinished tasks");
                    self.abort_unfinished(service).await;
                    return Ok(WaitOutcome::Canceled);
                }
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }

    /// Queries the suite once and resubmits the tasks selected for retry.
    ///
    /// If a resubmission fails, that task and the ones after it stay pending.
    async fn poll_once<S: TaskService + ?Sized>(
        &mut self,
        service: &S,
        tags: &BTreeMap<String, String>,
    ) -> RemoteResult<()> {
        let tasks = service.query_tasks_by_tags(tags).await?;
        self.handle_results(tasks);

        let mut pending = std::mem::take(&mut self.pending_retries).into_iter();
        while let Some(task_id) = pending.next() {
            // Earlier retries in this round may have used up the suite budget.
            let eligible = self
                .active
                .get(&task_id)
                .is_some_and(|t| self.should_retry(t));
            if !eligible {
                debug!("Task {} no longer eligible for retry", task_id);
                continue;
            }
            if let Err(e) = self.retry(service, &task_id).await {
                self.pending_retries.push(task_id);
                self.pending_retries.extend(pending);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Summary of every test, sorted by name.
    pub fn results(&self) -> Vec<TestResult> {
        let mut results: Vec<TestResult> = self
            .tests
            .iter()
            .map(|(task_id, test)| {
                let record = self.active.get(task_id);
                let mut attempts = test.previous_task_ids.clone();
                attempts.push(task_id.clone());
                TestResult {
                    name: test.request.name.clone(),
                    task_id: task_id.clone(),
                    state: record.map(|r| r.final_state()),
                    dut_name: record.and_then(|r| r.dut_name()).map(str::to_string),
                    attempts,
                }
            })
            .collect();
        results.sort_by(|a, b| a.name.cmp(&b.name).then(a.task_id.cmp(&b.task_id)));
        results
    }
}
