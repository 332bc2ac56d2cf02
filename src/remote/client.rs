//! Remote executor client.
//!
//! [`TaskService`] is the seam between the suite tracker and the executor.
//! [`CliTaskService`] implements it by shelling out to the executor's command
//! line client, one process per call:
//!
//! ```text
//! <client> <subcommand> --auth-service-account-json <path> --swarming <server> <args...>
//! ```
//!
//! | Operation | Subcommand and arguments |
//! |-----------|--------------------------|
//! | trigger | `post tasks/new` (request JSON on stdin) |
//! | query task | `query task/<id>/result` |
//! | query tasks | `query tasks/list?tags=k:v&...` |
//! | bot counts | `query bots/count?dimensions=k:v&...` |
//! | bot list | `query bots/list?dimensions=k:v&...` |
//! | cancel | `cancel --kill-running <id>` |

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info};

use super::bots::{Bot, BotsCount};
use super::request::TaskRequest;
use super::state::TaskRecord;
use crate::config::ExecutorConfig;

/// Result type for remote executor operations.
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Errors talking to the remote executor.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    /// The executor configuration is unusable.
    #[error("Invalid executor config: {0}")]
    Config(String),

    /// The client could not be started.
    #[error("Failed to execute client: {0}")]
    ExecFailed(String),

    /// The client ran too long and was killed.
    #[error("Client timed out: {0}")]
    Timeout(String),

    /// The client exited with an error.
    #[error("Client command {command} failed with exit code {exit_code}: {stderr}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    /// The client printed something that is not the expected JSON.
    #[error("Failed to parse client output: {0}")]
    Parse(#[from] serde_json::Error),

    /// I/O error talking to the client.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Operations offered by the remote executor.
#[async_trait]
pub trait TaskService: Send + Sync {
    /// Submits a request and returns the new task id.
    async fn trigger(&self, request: &TaskRequest) -> RemoteResult<String>;

    /// Fetches one task by id.
    async fn query_task(&self, task_id: &str) -> RemoteResult<TaskRecord>;

    /// Fetches every task carrying all of `tags`.
    async fn query_tasks_by_tags(&self, tags: &BTreeMap<String, String>) -> RemoteResult<Vec<TaskRecord>>;

    /// Counts bots matching `dimensions`.
    async fn query_bots_count(&self, dimensions: &BTreeMap<String, String>) -> RemoteResult<BotsCount>;

    /// Lists bots matching `dimensions`.
    async fn query_bots(&self, dimensions: &BTreeMap<String, String>) -> RemoteResult<Vec<Bot>>;

    /// Cancels a task, killing it if it is running.
    async fn cancel(&self, task_id: &str) -> RemoteResult<()>;

    /// Best-effort [`cancel`](Self::cancel). Failures are logged, not returned.
    async fn abort(&self, task_id: &str) {
        if let Err(e) = self.cancel(task_id).await {
            error!("Task {} probably already gone, skip canceling it: {}", task_id, e);
        }
    }
}

/// Link to a task's page on the executor.
pub fn task_link(server: &str, task_id: &str) -> String {
    format!("{}/user/task/{}", server.trim_end_matches('/'), task_id)
}

/// Builds `<endpoint>?<key>=k:v&...` with form-url-encoded pairs.
pub fn query_path(endpoint: &str, key: &str, conditions: &BTreeMap<String, String>) -> String {
    if conditions.is_empty() {
        return endpoint.to_string();
    }
    let query = url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(conditions.iter().map(|(k, v)| (key, format!("{}:{}", k, v))))
        .finish();
    format!("{}?{}", endpoint, query)
}

#[derive(Deserialize)]
struct TriggerResponse {
    task_id: String,
}

#[derive(Deserialize)]
struct ListResponse<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

/// [`TaskService`] backed by the executor's command line client.
#[derive(Debug, Clone)]
pub struct CliTaskService {
    client: Vec<String>,
    service_account: PathBuf,
    server: String,
    timeout: Duration,
}

impl CliTaskService {
    /// Creates a client from configuration.
    ///
    /// `~` in the client command and credential path is expanded.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::Config`] if the client command is empty or
    /// unparsable, or the server is not a URL.
    pub fn new(config: &ExecutorConfig) -> RemoteResult<Self> {
        let client = shell_words::split(&config.client)
            .map_err(|e| RemoteError::Config(format!("client {:?}: {}", config.client, e)))?
            .into_iter()
            .map(|word| shellexpand::tilde(&word).into_owned())
            .collect::<Vec<_>>();
        if client.is_empty() {
            return Err(RemoteError::Config("client command is empty".to_string()));
        }

        url::Url::parse(&config.server)
            .map_err(|e| RemoteError::Config(format!("server {:?}: {}", config.server, e)))?;

        let service_account =
            PathBuf::from(shellexpand::tilde(&config.service_account.to_string_lossy()).as_ref());

        Ok(Self {
            client,
            service_account,
            server: config.server.trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(config.timeout_secs),
        })
    }

    /// Base URL of the executor.
    pub fn server(&self) -> &str {
        &self.server
    }

    fn command(&self, subcommand: &str, args: &[&str]) -> Vec<String> {
        let mut argv = self.client.clone();
        argv.push(subcommand.to_string());
        argv.push("--auth-service-account-json".to_string());
        argv.push(self.service_account.to_string_lossy().to_string());
        argv.push("--swarming".to_string());
        argv.push(self.server.clone());
        argv.extend(args.iter().map(|a| a.to_string()));
        argv
    }

    async fn run(&self, argv: Vec<String>, stdin: Option<&[u8]>) -> RemoteResult<String> {
        let shown = shell_words::join(&argv);
        debug!("Running executor client: {}", shown);

        let mut cmd = tokio::process::Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| RemoteError::ExecFailed(format!("{}: {}", argv[0], e)))?;

        if let Some(input) = stdin
            && let Some(mut pipe) = child.stdin.take()
        {
            pipe.write_all(input).await?;
            pipe.shutdown().await?;
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| RemoteError::Timeout(shown.clone()))??;

        if !output.status.success() {
            return Err(RemoteError::CommandFailed {
                command: shown,
                exit_code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn query<T: serde::de::DeserializeOwned>(&self, path: &str) -> RemoteResult<T> {
        let stdout = self.run(self.command("query", &[path]), None).await?;
        Ok(serde_json::from_str(&stdout)?)
    }
}

#[async_trait]
impl TaskService for CliTaskService {
    async fn trigger(&self, request: &TaskRequest) -> RemoteResult<String> {
        let body = request.to_json()?;
        let stdout = self
            .run(self.command("post", &["tasks/new"]), Some(body.as_bytes()))
            .await?;
        let response: TriggerResponse = serde_json::from_str(&stdout)?;
        info!(
            "Triggered {}: {}",
            request.name,
            task_link(&self.server, &response.task_id)
        );
        Ok(response.task_id)
    }

    async fn query_task(&self, task_id: &str) -> RemoteResult<TaskRecord> {
        self.query(&format!("task/{}/result", task_id)).await
    }

    async fn query_tasks_by_tags(&self, tags: &BTreeMap<String, String>) -> RemoteResult<Vec<TaskRecord>> {
        let response: ListResponse<TaskRecord> =
            self.query(&query_path("tasks/list", "tags", tags)).await?;
        Ok(response.items)
    }

    async fn query_bots_count(&self, dimensions: &BTreeMap<String, String>) -> RemoteResult<BotsCount> {
        self.query(&query_path("bots/count", "dimensions", dimensions))
            .await
    }

    async fn query_bots(&self, dimensions: &BTreeMap<String, String>) -> RemoteResult<Vec<Bot>> {
        let response: ListResponse<Bot> = self
            .query(&query_path("bots/list", "dimensions", dimensions))
            .await?;
        Ok(response.items)
    }

    async fn cancel(&self, task_id: &str) -> RemoteResult<()> {
        self.run(self.command("cancel", &["--kill-running", task_id]), None)
            .await?;
        info!("Canceled task {}", task_id);
        Ok(())
    }
}
