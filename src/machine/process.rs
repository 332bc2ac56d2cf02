//! Process-backed machine implementation.
//!
//! Every test runs as its own child process, started through the configured
//! shell from the `run_command` template. The child's stdout and stderr go
//! straight to files in a per-test log directory, so concurrent tests never
//! interleave output and a crashing test only takes down its own process.
//!
//! # Command Templates
//!
//! | Placeholder | Replaced with |
//! |-------------|---------------|
//! | `{host}` | The machine's host name |
//! | `{test}` | The test name |
//! | `{args}` | The test arguments as `key=value` words |
//! | `{results_dir}` | The per-test log directory |
//!
//! All substituted values are shell-quoted and inserted in a single pass, so
//! a value that itself contains a placeholder is never expanded again.
//! `{host}` is also available in `provision_command` and
//! `attributes_command`.
//!
//! On Unix each test runs in its own process group; a timeout kills the
//! whole group, including anything the run command started in the
//! background.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{Machine, MachineError, MachineResult, TestRun};
use crate::config::{MachineConfig, RunnerConfig};
use crate::item::{AttributeSet, TestItem};

/// Output of a short helper command (attribute probe, provisioning).
#[derive(Debug, Clone)]
struct ExecResult {
    exit_code: i32,
    stdout: String,
    stderr: String,
}

/// A machine whose tests run as local child processes.
///
/// The run command usually reaches the real host itself, e.g. through
/// `ssh {host} ...`; exit codes listed in `unreachable_exit_codes` are then
/// reported as [`MachineError::Unreachable`].
pub struct ProcessMachine {
    hostname: String,
    static_attributes: Vec<String>,
    runner: RunnerConfig,
    installed: AtomicBool,
    runs: AtomicUsize,
}

impl ProcessMachine {
    /// Creates a machine from its configuration and the shared runner settings.
    pub fn new(machine: &MachineConfig, runner: RunnerConfig) -> Self {
        let installed = runner.provision_command.is_none();
        Self {
            hostname: machine.hostname.clone(),
            static_attributes: machine.attributes.clone(),
            runner,
            installed: AtomicBool::new(installed),
            runs: AtomicUsize::new(0),
        }
    }

    /// Substitutes `{host}` into a template.
    fn render_host(&self, template: &str) -> String {
        let host = shell_words::quote(&self.hostname);
        render(template, &[("host", &*host)])
    }

    /// Builds the shell command for one test.
    fn render_run_command(&self, test: &TestItem, log_dir: &Path) -> String {
        let args = test
            .args_as_words()
            .iter()
            .map(|w| shell_words::quote(w).into_owned())
            .collect::<Vec<_>>()
            .join(" ");

        let log_dir = log_dir.to_string_lossy();
        let host = shell_words::quote(&self.hostname);
        let name = shell_words::quote(&test.name);
        let results_dir = shell_words::quote(&log_dir);
        render(
            &self.runner.run_command,
            &[
                ("host", &*host),
                ("test", &*name),
                ("args", args.as_str()),
                ("results_dir", &*results_dir),
            ],
        )
    }

    /// Picks a fresh log directory for a test under `results_dir`.
    fn log_dir_for(&self, test: &TestItem, results_dir: &Path) -> PathBuf {
        let seq = self.runs.fetch_add(1, Ordering::SeqCst);
        let name: String = test
            .name
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();
        results_dir.join(format!("{}.{}", name, seq))
    }

    /// Runs a helper command with captured output and the runner timeout.
    async fn exec(&self, shell_cmd: &str) -> MachineResult<ExecResult> {
        let mut process = tokio::process::Command::new(&self.runner.shell);
        process.arg("-c").arg(shell_cmd);
        for (key, value) in &self.runner.env {
            process.env(key, value);
        }
        process.stdin(Stdio::null());
        process.stdout(Stdio::piped());
        process.stderr(Stdio::piped());
        process.kill_on_drop(true);

        let timeout = Duration::from_secs(self.runner.test_timeout_secs);
        let output = tokio::time::timeout(timeout, process.output())
            .await
            .map_err(|_| {
                MachineError::Timeout(format!(
                    "{}: command timed out after {}s",
                    self.hostname, self.runner.test_timeout_secs
                ))
            })?
            .map_err(|e| MachineError::ExecFailed(e.to_string()))?;

        Ok(ExecResult {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

#[async_trait]
impl Machine for ProcessMachine {
    fn hostname(&self) -> &str {
        &self.hostname
    }

    async fn attributes(&self) -> MachineResult<AttributeSet> {
        let mut attributes: AttributeSet = self.static_attributes.iter().cloned().collect();

        if let Some(template) = &self.runner.attributes_command {
            let result = self.exec(&self.render_host(template)).await?;
            if result.exit_code != 0 {
                return Err(MachineError::Unreachable(format!(
                    "{}: attribute probe exited with {}: {}",
                    self.hostname,
                    result.exit_code,
                    result.stderr.trim()
                )));
            }
            attributes.extend(
                result
                    .stdout
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(String::from),
            );
        }

        Ok(attributes)
    }

    async fn is_provisioned(&self) -> bool {
        self.installed.load(Ordering::SeqCst)
    }

    async fn provision(&self) -> MachineResult<()> {
        if self.installed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let Some(template) = &self.runner.provision_command else {
            self.installed.store(true, Ordering::SeqCst);
            return Ok(());
        };

        info!("Provisioning {}", self.hostname);
        let result = self.exec(&self.render_host(template)).await?;
        if result.exit_code != 0 {
            return Err(MachineError::ProvisionFailed(format!(
                "{}: exit code {}: {}",
                self.hostname,
                result.exit_code,
                result.stderr.trim()
            )));
        }
        debug!("{} provision output: {}", self.hostname, result.stdout.trim());

        self.installed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn run_test(&self, test: &TestItem, results_dir: &Path) -> MachineResult<TestRun> {
        let start = Instant::now();

        let log_dir = self.log_dir_for(test, results_dir);
        tokio::fs::create_dir_all(&log_dir).await?;
        let stdout = std::fs::File::create(log_dir.join("stdout"))?;
        let stderr = std::fs::File::create(log_dir.join("stderr"))?;

        let shell_cmd = self.render_run_command(test, &log_dir);
        debug!("{}: {}", self.hostname, shell_cmd);

        let mut process = tokio::process::Command::new(&self.runner.shell);
        process.arg("-c").arg(&shell_cmd);
        for (key, value) in &self.runner.env {
            process.env(key, value);
        }
        process.stdin(Stdio::null());
        process.stdout(Stdio::from(stdout));
        process.stderr(Stdio::from(stderr));
        process.kill_on_drop(true);
        #[cfg(unix)]
        process.process_group(0);

        let mut child = process
            .spawn()
            .map_err(|e| MachineError::ExecFailed(e.to_string()))?;

        let timeout = Duration::from_secs(self.runner.test_timeout_secs);
        let status = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                #[cfg(unix)]
                if let Err(e) = kill_process_group(&child) {
                    warn!("Failed to kill process group of {} on {}: {}", test.name, self.hostname, e);
                }
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill {} on {}: {}", test.name, self.hostname, e);
                }
                return Err(MachineError::Timeout(format!(
                    "{} on {} exceeded {}s",
                    test.name, self.hostname, self.runner.test_timeout_secs
                )));
            }
        };

        // Killed by a signal: the test crashed.
        let exit_code = status.code().unwrap_or(-1);
        if exit_code == 0 {
            Ok(TestRun {
                test: test.name.clone(),
                log_dir,
                duration: start.elapsed(),
            })
        } else if self.runner.unreachable_exit_codes.contains(&exit_code) {
            Err(MachineError::Unreachable(format!(
                "{} (exit code {} running {})",
                self.hostname, exit_code, test.name
            )))
        } else {
            Err(MachineError::TestFailed {
                test: test.name.clone(),
                exit_code,
            })
        }
    }
}

/// Replaces `{name}` placeholders with their values in one pass.
///
/// Inserted values are not rescanned. Unknown placeholders are kept as is.
fn render(template: &str, values: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let tail = &rest[start + 1..];
        let found = values.iter().find(|(name, _)| {
            tail.strip_prefix(name)
                .is_some_and(|after| after.starts_with('}'))
        });
        match found {
            Some((name, value)) => {
                out.push_str(value);
                rest = &tail[name.len() + 1..];
            }
            None => {
                out.push('{');
                rest = tail;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Sends SIGKILL to the process group led by `child`.
#[cfg(unix)]
fn kill_process_group(child: &tokio::process::Child) -> std::io::Result<()> {
    let Some(pid) = child.id() else {
        return Ok(());
    };
    let rc = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) };
    if rc != 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn runner(run_command: &str) -> RunnerConfig {
        RunnerConfig {
            shell: "/bin/sh".to_string(),
            run_command: run_command.to_string(),
            provision_command: None,
            attributes_command: None,
            test_timeout_secs: 30,
            unreachable_exit_codes: vec![255],
            env: HashMap::new(),
        }
    }

    fn machine(runner: RunnerConfig) -> ProcessMachine {
        let config = MachineConfig {
            hostname: "host1".to_string(),
            attributes: vec!["wifi".to_string()],
        };
        ProcessMachine::new(&config, runner)
    }

    #[tokio::test]
    async fn test_passing_test_captures_output() {
        let dir = tempfile::tempdir().unwrap();
        let m = machine(runner("echo running {test} on {host} {args}"));
        let item = TestItem::new("dummy_Pass").with_arg("n", 2);

        let run = m.run_test(&item, dir.path()).await.unwrap();

        assert_eq!(run.test, "dummy_Pass");
        let stdout = std::fs::read_to_string(run.log_dir.join("stdout")).unwrap();
        assert_eq!(stdout.trim(), "running dummy_Pass on host1 n=2");
    }

    #[tokio::test]
    async fn test_each_run_gets_its_own_log_dir() {
        let dir = tempfile::tempdir().unwrap();
        let m = machine(runner("true"));
        let item = TestItem::new("suite/dummy_Pass");

        let first = m.run_test(&item, dir.path()).await.unwrap();
        let second = m.run_test(&item, dir.path()).await.unwrap();

        assert_ne!(first.log_dir, second.log_dir);
        assert!(first.log_dir.starts_with(dir.path()));
        assert_eq!(first.log_dir.parent(), Some(dir.path()));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_test_failure() {
        let dir = tempfile::tempdir().unwrap();
        let m = machine(runner("echo boom >&2; exit 3"));

        let err = m
            .run_test(&TestItem::new("dummy_Fail"), dir.path())
            .await
            .unwrap_err();

        assert!(matches!(err, MachineError::TestFailed { exit_code: 3, .. }));
        assert!(err.is_expected());
    }

    #[tokio::test]
    async fn test_unreachable_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let m = machine(runner("exit 255"));

        let err = m
            .run_test(&TestItem::new("t"), dir.path())
            .await
            .unwrap_err();

        assert!(matches!(err, MachineError::Unreachable(_)));
        assert!(err.is_expected());
    }

    #[tokio::test]
    async fn test_timeout_kills_test() {
        let dir = tempfile::tempdir().unwrap();
        let mut r = runner("sleep 10");
        r.test_timeout_secs = 1;
        let m = machine(r);

        let err = m
            .run_test(&TestItem::new("t"), dir.path())
            .await
            .unwrap_err();

        assert!(matches!(err, MachineError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_missing_shell_is_internal_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut r = runner("true");
        r.shell = "/nonexistent/shell".to_string();
        let m = machine(r);

        let err = m
            .run_test(&TestItem::new("t"), dir.path())
            .await
            .unwrap_err();

        assert!(matches!(err, MachineError::ExecFailed(_)));
        assert!(!err.is_expected());
    }

    #[tokio::test]
    async fn test_attributes_merge_static_and_probed() {
        let mut r = runner("true");
        r.attributes_command = Some("printf 'usb\\n\\nbluetooth\\n'".to_string());
        let m = machine(r);

        let attrs = m.attributes().await.unwrap();
        let expected: AttributeSet = ["bluetooth", "usb", "wifi"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(attrs, expected);
    }

    #[tokio::test]
    async fn test_provision_runs_once() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("installs");
        let mut r = runner("true");
        r.provision_command = Some(format!("echo {{host}} >> {}", marker.display()));
        let m = machine(r);

        assert!(!m.is_provisioned().await);
        m.provision().await.unwrap();
        m.provision().await.unwrap();
        assert!(m.is_provisioned().await);

        let installs = std::fs::read_to_string(&marker).unwrap();
        assert_eq!(installs.lines().collect::<Vec<_>>(), vec!["host1"]);
    }

    #[tokio::test]
    async fn test_failed_provision() {
        let mut r = runner("true");
        r.provision_command = Some("exit 1".to_string());
        let m = machine(r);

        let err = m.provision().await.unwrap_err();
        assert!(matches!(err, MachineError::ProvisionFailed(_)));
        assert!(!m.is_provisioned().await);
    }

    #[test]
    fn test_render_run_command_quotes_values() {
        let m = machine(runner("run {test} --dir {results_dir} {args}"));
        let item = TestItem::new("t").with_arg("ssid", "lab ap");
        let cmd = m.render_run_command(&item, Path::new("/tmp/r 1"));
        assert_eq!(cmd, "run t --dir '/tmp/r 1' 'ssid=lab ap'");
    }

    #[test]
    fn test_placeholders_inside_values_are_not_expanded() {
        let m = machine(runner("run {test} {results_dir}"));
        let cmd = m.render_run_command(&TestItem::new("x{results_dir}"), Path::new("/tmp/r"));
        assert!(cmd.starts_with("run "));
        assert!(cmd.contains("x{results_dir}"));
        assert_eq!(cmd.matches("/tmp/r").count(), 1);
    }

    #[test]
    fn test_render_keeps_unknown_placeholders() {
        assert_eq!(render("a {b} {c} {", &[("b", "B")]), "a B {c} {");
        assert_eq!(render("{b}{b}", &[("b", "{b}")]), "{b}{b}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_background_children() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("late");
        let mut r = runner(&format!("(sleep 2; touch {}) & sleep 10", marker.display()));
        r.test_timeout_secs = 1;
        let m = machine(r);

        let err = m
            .run_test(&TestItem::new("t"), dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, MachineError::Timeout(_)));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!marker.exists());
    }
}
