//! fleetrun: test distribution across a lab fleet.
//!
//! This crate hands tests to machines in two ways:
//!
//! - **Local distribution**: one worker per machine pulls tests from a shared
//!   queue, taking the first test whose constraints its machine satisfies.
//! - **Remote scheduling**: each test becomes a typed task request for a
//!   remote executor, which is then polled and retried on infrastructure
//!   failures.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Items**: Tests with include/exclude attribute constraints
//! - **Machines**: Hosts that provision themselves and run one test per process
//! - **Orchestrator**: The shared work queue and per-machine workers
//! - **Remote**: Request builder, task states, executor client, suite tracker
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
//!     let runner = config.runner.clone().ok_or_else(|| anyhow::anyhow!("no [runner]"))?;
//!     let machines = config
//!         .machines
//!         .iter()
//!         .map(|m| ProcessMachine::new(m, runner.clone()))
//!         .collect();
//!
//!     let summary = Orchestrator::new(machines, &config.scheduler.results_dir)
//!         .run(config.tests.clone())
//!         .await?;
//!     println!("{} passed, {} failed", summary.passed(), summary.failed());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod item;
pub mod machine;
pub mod orchestrator;
pub mod remote;

// Re-export commonly used types
pub use config::{Config, load_config};
pub use item::{AttributeSet, TestItem};
pub use machine::{Machine, MachineError, MachineResult};
pub use orchestrator::{Orchestrator, RunSummary, WorkQueue};
pub use remote::{SuiteTracker, TaskRequest, TaskService, TaskState};
