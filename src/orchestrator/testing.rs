//! In-memory machine used by the scheduler tests.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::item::{AttributeSet, TestItem};
use crate::machine::{Machine, MachineError, MachineResult, TestRun};

pub(crate) struct FakeMachine {
    hostname: String,
    attributes: AttributeSet,
    failing: HashSet<String>,
    unreachable: HashSet<String>,
    broken: HashSet<String>,
    provisioned: AtomicBool,
    provisions: AtomicUsize,
    ran: Mutex<Vec<String>>,
    delay: Duration,
}

impl FakeMachine {
    pub(crate) fn new(hostname: &str, attributes: &[&str]) -> Self {
        Self {
            hostname: hostname.to_string(),
            attributes: attributes.iter().map(|s| s.to_string()).collect(),
            failing: HashSet::new(),
            unreachable: HashSet::new(),
            broken: HashSet::new(),
            provisioned: AtomicBool::new(true),
            provisions: AtomicUsize::new(0),
            ran: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
        }
    }

    pub(crate) fn failing(mut self, test: &str) -> Self {
        self.failing.insert(test.to_string());
        self
    }

    pub(crate) fn unreachable_on(mut self, test: &str) -> Self {
        self.unreachable.insert(test.to_string());
        self
    }

    pub(crate) fn broken_on(mut self, test: &str) -> Self {
        self.broken.insert(test.to_string());
        self
    }

    pub(crate) fn unprovisioned(self) -> Self {
        self.provisioned.store(false, Ordering::SeqCst);
        self
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn provision_count(&self) -> usize {
        self.provisions.load(Ordering::SeqCst)
    }

    pub(crate) fn ran(&self) -> Vec<String> {
        self.ran.lock().unwrap().clone()
    }
}

#[async_trait]
impl Machine for FakeMachine {
    fn hostname(&self) -> &str {
        &self.hostname
    }

    async fn attributes(&self) -> MachineResult<AttributeSet> {
        Ok(self.attributes.clone())
    }

    async fn is_provisioned(&self) -> bool {
        self.provisioned.load(Ordering::SeqCst)
    }

    async fn provision(&self) -> MachineResult<()> {
        self.provisions.fetch_add(1, Ordering::SeqCst);
        self.provisioned.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn run_test(&self, test: &TestItem, results_dir: &Path) -> MachineResult<TestRun> {
        self.ran.lock().unwrap().push(test.name.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if self.broken.contains(&test.name) {
            return Err(MachineError::ExecFailed(format!("cannot spawn {}", test.name)));
        }
        if self.unreachable.contains(&test.name) {
            return Err(MachineError::Unreachable(self.hostname.clone()));
        }
        if self.failing.contains(&test.name) {
            return Err(MachineError::TestFailed {
                test: test.name.clone(),
                exit_code: 1,
            });
        }
        Ok(TestRun {
            test: test.name.clone(),
            log_dir: results_dir.join(&test.name),
            duration: self.delay,
        })
    }
}
