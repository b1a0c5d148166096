//! Runner Registry.
//!
//! A family of backend implementations (container, VM, physical, bare
//! process) behind a single `Runner` trait with one implementation per
//! environment variant. The registry dispatches at runtime by
//! `EnvironmentType`, since a single run can mix container, VM, physical,
//! and process environments in one pool.
//!
//! No runner ever retries internally: every runner call
//! here returns a single `RunOutcome` or a `RunnerError` and leaves all
//! retry policy to the Scheduler.

pub mod container;
pub mod physical;
pub mod process;
pub mod vm;

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::model::{ArtifactBundle, Environment, FailureClass, TestCase};

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("failed to prepare environment {0}: {1}")]
    PrepareFailed(String, String),
    #[error("execution failed: {0}")]
    ExecFailed(String),
    #[error("artifact collection failed: {0}")]
    ArtifactCollectionFailed(String),
    #[error("environment reset failed: {0}")]
    ResetFailed(String),
}

pub type RunnerResult<T> = Result<T, RunnerError>;

/// What actually happened when a runner executed a test, before the
/// Scheduler folds it into a [`crate::model::TestResult`].
#[derive(Debug)]
pub enum RunOutcome {
    Finished {
        exit_code: i32,
        stdout: String,
        stderr: String,
        artifacts: ArtifactBundle,
    },
    TimedOut {
        artifacts: ArtifactBundle,
    },
    /// The environment itself failed (transport lost, kernel panic, crash)
    /// rather than the test producing a normal non-zero exit.
    EnvironmentFailure {
        failure_class: FailureClass,
        detail: String,
    },
    Cancelled,
}

/// One pluggable execution backend. Implementors own the mechanics of
/// getting a script onto an environment, running it under a deadline, and
/// getting artifacts back off — nothing about scheduling or retries.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Uploads the test script and any fixtures onto the already-allocated
    /// environment. Called once per attempt, before `execute`.
    async fn prepare(&self, env: &Environment, test: &TestCase) -> RunnerResult<()>;

    /// Runs the test to completion or until `timeout` elapses (the
    /// Scheduler derives `timeout` from `test.timeout_ms` or the configured
    /// default, and adds `timeout_grace_ms` before declaring TIMED_OUT,
    /// then escalates to SIGKILL after the grace period. `cancel` fires if the
    /// Scheduler calls `Orchestrator::cancel` for this test mid-run.
    async fn execute(
        &self,
        env: &Environment,
        test: &TestCase,
        timeout: Duration,
        grace: Duration,
        cancel: CancellationToken,
    ) -> RunnerResult<RunOutcome>;

    /// Pulls declared output paths back as an [`ArtifactBundle`].
    async fn collect_artifacts(&self, env: &Environment, test: &TestCase) -> RunnerResult<ArtifactBundle>;

    /// Returns the environment to a clean, reusable state after the
    /// attempt concludes — the action the Resource Manager's `release`
    /// calls before marking `READY` again.
    async fn reset(&self, env: &Environment) -> RunnerResult<bool>;
}

/// Dispatch table mapping `EnvironmentType` to the `Runner` that handles
/// it, so the Scheduler never needs to know which concrete backend an
/// environment uses.
pub struct RunnerRegistry {
    container: container::ContainerRunner,
    vm: vm::VmRunner,
    physical: physical::PhysicalRunner,
    process: process::ProcessRunner,
}

impl RunnerRegistry {
    pub fn new(
        container: container::ContainerRunner,
        vm: vm::VmRunner,
        physical: physical::PhysicalRunner,
        process: process::ProcessRunner,
    ) -> Self {
        Self {
            container,
            vm,
            physical,
            process,
        }
    }

    pub fn for_environment(&self, env_type: crate::model::EnvironmentType) -> &dyn Runner {
        use crate::model::EnvironmentType;
        match env_type {
            EnvironmentType::Container => &self.container,
            EnvironmentType::QemuX86 | EnvironmentType::QemuArm => &self.vm,
            EnvironmentType::Physical => &self.physical,
            EnvironmentType::Process => &self.process,
        }
    }
}
