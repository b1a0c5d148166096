//! Orchestrator root.
//!
//! Wires the Status Tracker, Persistence Store, Resource Manager, Priority
//! Queue + Queue Monitor, Runner Registry, Recovery Coordinator, and
//! Scheduler/Dispatcher into the single object the Submission API and
//! Result Retrieval API are methods on. Rather than owning a single pool
//! and driving one batch run to completion, this orchestrator runs
//! indefinitely as a background dispatch loop that plans are submitted
//! into.

pub mod dispatcher;
pub mod recovery;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;
use crate::model::{
    Environment, EnvironmentPoolSummary, EnvironmentStatus, ExecutionPlan, HealthReport, InsertionSeq,
    OperationalState, StatusSnapshot, TestResult,
};
use crate::persistence::Persistence;
use crate::queue::{PriorityQueue, QueueMonitor};
use crate::resource::ResourceManager;
use crate::runner::{
    RunnerRegistry,
    container::ContainerRunner,
    physical::{CommandPowerController, PhysicalRunner},
    process::ProcessRunner,
    vm::VmRunner,
};
use crate::status::StatusTracker;

use dispatcher::{CancellationRegistry, Dispatcher, TestCaseTable};
use recovery::RecoveryInputs;

#[derive(Debug, thiserror::Error)]
pub enum SubmissionError {
    #[error("plan failed validation: {0}")]
    InvalidPlan(String),
    #[error("durable write failed: {0}")]
    Persistence(#[from] crate::persistence::PersistenceError),
    #[error("orchestrator is degraded ({0} persistence errors); new submissions are rejected")]
    Degraded(u64),
}

/// Top-level handle for the running system. Cheaply `Clone`-able (every
/// field is an `Arc`), so the CLI and any embedding binary can hand copies
/// to multiple background tasks.
#[derive(Clone)]
pub struct Orchestrator {
    config: Arc<Config>,
    status: Arc<StatusTracker>,
    persistence: Arc<Persistence>,
    resource: Arc<ResourceManager>,
    queue: Arc<Mutex<PriorityQueue>>,
    queue_signal: Arc<Notify>,
    queue_monitor: Arc<QueueMonitor>,
    runners: Arc<RunnerRegistry>,
    seq: Arc<InsertionSeq>,
    test_cases: Arc<TestCaseTable>,
    cancellations: Arc<CancellationRegistry>,
    shutdown: CancellationToken,
}

impl Orchestrator {
    /// Builds every collaborator from `config`, provisioning the in-memory
    /// environment table per `[[environments]]` entry, and loads whatever
    /// persisted state already exists at `config.orchestrator.persistence_root`.
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let persistence = Persistence::load(config.orchestrator.persistence_root.clone()).await;

        let mut environments = Vec::new();
        for env_config in &config.environments {
            let capacity = env_config.capacity();
            for i in 0..env_config.count() {
                environments.push(Environment {
                    env_id: format!("{}-{i}", env_config.id_prefix()),
                    env_type: env_config.env_type(),
                    architecture: env_config.architecture(),
                    capacity: crate::model::Capacity {
                        memory_mb: capacity.memory_mb,
                        cpu: capacity.cpu,
                        features: capacity.features.clone(),
                    },
                    status: crate::model::EnvironmentStatus::Provisioning,
                    health: crate::model::EnvironmentHealth::Unknown,
                    assigned_test: None,
                    metadata: environment_metadata(env_config),
                    consecutive_reset_failures: 0,
                    ready_since: None,
                });
            }
        }

        let resource = Arc::new(ResourceManager::new(
            environments,
            config.orchestrator.env_reset_failure_threshold,
            config.orchestrator.env_idle_reclaim_seconds,
        ));

        let runners = Arc::new(build_runner_registry(&config)?);

        let orchestrator = Self {
            config: Arc::new(config.clone()),
            status: Arc::new(StatusTracker::new()),
            persistence: Arc::new(persistence),
            resource,
            queue: Arc::new(Mutex::new(PriorityQueue::new())),
            queue_signal: Arc::new(Notify::new()),
            queue_monitor: Arc::new(QueueMonitor::new(std::time::Duration::from_millis(
                config.orchestrator.queue_poll_interval_ms,
            ))),
            runners,
            seq: Arc::new(InsertionSeq::new()),
            test_cases: Arc::new(Mutex::new(HashMap::new())),
            cancellations: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
        };

        // Every configured environment starts healthy and ready; in a real
        // deployment a provisioning step would precede this (§4.3
        // PROVISIONING -> READY), but the orchestrator itself treats that
        // as out of scope (Non-goal: it consumes a pool, it doesn't build
        // one).
        for env in orchestrator.resource.snapshot().await {
            orchestrator.resource.mark_ready(&env.env_id).await;
        }

        let recovery = RecoveryInputs {
            persistence: orchestrator.persistence.clone(),
            resource: orchestrator.resource.clone(),
            status: orchestrator.status.clone(),
            queue: orchestrator.queue.clone(),
            queue_monitor: orchestrator.queue_monitor.clone(),
            seq: orchestrator.seq.clone(),
        };
        recovery.run().await;
        orchestrator.rehydrate_test_cases().await;

        Ok(orchestrator)
    }

    /// Replays `plan_submitted` events into the test-case lookup table so a
    /// recovered, re-queued request can still find its script after a
    /// restart (the in-memory table is otherwise populated only by
    /// `submit_plan`).
    async fn rehydrate_test_cases(&self) {
        let Ok(records) = self.persistence.read_all().await else {
            return;
        };
        let mut table = self.test_cases.lock().await;
        for record in records {
            if let crate::persistence::Event::PlanSubmitted { plan } = record.event {
                for test in plan.tests {
                    table.insert(test.test_id.clone(), test);
                }
            }
        }
    }

    /// Spawns the background Queue Monitor and Scheduler/Dispatcher loops.
    /// Returns their join handles so a caller (typically the CLI's `run`
    /// command) can await a clean shutdown.
    pub fn spawn_background_loops(&self) -> Vec<JoinHandle<()>> {
        let monitor = self.queue_monitor.clone();
        let persistence = self.persistence.clone();
        let queue = self.queue.clone();
        let queue_signal = self.queue_signal.clone();
        let seq = self.seq.clone();
        let status = self.status.clone();
        let resource = self.resource.clone();
        let shutdown = self.shutdown.clone();
        let monitor_handle = tokio::spawn(async move {
            monitor
                .run(&persistence, &queue, &queue_signal, &seq, &status, &resource, &shutdown)
                .await;
        });

        let dispatcher = Dispatcher::new(self.config.orchestrator.clone());
        let queue2 = self.queue.clone();
        let queue_signal2 = self.queue_signal.clone();
        let status2 = self.status.clone();
        let persistence2 = self.persistence.clone();
        let resource2 = self.resource.clone();
        let runners2 = self.runners.clone();
        let seq2 = self.seq.clone();
        let test_cases2 = self.test_cases.clone();
        let cancellations2 = self.cancellations.clone();
        let shutdown2 = self.shutdown.clone();
        let dispatcher_handle = tokio::spawn(async move {
            dispatcher
                .run(
                    queue2,
                    queue_signal2,
                    status2,
                    persistence2,
                    resource2,
                    runners2,
                    seq2,
                    test_cases2,
                    cancellations2,
                    shutdown2,
                )
                .await;
        });

        let resource3 = self.resource.clone();
        let shutdown3 = self.shutdown.clone();
        let idle_handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown3.cancelled() => return,
                    _ = tokio::time::sleep(std::time::Duration::from_secs(30)) => {},
                }
                let reclaimed = resource3.reclaim_idle().await;
                if !reclaimed.is_empty() {
                    info!("reclaimed idle environments: {reclaimed:?}");
                }
            }
        });

        vec![monitor_handle, dispatcher_handle, idle_handle]
    }

    pub fn request_shutdown(&self) {
        self.shutdown.cancel();
    }

    // ---- Submission API ----------------------------------------

    /// Validates and durably records a plan, then wakes the Queue Monitor
    /// so its expansion doesn't wait for the next poll tick. Returns once
    /// the `plan_submitted` event is durable (§4.6, §7: submission must be
    /// durable before acknowledging the caller).
    pub async fn submit_plan(&self, plan: ExecutionPlan) -> Result<(), SubmissionError> {
        plan.validate().map_err(SubmissionError::InvalidPlan)?;
        let errors = self.persistence.error_count();
        if errors >= self.config.orchestrator.degraded_error_threshold {
            return Err(SubmissionError::Degraded(errors));
        }
        self.persistence.append_plan_submitted(&plan).await?;
        {
            let mut table = self.test_cases.lock().await;
            for test in &plan.tests {
                table.insert(test.test_id.clone(), test.clone());
            }
        }
        self.queue_monitor.wake.notify_waiters();
        Ok(())
    }

    /// Cancels a single test. A still-queued request is dropped from the
    /// queue outright; a running attempt's cancellation token is fired,
    /// letting the runner perform its graceful-then-forced stop.
    pub async fn cancel(&self, test_id: &str) {
        let dropped_from_queue = self.queue.lock().await.cancel(test_id);
        if dropped_from_queue {
            self.status.decrement_queued();
        }
        if let Some(token) = self.cancellations.lock().await.get(test_id) {
            token.cancel();
        }
        self.status.set_status(&self.persistence, test_id, crate::model::AllocationStatus::Cancelled).await;
    }

    // ---- Status / health ---------------------------------------

    pub fn status_snapshot(&self) -> StatusSnapshot {
        self.status.snapshot()
    }

    pub async fn environment_snapshot(&self) -> Vec<Environment> {
        self.resource.snapshot().await
    }

    pub async fn report_environment_health(&self, env_id: &str, health: crate::model::EnvironmentHealth) {
        self.resource.report_health(env_id, health).await;
    }

    /// Operational state plus an environment-pool summary. `submit_plan`
    /// starts rejecting new plans once `persistence_error_count` crosses
    /// `config.orchestrator.degraded_error_threshold`, at which point this
    /// reports [`OperationalState::Degraded`]; existing in-flight work is
    /// unaffected and keeps draining through the dispatcher.
    pub async fn health(&self) -> HealthReport {
        let errors = self.persistence.error_count();
        let state = if self.shutdown.is_cancelled() {
            OperationalState::Stopped
        } else if errors >= self.config.orchestrator.degraded_error_threshold {
            OperationalState::Degraded
        } else {
            OperationalState::Running
        };

        let mut summary = EnvironmentPoolSummary::default();
        for env in self.resource.snapshot().await {
            summary.total += 1;
            match env.status {
                EnvironmentStatus::Ready => summary.ready += 1,
                EnvironmentStatus::Allocated | EnvironmentStatus::Busy => summary.busy += 1,
                EnvironmentStatus::Provisioning => summary.provisioning += 1,
                EnvironmentStatus::Cleanup => summary.cleanup += 1,
                EnvironmentStatus::Maintenance => summary.quarantined += 1,
                EnvironmentStatus::Error | EnvironmentStatus::Offline => summary.unavailable += 1,
            }
        }

        HealthReport {
            state,
            persistence_error_count: errors,
            environments: summary,
        }
    }

    // ---- Result Retrieval API -----------------------------------

    pub async fn get_result(&self, test_id: &str) -> Option<TestResult> {
        self.persistence.get_result(test_id).await
    }

    pub async fn get_artifacts(&self, test_id: &str) -> Option<crate::model::ArtifactBundle> {
        self.get_result(test_id).await.map(|r| r.artifacts)
    }
}

fn environment_metadata(env_config: &crate::config::EnvironmentConfig) -> crate::model::EnvironmentMetadata {
    use crate::config::EnvironmentConfig;
    match env_config {
        EnvironmentConfig::Physical(p) => crate::model::EnvironmentMetadata {
            ip: p.ssh_target.clone(),
            ssh_key_path: p.ssh_key_path.as_ref().map(|p| p.display().to_string()),
            power_control_command: p.power_control_command.clone(),
            serial_console: p.serial_console.clone(),
        },
        _ => crate::model::EnvironmentMetadata::default(),
    }
}

/// Builds one instance of every backend's `Runner`, regardless of which
/// environment types are actually configured — the registry dispatches by
/// an environment's `env_type` at call time, so an unused backend
/// simply never gets called. Per-backend settings are taken from the
/// first matching `[[environments]]` entry, falling back to reasonable
/// defaults when that backend isn't configured at all.
fn build_runner_registry(config: &Config) -> anyhow::Result<RunnerRegistry> {
    use crate::config::EnvironmentConfig;

    let (image, network_mode) = config
        .environments
        .iter()
        .find_map(|e| match e {
            EnvironmentConfig::Container(c) => Some((c.image.clone(), c.network_mode.clone())),
            _ => None,
        })
        .unwrap_or_else(|| ("alpine:latest".to_string(), "none".to_string()));
    let docker = bollard::Docker::connect_with_local_defaults()?;

    let vm_driver = config
        .environments
        .iter()
        .find_map(|e| match e {
            EnvironmentConfig::Vm(v) => Some(v.driver_command.clone()),
            _ => None,
        })
        .unwrap_or_else(|| "marshal-vm-driver".to_string());
    let vm_image = config
        .environments
        .iter()
        .find_map(|e| match e {
            EnvironmentConfig::Vm(v) => Some(v.image.clone()),
            _ => None,
        })
        .unwrap_or_else(|| "default".to_string());

    let physical = config.environments.iter().find_map(|e| match e {
        EnvironmentConfig::Physical(p) => Some(p.clone()),
        _ => None,
    });

    let process_shell = config
        .environments
        .iter()
        .find_map(|e| match e {
            EnvironmentConfig::Process(p) => Some(p.shell.clone()),
            _ => None,
        })
        .unwrap_or_else(|| "/bin/sh".to_string());

    Ok(RunnerRegistry::new(
        ContainerRunner::new(docker, image, network_mode),
        VmRunner::new(vm_driver, vm_image),
        PhysicalRunner::new(
            physical.as_ref().and_then(|p| p.ssh_target.clone()),
            physical
                .as_ref()
                .and_then(|p| p.ssh_key_path.as_ref().map(|p| p.display().to_string())),
            physical.as_ref().and_then(|p| p.serial_console.clone()),
            physical.as_ref().and_then(|p| p.power_control_command.clone()),
            Box::new(CommandPowerController),
        ),
        ProcessRunner::new(process_shell),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, EnvironmentConfig, OrchestratorConfig, ProcessEnvironmentConfig, CapacityConfig, ReportConfig};
    use crate::model::{Architecture, HardwareRequirements, IsolationLevel, TestCase, TestType};

    fn test_config(root: std::path::PathBuf) -> Config {
        Config {
            orchestrator: OrchestratorConfig {
                persistence_root: root,
                ..Default::default()
            },
            environments: vec![EnvironmentConfig::Process(ProcessEnvironmentConfig {
                id_prefix: "local".to_string(),
                count: 2,
                architecture: Architecture::X86_64,
                capacity: CapacityConfig {
                    memory_mb: 2048,
                    cpu: 2,
                    features: Default::default(),
                },
                working_dir: None,
                shell: "/bin/sh".to_string(),
            })],
            report: ReportConfig::default(),
        }
    }

    fn sample_plan(plan_id: &str) -> ExecutionPlan {
        ExecutionPlan {
            plan_id: plan_id.to_string(),
            tests: vec![TestCase {
                test_id: format!("{plan_id}-t1"),
                script: b"exit 0\n".to_vec(),
                test_type: TestType::Unit,
                hardware_requirements: HardwareRequirements {
                    architecture: Architecture::X86_64,
                    min_memory_mb: 0,
                    min_cpu: 0,
                    required_features: Default::default(),
                    isolation_level: IsolationLevel::Process,
                },
                timeout_ms: Some(5_000),
                priority_hint: None,
            }],
            priority: 5,
            submitted_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn submit_plan_rejects_invalid_priority() {
        let dir = tempfile::TempDir::new().unwrap();
        let orchestrator = Orchestrator::new(test_config(dir.path().to_path_buf())).await.unwrap();
        let mut plan = sample_plan("p1");
        plan.priority = 99;
        let result = orchestrator.submit_plan(plan).await;
        assert!(matches!(result, Err(SubmissionError::InvalidPlan(_))));
    }

    #[tokio::test]
    async fn submit_plan_is_durable_immediately() {
        let dir = tempfile::TempDir::new().unwrap();
        let orchestrator = Orchestrator::new(test_config(dir.path().to_path_buf())).await.unwrap();
        orchestrator.submit_plan(sample_plan("p1")).await.unwrap();
        let records = orchestrator.persistence.read_all().await.unwrap();
        assert!(records
            .iter()
            .any(|r| matches!(&r.event, crate::persistence::Event::PlanSubmitted { plan } if plan.plan_id == "p1")));
    }

    #[tokio::test]
    async fn cancel_before_dispatch_marks_cancelled_and_drops_from_queue() {
        let dir = tempfile::TempDir::new().unwrap();
        let orchestrator = Orchestrator::new(test_config(dir.path().to_path_buf())).await.unwrap();
        orchestrator.submit_plan(sample_plan("p1")).await.unwrap();
        orchestrator
            .queue_monitor
            .expand_and_enqueue(
                &sample_plan("p1"),
                &orchestrator.queue,
                &orchestrator.queue_signal,
                &orchestrator.seq,
                &orchestrator.status,
                &orchestrator.persistence,
                &orchestrator.resource,
            )
            .await
            .unwrap();
        orchestrator.cancel("p1-t1").await;
        assert_eq!(
            orchestrator.status_snapshot().per_test_status.get("p1-t1"),
            Some(&crate::model::AllocationStatus::Cancelled)
        );
    }

    #[tokio::test]
    async fn health_reports_running_with_no_persistence_errors() {
        let dir = tempfile::TempDir::new().unwrap();
        let orchestrator = Orchestrator::new(test_config(dir.path().to_path_buf())).await.unwrap();
        let health = orchestrator.health().await;
        assert_eq!(health.state, crate::model::OperationalState::Running);
        assert_eq!(health.persistence_error_count, 0);
        assert_eq!(health.environments.total, 2);
        assert_eq!(health.environments.ready, 2);
    }

    #[tokio::test]
    async fn submit_plan_is_rejected_once_degraded_threshold_is_crossed() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = test_config(dir.path().to_path_buf());
        config.orchestrator.degraded_error_threshold = 1;
        let orchestrator = Orchestrator::new(config).await.unwrap();

        // Force a durable-write failure by replacing the persistence root
        // with a plain file.
        std::fs::remove_dir_all(dir.path()).unwrap();
        std::fs::write(dir.path(), b"not a directory").unwrap();
        let result = orchestrator.submit_plan(sample_plan("p1")).await;
        assert!(result.is_err());

        let health = orchestrator.health().await;
        assert_eq!(health.state, crate::model::OperationalState::Degraded);

        let rejected = orchestrator.submit_plan(sample_plan("p2")).await;
        assert!(matches!(rejected, Err(SubmissionError::Degraded(_))));
    }

    /// P7: every `request_allocated(env_id)` event is followed by exactly
    /// one subsequent `env_state_changed(env_id, READY|ERROR)` before that
    /// env_id is allocated again. Drives a real env failure (broken shell)
    /// through the dispatcher and checks the durable event log directly,
    /// rather than only the in-memory pool snapshot.
    #[tokio::test]
    async fn env_failure_emits_durable_env_state_changed_error_event() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = Config {
            orchestrator: OrchestratorConfig {
                persistence_root: dir.path().to_path_buf(),
                queue_poll_interval_ms: 50,
                timeout_grace_ms: 200,
                ..Default::default()
            },
            environments: vec![
                EnvironmentConfig::Process(ProcessEnvironmentConfig {
                    id_prefix: "broken".to_string(),
                    count: 1,
                    architecture: Architecture::X86_64,
                    capacity: CapacityConfig {
                        memory_mb: 2048,
                        cpu: 2,
                        features: Default::default(),
                    },
                    working_dir: None,
                    shell: "/nonexistent/marshal-test-shell".to_string(),
                }),
                EnvironmentConfig::Process(ProcessEnvironmentConfig {
                    id_prefix: "good".to_string(),
                    count: 1,
                    architecture: Architecture::X86_64,
                    capacity: CapacityConfig {
                        memory_mb: 2048,
                        cpu: 2,
                        features: Default::default(),
                    },
                    working_dir: None,
                    shell: "/bin/sh".to_string(),
                }),
            ],
            report: ReportConfig::default(),
        };

        let orchestrator = Orchestrator::new(config).await.unwrap();
        let _handles = orchestrator.spawn_background_loops();

        let mut plan = sample_plan("p-env-fail");
        plan.tests[0].timeout_ms = Some(5_000);
        orchestrator.submit_plan(plan).await.unwrap();

        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(10);
        loop {
            if orchestrator.get_result("p-env-fail-t1").await.is_some() {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "test never reached a terminal status");
            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        }

        let records = orchestrator.persistence.read_all().await.unwrap();
        let saw_error_event = records.iter().any(|r| {
            matches!(
                &r.event,
                crate::persistence::Event::EnvStateChanged { env_id, status }
                    if env_id == "broken-0" && status == "ERROR"
            )
        });
        assert!(saw_error_event, "expected a durable EnvStateChanged(broken-0, ERROR) event");

        // The healthy environment, once released, gets its own durable
        // READY event — a quarantined env never does.
        let saw_ready_event = records.iter().any(|r| {
            matches!(
                &r.event,
                crate::persistence::Event::EnvStateChanged { env_id, status }
                    if env_id == "good-0" && status == "READY"
            )
        });
        assert!(saw_ready_event, "expected a durable EnvStateChanged(good-0, READY) event");

        let never_unquarantined = !records.iter().any(|r| {
            matches!(
                &r.event,
                crate::persistence::Event::EnvStateChanged { env_id, status }
                    if env_id == "broken-0" && status == "READY"
            )
        });
        assert!(never_unquarantined, "broken-0 must never be reported READY again");

        orchestrator.request_shutdown();
    }
}
