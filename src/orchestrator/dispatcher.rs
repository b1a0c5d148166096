//! Scheduler / Dispatcher.
//!
//! The central loop: a concurrency-bounded dispatch loop over the
//! priority queue. Pop the highest-priority satisfiable request, allocate
//! an environment, spawn the run, fold the outcome into a durable
//! terminal `TestResult`, release the environment, and repeat.
//! Concurrency is capped by an explicit `tokio::sync::Semaphore` sized
//! off the environment pool by default.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::OrchestratorConfig;
use crate::model::{
    AllocationRequest, AllocationStatus, ArtifactBundle, FailureClass, InsertionSeq, TestCase,
    TestResult,
};
use crate::panic_detect;
use crate::persistence::Persistence;
use crate::queue::PriorityQueue;
use crate::resource::ResourceManager;
use crate::runner::{RunOutcome, RunnerRegistry};
use crate::status::StatusTracker;

/// Registry of in-flight tests' cancellation tokens, consulted by
/// `Orchestrator::cancel` (§4.5, §6 "cancel a specific test").
pub type CancellationRegistry = Mutex<HashMap<String, CancellationToken>>;

/// Looks up a `TestCase` by id within an in-memory table populated as plans
/// are expanded, since `AllocationRequest` only carries a test's identity
/// and requirements, not its script.
pub type TestCaseTable = Mutex<HashMap<String, TestCase>>;

pub struct Dispatcher {
    config: OrchestratorConfig,
}

impl Dispatcher {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self { config }
    }

    /// Runs until `shutdown` fires. Each iteration waits for a satisfiable
    /// request and a free concurrency permit, then spawns the attempt and
    /// loops immediately without waiting for it to finish — the permit
    /// itself bounds concurrency (§4.5 "bounded worker count").
    #[allow(clippy::too_many_arguments)]
    pub async fn run(
        &self,
        queue: Arc<Mutex<PriorityQueue>>,
        queue_signal: Arc<tokio::sync::Notify>,
        status: Arc<StatusTracker>,
        persistence: Arc<Persistence>,
        resource: Arc<ResourceManager>,
        runners: Arc<RunnerRegistry>,
        seq: Arc<InsertionSeq>,
        test_cases: Arc<TestCaseTable>,
        cancellations: Arc<CancellationRegistry>,
        shutdown: CancellationToken,
    ) {
        let permits = match self.config.max_concurrent_runs {
            Some(p) if p > 0 => p,
            _ => resource.pool_size().await.max(1),
        };
        let semaphore = Arc::new(Semaphore::new(permits));
        info!("dispatcher starting with {permits} concurrent run slots");

        loop {
            if shutdown.is_cancelled() {
                return;
            }

            let shapes = resource.available_shapes().await;
            let next = { queue.lock().await.pop_ready(&shapes) };

            let Some(request) = next else {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = queue_signal.notified() => {},
                    _ = resource.availability.notified() => {},
                    _ = tokio::time::sleep(Duration::from_millis(self.config.queue_poll_interval_ms)) => {},
                }
                continue;
            };

            let handle = match resource.try_allocate(&request.requirements).await {
                Ok(h) => h,
                Err(e) => {
                    // Not satisfiable right now; put it back and wait for
                    // availability to change before retrying.
                    warn!("allocation deferred for {}: {e}", request.test_id);
                    queue.lock().await.push_back(request);
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = resource.availability.notified() => {},
                        _ = tokio::time::sleep(Duration::from_millis(self.config.queue_poll_interval_ms)) => {},
                    }
                    continue;
                }
            };

            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                resource.revert_allocation(&handle).await;
                continue;
            };

            if let Err(e) = persistence
                .append_request_allocated(&request.test_id, &handle.env_id)
                .await
            {
                warn!("allocation for {} failed to persist durably: {e}", request.test_id);
                resource.revert_allocation(&handle).await;
                queue.lock().await.push_back(request);
                drop(permit);
                continue;
            }

            let Some(test_case) = test_cases.lock().await.get(&request.test_id).cloned() else {
                warn!("no test case registered for {}, dropping request", request.test_id);
                resource.revert_allocation(&handle).await;
                drop(permit);
                continue;
            };

            let config = self.config.clone();
            let queue2 = queue.clone();
            let status2 = status.clone();
            let persistence2 = persistence.clone();
            let resource2 = resource.clone();
            let runners2 = runners.clone();
            let cancellations2 = cancellations.clone();

            tokio::spawn(async move {
                run_one_attempt(
                    request,
                    test_case,
                    handle,
                    config,
                    queue2,
                    status2,
                    persistence2,
                    resource2,
                    runners2,
                    cancellations2,
                )
                .await;
                drop(permit);
            });
        }
    }
}

/// Executes exactly one attempt of one test: allocate (already done by the
/// caller) -> prepare -> execute -> collect artifacts -> reset -> terminal
/// persistence -> release. Handles the single bounded env-failure retry and
/// kernel-panic quarantine.
#[allow(clippy::too_many_arguments)]
async fn run_one_attempt(
    request: AllocationRequest,
    test: TestCase,
    handle: crate::resource::AllocationHandle,
    config: OrchestratorConfig,
    queue: Arc<Mutex<PriorityQueue>>,
    status: Arc<StatusTracker>,
    persistence: Arc<Persistence>,
    resource: Arc<ResourceManager>,
    runners: Arc<RunnerRegistry>,
    cancellations: Arc<CancellationRegistry>,
) {
    let test_id = request.test_id.clone();
    resource.mark_busy(&handle, &test_id).await;
    status.decrement_queued();
    status.increment_active();
    status.set_status(&persistence, &test_id, AllocationStatus::Running).await;

    if let Err(e) = persistence.append_request_running(&test_id, request.attempt).await {
        warn!("running transition for {test_id} failed to persist durably: {e}");
    }

    let cancel = CancellationToken::new();
    cancellations.lock().await.insert(test_id.clone(), cancel.clone());

    let Some(env) = resource.get(&handle.env_id).await else {
        status.decrement_active();
        cancellations.lock().await.remove(&test_id);
        return;
    };

    let runner = runners.for_environment(env.env_type);
    let timeout = Duration::from_millis(test.timeout_ms.unwrap_or(config.default_timeout_ms));
    let grace = Duration::from_millis(config.timeout_grace_ms);

    let started_at = chrono::Utc::now();
    let outcome = match runner.prepare(&env, &test).await {
        Ok(()) => runner.execute(&env, &test, timeout, grace, cancel.clone()).await,
        Err(e) => Err(e),
    };
    let now = chrono::Utc::now();

    let (final_status, exit_code, stdout, stderr, mut artifacts, failure_class, env_failed) = match outcome {
        Ok(RunOutcome::Finished { exit_code, stdout, stderr, artifacts }) => {
            let panicked = panic_detect::detect(&stdout, &stderr);
            if panicked {
                (
                    AllocationStatus::Failed,
                    Some(exit_code),
                    stdout,
                    stderr,
                    artifacts,
                    Some(FailureClass::KernelPanic),
                    true,
                )
            } else if exit_code == 0 {
                (AllocationStatus::Completed, Some(exit_code), stdout, stderr, artifacts, None, false)
            } else {
                (AllocationStatus::Failed, Some(exit_code), stdout, stderr, artifacts, None, false)
            }
        }
        Ok(RunOutcome::TimedOut { artifacts }) => (
            AllocationStatus::TimedOut,
            None,
            String::new(),
            String::new(),
            artifacts,
            None,
            false,
        ),
        Ok(RunOutcome::Cancelled) => (
            AllocationStatus::Cancelled,
            None,
            String::new(),
            String::new(),
            ArtifactBundle::default(),
            None,
            false,
        ),
        Ok(RunOutcome::EnvironmentFailure { failure_class, detail }) => {
            warn!("environment {} failed running {test_id}: {detail}", env.env_id);
            (
                AllocationStatus::Failed,
                None,
                String::new(),
                detail,
                ArtifactBundle::default(),
                Some(failure_class),
                true,
            )
        }
        Err(e) => {
            warn!("runner error executing {test_id} on {}: {e}", env.env_id);
            (
                AllocationStatus::Failed,
                None,
                String::new(),
                e.to_string(),
                ArtifactBundle::default(),
                Some(FailureClass::EnvFailure),
                true,
            )
        }
    };

    cancellations.lock().await.remove(&test_id);

    if let Ok(collected) = runner.collect_artifacts(&env, &test).await {
        artifacts.artifacts.extend(collected.artifacts);
    }

    if env_failed {
        resource.quarantine(&env.env_id).await;
        if let Err(e) = persistence.append_env_state_changed(&env.env_id, "ERROR").await {
            warn!("env-state-changed event for {} failed to persist durably: {e}", env.env_id);
        }
    }

    // Single bounded env-failure retry, preserving submitted_at/priority
    // and the original insertion_seq's FIFO position (§4.5, §9 per-test
    // atomicity: only this test, not sibling tests in the plan, retries).
    let should_retry = env_failed
        && config.retry_on_env_failure
        && request.attempt < 2
        && failure_class == Some(FailureClass::EnvFailure);

    if should_retry {
        status.decrement_active();
        status.mark_queued(&test_id);
        if let Err(e) = persistence.append_request_enqueued(&test_id, &request.plan_id).await {
            warn!("retry re-enqueue for {test_id} failed to persist durably: {e}");
        }
        let mut retried = request.clone();
        retried.attempt += 1;
        queue.lock().await.push_back(retried);
        // `env` was just quarantined above (§7 "quarantined for
        // inspection, not simply reset"): do NOT reset-and-release it
        // back into the pool here, or the quarantine is immediately
        // undone and the retry would be eligible to land right back on
        // the environment that just failed it.
        return;
    }

    let result = TestResult {
        test_id: test_id.clone(),
        attempt: request.attempt,
        status: final_status.clone(),
        exit_code,
        stdout,
        stderr,
        started_at,
        ended_at: now,
        artifacts,
        failure_class,
        env_id: env.env_id.clone(),
    };

    if let Err(e) = persistence.append_request_terminal(&result).await {
        warn!("terminal result for {test_id} failed to persist durably: {e}");
    }
    status.set_status(&persistence, &test_id, final_status).await;
    status.decrement_active();

    // A quarantined environment stays out of the pool (§7.4: "quarantined
    // for inspection, not simply reset") — only reset-and-release on
    // outcomes that didn't implicate the environment itself.
    if !env_failed {
        release_environment(&resource, &persistence, &runners, &handle, &env).await;
    }
}

async fn release_environment(
    resource: &Arc<ResourceManager>,
    persistence: &Arc<Persistence>,
    runners: &Arc<RunnerRegistry>,
    handle: &crate::resource::AllocationHandle,
    env: &crate::model::Environment,
) {
    let runner = runners.for_environment(env.env_type);
    let reset_ok = matches!(runner.reset(env).await, Ok(true));
    let _ = resource.release(handle, || async move { reset_ok }).await;

    let state = match resource.get(&handle.env_id).await.map(|e| e.status) {
        Some(crate::model::EnvironmentStatus::Ready) => "READY",
        _ => "ERROR",
    };
    if let Err(e) = persistence.append_env_state_changed(&handle.env_id, state).await {
        warn!("env-state-changed event for {} failed to persist durably: {e}", handle.env_id);
    }
}
