//! Recovery Coordinator.
//!
//! Runs once at startup, before the dispatcher or queue monitor are let
//! loose on the pool. Replays the event log to reconstruct which requests
//! never reached a terminal state and re-queues them, giving the
//! orchestrator its at-least-once execution guarantee across a crash or
//! restart.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::model::{AllocationRequest, AllocationStatus, ExecutionPlan, InsertionSeq};
use crate::persistence::{Event, Persistence};
use crate::queue::{PriorityQueue, QueueMonitor};
use crate::resource::ResourceManager;
use crate::status::StatusTracker;

pub struct RecoveryCoordinator;

impl RecoveryCoordinator {
    /// Recovery steps, per §4.6:
    /// 1. Replay the event log, reconstructing every submitted plan, every
    ///    request's last-known non-terminal state, and the terminal-result
    ///    snapshot.
    /// 2. Restore terminal statuses into the Status Tracker without
    ///    perturbing queued/active counters.
    /// 3. Mark every configured environment PROVISIONING, forcing
    ///    revalidation before any allocation is handed out.
    /// 4. Re-enqueue every request that reached ALLOCATED or RUNNING but
    ///    never reached a terminal status, preserving its original
    ///    priority/submitted_at (a fresh `insertion_seq`, since the
    ///    original ordering position among already-drained siblings is
    ///    unrecoverable and re-queuing at the current tail is the
    ///    documented fallback) and bumping `attempt` by one (the in-flight
    ///    attempt is presumed lost, not completed).
    /// 5. Seed the Queue Monitor's `seen_plans` so its own poll doesn't
    ///    re-expand (and so double-enqueue) plans this pass already
    ///    recovered.
    #[allow(clippy::too_many_arguments)]
    pub async fn recover(
        persistence: &Persistence,
        resource: &ResourceManager,
        status: &StatusTracker,
        queue: &Mutex<PriorityQueue>,
        queue_monitor: &QueueMonitor,
        seq: &InsertionSeq,
    ) -> Result<(), crate::persistence::PersistenceError> {
        let records = persistence.read_all().await?;

        let mut plans: HashMap<String, ExecutionPlan> = HashMap::new();
        let mut last_request: HashMap<String, AllocationRequest> = HashMap::new();
        let mut attempts: HashMap<String, u32> = HashMap::new();
        let mut terminal: HashSet<String> = HashSet::new();

        for record in &records {
            match &record.event {
                Event::PlanSubmitted { plan } => {
                    plans.insert(plan.plan_id.clone(), plan.clone());
                }
                Event::RequestEnqueued { test_id, plan_id } => {
                    if let Some(plan) = plans.get(plan_id)
                        && let Some(test) = plan.tests.iter().find(|t| &t.test_id == test_id)
                    {
                        let priority = test.priority_hint.unwrap_or(plan.priority).min(plan.priority).max(1);
                        last_request.insert(
                            test_id.clone(),
                            AllocationRequest {
                                test_id: test_id.clone(),
                                plan_id: plan_id.clone(),
                                requirements: test.hardware_requirements.clone(),
                                priority,
                                submitted_at: plan.submitted_at,
                                insertion_seq: seq.next(),
                                status: AllocationStatus::Pending,
                                attempt: *attempts.get(test_id).unwrap_or(&0) + 1,
                            },
                        );
                    }
                }
                Event::RequestRunning { test_id, attempt } => {
                    attempts.insert(test_id.clone(), *attempt);
                }
                Event::RequestTerminal { result } => {
                    terminal.insert(result.test_id.clone());
                }
                _ => {}
            }
        }

        // Step 2: restore terminal statuses from the compacted snapshot.
        let results = persistence.all_terminal_results().await;
        for result in results.values() {
            status.restore_terminal(&result.test_id, result.status.clone());
        }

        // Step 3: force revalidation of every configured environment.
        resource.mark_all_provisioning().await;

        // Step 4: re-enqueue everything that reached ENQUEUED/ALLOCATED/
        // RUNNING but never a terminal status.
        let mut requeued = 0usize;
        {
            let mut q = queue.lock().await;
            for (test_id, mut request) in last_request {
                if terminal.contains(&test_id) {
                    continue;
                }
                request.attempt += 1;
                status.mark_queued(&test_id);
                q.push(request);
                requeued += 1;
            }
        }

        // Step 5: prevent the queue monitor from re-expanding plans this
        // pass already accounted for.
        queue_monitor.seed_seen_plans(plans.keys().cloned()).await;

        info!(
            "recovery complete: {} plans replayed, {requeued} requests re-queued, {} terminal results restored",
            plans.len(),
            results.len()
        );
        Ok(())
    }
}

/// Convenience wrapper bundling recovery's collaborators, constructed once
/// in `Orchestrator::new` and consumed by `recover()` at startup.
pub struct RecoveryInputs {
    pub persistence: Arc<Persistence>,
    pub resource: Arc<ResourceManager>,
    pub status: Arc<StatusTracker>,
    pub queue: Arc<Mutex<PriorityQueue>>,
    pub queue_monitor: Arc<QueueMonitor>,
    pub seq: Arc<InsertionSeq>,
}

impl RecoveryInputs {
    pub async fn run(&self) {
        if let Err(e) = RecoveryCoordinator::recover(
            &self.persistence,
            &self.resource,
            &self.status,
            &self.queue,
            &self.queue_monitor,
            &self.seq,
        )
        .await
        {
            warn!("recovery pass failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Architecture, HardwareRequirements, IsolationLevel, TestCase, TestType};
    use tempfile::TempDir;

    fn sample_plan() -> ExecutionPlan {
        ExecutionPlan {
            plan_id: "p1".to_string(),
            tests: vec![TestCase {
                test_id: "t1".to_string(),
                script: b"exit 0".to_vec(),
                test_type: TestType::Unit,
                hardware_requirements: HardwareRequirements {
                    architecture: Architecture::X86_64,
                    min_memory_mb: 0,
                    min_cpu: 0,
                    required_features: Default::default(),
                    isolation_level: IsolationLevel::Process,
                },
                timeout_ms: None,
                priority_hint: None,
            }],
            priority: 5,
            submitted_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn requeues_requests_that_never_reached_terminal_state() {
        let dir = TempDir::new().unwrap();
        let persistence = Persistence::load(dir.path().to_path_buf()).await;
        let plan = sample_plan();
        persistence.append_plan_submitted(&plan).await.unwrap();
        persistence.append_request_enqueued("t1", "p1").await.unwrap();
        persistence.append_request_allocated("t1", "env1").await.unwrap();
        persistence.append_request_running("t1", 1).await.unwrap();
        // Crash before a terminal result is written.

        let resource = ResourceManager::new(
            vec![crate::resource::tests_support::env_with_arch(Architecture::X86_64)],
            2,
            300,
        );
        let status = StatusTracker::new();
        let queue = Mutex::new(PriorityQueue::new());
        let queue_monitor = QueueMonitor::new(std::time::Duration::from_secs(1));
        let seq = InsertionSeq::new();

        RecoveryCoordinator::recover(&persistence, &resource, &status, &queue, &queue_monitor, &seq)
            .await
            .unwrap();

        let q = queue.lock().await;
        assert_eq!(q.len(), 1);
        let next = q.peek_next().unwrap();
        assert_eq!(next.test_id, "t1");
        assert_eq!(next.attempt, 2);
    }

    #[tokio::test]
    async fn does_not_requeue_requests_that_already_completed() {
        let dir = TempDir::new().unwrap();
        let persistence = Persistence::load(dir.path().to_path_buf()).await;
        let plan = sample_plan();
        persistence.append_plan_submitted(&plan).await.unwrap();
        persistence.append_request_enqueued("t1", "p1").await.unwrap();
        persistence.append_request_allocated("t1", "env1").await.unwrap();
        persistence.append_request_running("t1", 1).await.unwrap();
        let result = crate::model::TestResult {
            test_id: "t1".to_string(),
            attempt: 1,
            status: AllocationStatus::Completed,
            exit_code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
            started_at: chrono::Utc::now(),
            ended_at: chrono::Utc::now(),
            artifacts: Default::default(),
            failure_class: None,
            env_id: "env1".to_string(),
        };
        persistence.append_request_terminal(&result).await.unwrap();

        let resource = ResourceManager::new(
            vec![crate::resource::tests_support::env_with_arch(Architecture::X86_64)],
            2,
            300,
        );
        let status = StatusTracker::new();
        let queue = Mutex::new(PriorityQueue::new());
        let queue_monitor = QueueMonitor::new(std::time::Duration::from_secs(1));
        let seq = InsertionSeq::new();

        RecoveryCoordinator::recover(&persistence, &resource, &status, &queue, &queue_monitor, &seq)
            .await
            .unwrap();

        assert!(queue.lock().await.is_empty());
        assert_eq!(status.status_of("t1"), Some(AllocationStatus::Completed));
    }
}
