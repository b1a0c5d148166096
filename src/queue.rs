//! Priority Queue & Queue Monitor.
//!
//! An ordered-multiset priority queue, keyed `(-priority, submitted_at,
//! insertion_seq)`, plus head-of-line-avoidance via `pop_ready`.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashSet};

use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use crate::model::{AllocationRequest, HardwareRequirements, TestId};

/// A key identifying the "shape" of a requirement, used by the dispatcher
/// to avoid head-of-line blocking on an unsatisfiable top entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequirementShape {
    pub architecture: crate::model::Architecture,
    pub isolation_level: crate::model::IsolationLevel,
}

impl From<&HardwareRequirements> for RequirementShape {
    fn from(r: &HardwareRequirements) -> Self {
        Self {
            architecture: r.architecture,
            isolation_level: r.isolation_level,
        }
    }
}

/// Wraps an `AllocationRequest` with the `Ord` spec requires: highest
/// priority first, then earliest `submitted_at`, then lowest
/// `insertion_seq` (P2).
#[derive(Debug, Clone)]
struct QueueEntry(AllocationRequest);

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp_key() == other.cmp_key()
    }
}
impl Eq for QueueEntry {}

impl QueueEntry {
    fn cmp_key(&self) -> (u8, std::cmp::Reverse<DateTime<Utc>>, std::cmp::Reverse<u64>) {
        (
            self.0.priority,
            std::cmp::Reverse(self.0.submitted_at),
            std::cmp::Reverse(self.0.insertion_seq),
        )
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap is a max-heap: higher priority, then earlier
        // submitted_at, then lower insertion_seq must compare "greater".
        self.cmp_key().cmp(&other.cmp_key())
    }
}

/// Ordered multiset of `AllocationRequest`, single-writer (Queue Monitor)
/// / single-reader (dispatcher), per the shared-resource policy in §5.
///
/// Wake-up signaling lives outside this struct (on the owning
/// `Orchestrator`, as a plain `Arc<Notify>`) rather than as a field here:
/// a `Notify` nested inside the `tokio::sync::Mutex<PriorityQueue>` the
/// dispatcher locks would force callers to hold the lock across the
/// `.notified()` await point just to reach it.
#[derive(Default)]
pub struct PriorityQueue {
    heap: BinaryHeap<QueueEntry>,
    cancelled: HashSet<TestId>,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            cancelled: HashSet::new(),
        }
    }

    pub fn push(&mut self, request: AllocationRequest) {
        self.heap.push(QueueEntry(request));
    }

    pub fn peek_next(&self) -> Option<&AllocationRequest> {
        self.heap.peek().map(|e| &e.0)
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Marks a test cancelled so a later `pop_ready` silently drops it. A
    /// `PENDING` request is removed synchronously per §5.
    pub fn cancel(&mut self, test_id: &str) -> bool {
        self.cancelled.insert(test_id.to_string())
    }

    /// Returns the highest-priority request whose requirement shape is
    /// present in `shapes`, leaving lower-priority-but-satisfiable entries
    /// and the unsatisfiable top entry both in the queue untouched. This
    /// is the head-of-line-avoidance behavior required by §4.2: within the
    /// satisfiable-shape filter, strict priority then FIFO is preserved.
    pub fn pop_ready(&mut self, shapes: &HashSet<RequirementShape>) -> Option<AllocationRequest> {
        let mut deferred = Vec::new();
        let mut found = None;
        while let Some(entry) = self.heap.pop() {
            if self.cancelled.remove(&entry.0.test_id) {
                continue; // dropped, not deferred: cancellation wins outright
            }
            let shape = RequirementShape::from(&entry.0.requirements);
            if shapes.contains(&shape) {
                found = Some(entry.0);
                break;
            }
            deferred.push(entry);
        }
        for entry in deferred {
            self.heap.push(entry);
        }
        found
    }

    /// Re-queues a request after an allocation or environment failure,
    /// preserving its original `submitted_at`/`insertion_seq` so its FIFO
    /// position is honored.
    pub fn push_back(&mut self, request: AllocationRequest) {
        self.push(request);
    }
}

/// Polls the Persistence Store for newly-accepted plans at a bounded
/// interval and is woken directly by the submission API. Expands
/// each plan into one `AllocationRequest` per test, records `PENDING`
/// status, writes a durable "enqueued" event, then pushes onto the queue.
pub struct QueueMonitor {
    poll_interval: std::time::Duration,
    seen_plans: tokio::sync::Mutex<HashSet<String>>,
    pub wake: Notify,
}

impl QueueMonitor {
    pub fn new(poll_interval: std::time::Duration) -> Self {
        Self {
            poll_interval,
            seen_plans: tokio::sync::Mutex::new(HashSet::new()),
            wake: Notify::new(),
        }
    }

    /// Marks plan ids as already expanded without enqueueing anything,
    /// used at startup so the Recovery Coordinator's explicit re-queue of
    /// in-flight requests isn't immediately duplicated by this monitor's
    /// next poll re-discovering the same `plan_submitted` events.
    pub async fn seed_seen_plans(&self, plan_ids: impl IntoIterator<Item = String>) {
        let mut seen = self.seen_plans.lock().await;
        seen.extend(plan_ids);
    }

    /// Expands a single plan into requests and pushes them, assigning
    /// `insertion_seq` from the shared sequence generator. Idempotent per
    /// plan: a plan already expanded is skipped on a later poll.
    ///
    /// A test whose requirements no caller-configured environment could
    /// *ever* satisfy is failed immediately with `failure_class =
    /// unsatisfiable` rather than pushed onto the queue: detected at the
    /// earliest point the system can know — enqueue time — so the caller
    /// observes a terminal status instead of silent indefinite `PENDING`.
    #[allow(clippy::too_many_arguments)]
    pub async fn expand_and_enqueue(
        &self,
        plan: &crate::model::ExecutionPlan,
        queue: &tokio::sync::Mutex<PriorityQueue>,
        queue_signal: &Notify,
        seq: &crate::model::InsertionSeq,
        status: &crate::status::StatusTracker,
        persistence: &crate::persistence::Persistence,
        resource: &crate::resource::ResourceManager,
    ) -> Result<(), crate::persistence::PersistenceError> {
        {
            let mut seen = self.seen_plans.lock().await;
            if !seen.insert(plan.plan_id.clone()) {
                return Ok(());
            }
        }
        let mut pushed_any = false;
        for test in &plan.tests {
            let request = AllocationRequest {
                test_id: test.test_id.clone(),
                plan_id: plan.plan_id.clone(),
                requirements: test.hardware_requirements.clone(),
                priority: test.priority_hint.unwrap_or(plan.priority).min(plan.priority).max(1),
                submitted_at: plan.submitted_at,
                insertion_seq: seq.next(),
                status: crate::model::AllocationStatus::Pending,
                attempt: 1,
            };
            status.mark_queued(&request.test_id);
            persistence
                .append_request_enqueued(&request.test_id, &plan.plan_id)
                .await?;

            if resource.could_ever_satisfy(&request.requirements).await {
                queue.lock().await.push(request);
                pushed_any = true;
            } else {
                tracing::warn!(
                    "test {} requirements unsatisfiable by any configured environment; failing immediately",
                    request.test_id
                );
                status.set_status(persistence, &request.test_id, crate::model::AllocationStatus::Failed).await;
                let now = chrono::Utc::now();
                let result = crate::model::TestResult {
                    test_id: request.test_id.clone(),
                    attempt: request.attempt,
                    status: crate::model::AllocationStatus::Failed,
                    exit_code: None,
                    stdout: String::new(),
                    stderr: String::new(),
                    started_at: now,
                    ended_at: now,
                    artifacts: crate::model::ArtifactBundle::default(),
                    failure_class: Some(crate::model::FailureClass::Unsatisfiable),
                    env_id: String::new(),
                };
                persistence.append_request_terminal(&result).await?;
            }
        }
        if pushed_any {
            queue_signal.notify_waiters();
        }
        Ok(())
    }

    /// Runs the poll loop until `shutdown` fires. In production this races
    /// the poll interval against `self.wake` (notified by `submit_plan`)
    /// exactly as the dispatcher races completion/new-request/availability
    /// signals in §4.5.
    #[allow(clippy::too_many_arguments)]
    pub async fn run(
        &self,
        persistence: &crate::persistence::Persistence,
        queue: &tokio::sync::Mutex<PriorityQueue>,
        queue_signal: &Notify,
        seq: &crate::model::InsertionSeq,
        status: &crate::status::StatusTracker,
        resource: &crate::resource::ResourceManager,
        shutdown: &tokio_util::sync::CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(self.poll_interval) => {},
                _ = self.wake.notified() => {},
            }
            let records = match persistence.read_all().await {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!("queue monitor failed to read persistence: {e}");
                    continue;
                }
            };
            for record in records {
                if let crate::persistence::Event::PlanSubmitted { plan } = record.event
                    && let Err(e) = self
                        .expand_and_enqueue(&plan, queue, queue_signal, seq, status, persistence, resource)
                        .await
                {
                    tracing::warn!("failed to enqueue plan {}: {e}", plan.plan_id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AllocationStatus, Architecture, IsolationLevel};
    use chrono::Duration;

    fn req(test_id: &str, priority: u8, offset_secs: i64, seq: u64) -> AllocationRequest {
        AllocationRequest {
            test_id: test_id.to_string(),
            plan_id: "p1".to_string(),
            requirements: HardwareRequirements {
                architecture: Architecture::X86_64,
                min_memory_mb: 0,
                min_cpu: 0,
                required_features: Default::default(),
                isolation_level: IsolationLevel::Container,
            },
            priority,
            submitted_at: Utc::now() + Duration::seconds(offset_secs),
            insertion_seq: seq,
            status: AllocationStatus::Pending,
            attempt: 1,
        }
    }

    fn all_shapes() -> HashSet<RequirementShape> {
        let mut s = HashSet::new();
        s.insert(RequirementShape {
            architecture: Architecture::X86_64,
            isolation_level: IsolationLevel::Container,
        });
        s
    }

    #[test]
    fn strict_priority_then_fifo() {
        // S1: priorities 3, 8, 5 -> dispatch order b(8), c(5), a(3).
        let mut q = PriorityQueue::new();
        q.push(req("a", 3, 0, 0));
        q.push(req("b", 8, 1, 1));
        q.push(req("c", 5, 2, 2));

        let shapes = all_shapes();
        let order: Vec<_> = std::iter::from_fn(|| q.pop_ready(&shapes))
            .map(|r| r.test_id)
            .collect();
        assert_eq!(order, vec!["b", "c", "a"]);
    }

    #[test]
    fn fifo_within_equal_priority() {
        // S2: identical priority, submitted_at order a, b, c.
        let mut q = PriorityQueue::new();
        let base = Utc::now();
        q.push(AllocationRequest {
            submitted_at: base,
            ..req("a", 5, 0, 0)
        });
        q.push(AllocationRequest {
            submitted_at: base + Duration::milliseconds(1),
            ..req("b", 5, 0, 1)
        });
        q.push(AllocationRequest {
            submitted_at: base + Duration::milliseconds(2),
            ..req("c", 5, 0, 2)
        });

        let shapes = all_shapes();
        let order: Vec<_> = std::iter::from_fn(|| q.pop_ready(&shapes))
            .map(|r| r.test_id)
            .collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn insertion_seq_breaks_exact_ties() {
        let mut q = PriorityQueue::new();
        let same_time = Utc::now();
        q.push(AllocationRequest {
            submitted_at: same_time,
            ..req("second", 5, 0, 5)
        });
        q.push(AllocationRequest {
            submitted_at: same_time,
            ..req("first", 5, 0, 1)
        });
        let shapes = all_shapes();
        assert_eq!(q.pop_ready(&shapes).unwrap().test_id, "first");
    }

    #[test]
    fn pop_ready_skips_unsatisfiable_head_without_blocking() {
        let mut q = PriorityQueue::new();
        let unsatisfiable = AllocationRequest {
            requirements: HardwareRequirements {
                architecture: Architecture::Riscv64,
                min_memory_mb: 0,
                min_cpu: 0,
                required_features: Default::default(),
                isolation_level: IsolationLevel::Container,
            },
            ..req("blocked", 10, 0, 0)
        };
        q.push(unsatisfiable);
        q.push(req("runnable", 1, 1, 1));

        let shapes = all_shapes();
        let popped = q.pop_ready(&shapes).unwrap();
        assert_eq!(popped.test_id, "runnable");
        // The unsatisfiable head-of-line entry is still queued, not dropped.
        assert_eq!(q.len(), 1);
        assert_eq!(q.peek_next().unwrap().test_id, "blocked");
    }

    #[test]
    fn cancel_drops_pending_request_from_queue() {
        let mut q = PriorityQueue::new();
        q.push(req("a", 5, 0, 0));
        assert!(q.cancel("a"));
        let shapes = all_shapes();
        assert!(q.pop_ready(&shapes).is_none());
    }

    #[test]
    fn push_back_preserves_original_ordering_key() {
        let mut q = PriorityQueue::new();
        let original = req("retry-me", 5, 0, 3);
        let submitted_at = original.submitted_at;
        let mut attempt2 = original.clone();
        attempt2.attempt = 2;
        q.push_back(attempt2);
        let popped = q.pop_ready(&all_shapes()).unwrap();
        assert_eq!(popped.submitted_at, submitted_at);
        assert_eq!(popped.attempt, 2);
    }

    fn sample_plan(priority: u8, architecture: Architecture) -> crate::model::ExecutionPlan {
        crate::model::ExecutionPlan {
            plan_id: "p-unsat".to_string(),
            tests: vec![crate::model::TestCase {
                test_id: "t-unsat".to_string(),
                script: b"exit 0".to_vec(),
                test_type: crate::model::TestType::Unit,
                hardware_requirements: HardwareRequirements {
                    architecture,
                    min_memory_mb: 0,
                    min_cpu: 0,
                    required_features: Default::default(),
                    isolation_level: IsolationLevel::Container,
                },
                timeout_ms: None,
                priority_hint: None,
            }],
            priority,
            submitted_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn unsatisfiable_requirement_fails_immediately_instead_of_queueing() {
        // S4: a pool with only arm64 environments, given an x86_64 request.
        let resource = crate::resource::ResourceManager::new(
            vec![crate::resource::tests_support::env_with_arch(Architecture::Arm64)],
            2,
            300,
        );
        let queue = tokio::sync::Mutex::new(PriorityQueue::new());
        let signal = Notify::new();
        let seq = crate::model::InsertionSeq::new();
        let status = crate::status::StatusTracker::new();
        let dir = tempfile::TempDir::new().unwrap();
        let persistence = crate::persistence::Persistence::new(dir.path().to_path_buf());
        let monitor = QueueMonitor::new(std::time::Duration::from_secs(1));

        let plan = sample_plan(5, Architecture::X86_64);
        monitor
            .expand_and_enqueue(&plan, &queue, &signal, &seq, &status, &persistence, &resource)
            .await
            .unwrap();

        assert!(queue.lock().await.is_empty());
        assert_eq!(status.status_of("t-unsat"), Some(AllocationStatus::Failed));
        let result = persistence.get_result("t-unsat").await.unwrap();
        assert_eq!(result.failure_class, Some(crate::model::FailureClass::Unsatisfiable));
    }
}
