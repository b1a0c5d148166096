//! Core data model: the entities and invariants the rest of the crate operates on.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type TestId = String;
pub type PlanId = String;
pub type EnvId = String;

/// CPU architecture a [`TestCase`] requires and an [`Environment`] provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    X86_64,
    Arm64,
    Riscv64,
}

/// The category of test, used by the Runner Registry to help pick a runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TestType {
    Unit,
    Integration,
    Performance,
    Security,
}

/// The isolation substrate a test requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationLevel {
    Process,
    Container,
    Vm,
}

/// Hardware requirements for a test case.
///
/// A closed struct: all recognized fields are
/// enumerated and unknown fields are rejected at the submission boundary
/// (`#[serde(deny_unknown_fields)]`) rather than an ad-hoc dynamic config
/// object.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct HardwareRequirements {
    pub architecture: Architecture,
    pub min_memory_mb: u64,
    pub min_cpu: u32,
    #[serde(default)]
    pub required_features: BTreeSet<String>,
    pub isolation_level: IsolationLevel,
}

/// A submitted, immutable unit of work.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TestCase {
    pub test_id: TestId,
    /// Opaque script blob; the orchestrator never interprets its contents.
    pub script: Vec<u8>,
    pub test_type: TestType,
    pub hardware_requirements: HardwareRequirements,
    pub timeout_ms: Option<u64>,
    pub priority_hint: Option<u8>,
}

/// A named group of tests submitted together with a shared priority.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutionPlan {
    pub plan_id: PlanId,
    pub tests: Vec<TestCase>,
    /// 1 (lowest) ..= 10 (highest).
    pub priority: u8,
    pub submitted_at: DateTime<Utc>,
}

impl ExecutionPlan {
    pub fn validate(&self) -> Result<(), String> {
        if !(1..=10).contains(&self.priority) {
            return Err(format!("priority {} out of range 1..=10", self.priority));
        }
        if self.tests.is_empty() {
            return Err("plan must contain at least one test".to_string());
        }
        Ok(())
    }
}

/// The internal per-test unit produced from a plan and scheduled independently.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub enum AllocationStatus {
    Pending,
    Allocated,
    Running,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl AllocationStatus {
    /// Terminal statuses never transition further.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AllocationStatus::Completed
                | AllocationStatus::Failed
                | AllocationStatus::TimedOut
                | AllocationStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AllocationRequest {
    pub test_id: TestId,
    pub plan_id: PlanId,
    pub requirements: HardwareRequirements,
    pub priority: u8,
    pub submitted_at: DateTime<Utc>,
    /// Deterministic tiebreaker after `(priority, submitted_at)` (P2).
    pub insertion_seq: u64,
    pub status: AllocationStatus,
    /// 1 for the first attempt, 2 for the single env-failure retry, etc.
    pub attempt: u32,
}

/// Monotonic sequence generator for `insertion_seq`.
#[derive(Debug, Default)]
pub struct InsertionSeq(AtomicU64);

impl InsertionSeq {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst)
    }
}

/// The backend substrate an [`Environment`] runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentType {
    Container,
    QemuX86,
    QemuArm,
    Physical,
    Process,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub enum EnvironmentStatus {
    Provisioning,
    Ready,
    Allocated,
    Busy,
    Cleanup,
    Maintenance,
    Error,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum EnvironmentHealth {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Capacity {
    pub memory_mb: u64,
    pub cpu: u32,
    pub features: BTreeSet<String>,
}

/// Opaque, physical-board-specific connection details. Not interpreted by
/// the Resource Manager beyond being passed through to the Runner.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct EnvironmentMetadata {
    pub ip: Option<String>,
    pub ssh_key_path: Option<String>,
    pub power_control_command: Option<String>,
    pub serial_console: Option<String>,
}

/// An isolated execution substrate, owned exclusively by the Resource
/// Manager.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Environment {
    pub env_id: EnvId,
    pub env_type: EnvironmentType,
    pub architecture: Architecture,
    pub capacity: Capacity,
    pub status: EnvironmentStatus,
    pub health: EnvironmentHealth,
    pub assigned_test: Option<TestId>,
    pub metadata: EnvironmentMetadata,
    /// Consecutive reset failures; drives the quarantine threshold.
    pub consecutive_reset_failures: u32,
    /// Wall-clock time this environment last became `Ready` and idle,
    /// used for idle reclamation (`env_idle_reclaim_seconds`).
    pub ready_since: Option<DateTime<Utc>>,
}

impl Environment {
    /// Invariant: `status = BUSY` if and only if `assigned_test` is set.
    pub fn check_busy_invariant(&self) -> bool {
        (self.status == EnvironmentStatus::Busy) == self.assigned_test.is_some()
    }
}

/// Why a terminal, non-success `TestResult` ended the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    KernelPanic,
    EnvFailure,
    Unsatisfiable,
}

/// A reference to one captured artifact blob.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ArtifactRef {
    pub name: String,
    /// Content hash (`sha256:...`) or a URI into the persistence store.
    pub content_hash_or_uri: String,
}

/// An immutable collection of named blobs captured for one test run.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ArtifactBundle {
    pub artifacts: Vec<ArtifactRef>,
}

/// Identity `(test_id, attempt)`; written exactly once per attempt (P9).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TestResult {
    pub test_id: TestId,
    pub attempt: u32,
    pub status: AllocationStatus,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub artifacts: ArtifactBundle,
    pub failure_class: Option<FailureClass>,
    pub env_id: EnvId,
}

impl TestResult {
    /// P6: every terminal result names status/started/ended, and carries
    /// stdout/stderr/exit_code when the status calls for them.
    pub fn is_complete(&self) -> bool {
        if !self.status.is_terminal() {
            return false;
        }
        match self.status {
            AllocationStatus::Completed | AllocationStatus::Failed | AllocationStatus::TimedOut => {
                self.exit_code.is_some() || self.failure_class.is_some()
            }
            _ => true,
        }
    }
}

/// Read model exposed by the Status Tracker.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusSnapshot {
    pub active_count: i64,
    pub queued_count: i64,
    pub completed_count: i64,
    pub failed_count: i64,
    pub cancelled_count: i64,
    pub timed_out_count: i64,
    pub per_test_status: HashMap<TestId, AllocationStatus>,
}

/// Operational state reported by `Orchestrator::health`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationalState {
    /// Accepting submissions and dispatching normally.
    Running,
    /// Durable writes are failing above the configured threshold; existing
    /// work keeps draining but `submit_plan` rejects new plans.
    Degraded,
    /// Shutdown has been requested.
    Stopped,
}

/// Environment counts by status, part of the `health()` summary.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EnvironmentPoolSummary {
    pub total: usize,
    pub ready: usize,
    pub busy: usize,
    pub provisioning: usize,
    pub cleanup: usize,
    /// Environments parked in `Maintenance` after repeated reset failures.
    pub quarantined: usize,
    /// Environments in `Error` or `Offline`.
    pub unavailable: usize,
}

/// Point-in-time health report: operational state plus an environment-pool
/// summary, returned by `Orchestrator::health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub state: OperationalState,
    pub persistence_error_count: u64,
    pub environments: EnvironmentPoolSummary,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insertion_seq_is_monotonic_and_unique() {
        let seq = InsertionSeq::new();
        let a = seq.next();
        let b = seq.next();
        let c = seq.next();
        assert!(a < b && b < c);
    }

    #[test]
    fn busy_invariant_holds_for_consistent_state() {
        let env = Environment {
            env_id: "e1".into(),
            env_type: EnvironmentType::Container,
            architecture: Architecture::X86_64,
            capacity: Capacity {
                memory_mb: 1024,
                cpu: 2,
                features: BTreeSet::new(),
            },
            status: EnvironmentStatus::Busy,
            health: EnvironmentHealth::Healthy,
            assigned_test: Some("t1".into()),
            metadata: EnvironmentMetadata::default(),
            consecutive_reset_failures: 0,
            ready_since: None,
        };
        assert!(env.check_busy_invariant());
    }

    #[test]
    fn terminal_status_never_regresses_is_enforced_by_caller() {
        assert!(AllocationStatus::Completed.is_terminal());
        assert!(!AllocationStatus::Running.is_terminal());
    }

    #[test]
    fn plan_validation_rejects_bad_priority() {
        let plan = ExecutionPlan {
            plan_id: "p1".into(),
            tests: vec![],
            priority: 11,
            submitted_at: Utc::now(),
        };
        assert!(plan.validate().is_err());
    }
}
