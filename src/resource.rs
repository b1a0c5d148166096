//! Resource Manager.
//!
//! A flat environment table (`Vec<Environment>`) wrapped in
//! requirement-matching, health-tracking allocation logic. The pool
//! remains a single-writer structure behind one `Mutex`: all mutations
//! serialize through its internal lock.

use std::collections::HashSet;

use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use tracing::{info, warn};

use crate::model::{
    Capacity, EnvId, Environment, EnvironmentHealth, EnvironmentStatus, HardwareRequirements,
};
use crate::queue::RequirementShape;

#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("no environment currently ready matches the request")]
    UnsatisfiableNow,
    #[error("no environment in the configured pool could ever satisfy this request")]
    NoMatchEver,
    #[error("environment {0} failed to provision")]
    ProvisionFailed(EnvId),
    #[error("environment {0} failed to reset")]
    ResetFailed(EnvId),
    #[error("environment {0} failed a health check")]
    HealthCheckFailed(EnvId),
}

pub type ResourceResult<T> = Result<T, ResourceError>;

/// A move-only capability loaned to exactly one Runner (§3 "Ownership").
/// Runners never retain environment references after release; the handle
/// only ever exposes the `env_id` it refers to.
#[derive(Debug, Clone)]
pub struct AllocationHandle {
    pub env_id: EnvId,
}

fn compatible(requirements: &HardwareRequirements, env: &Environment) -> bool {
    use crate::model::{EnvironmentType, IsolationLevel};
    let isolation_ok = match (requirements.isolation_level, env.env_type) {
        (IsolationLevel::Container, EnvironmentType::Container) => true,
        (IsolationLevel::Vm, EnvironmentType::QemuX86 | EnvironmentType::QemuArm) => true,
        (IsolationLevel::Process, EnvironmentType::Process) => true,
        // A more-isolated backend can always satisfy a looser requirement:
        // a container or VM has at least as much isolation as bare process
        // execution, and physical hardware has at least as much isolation
        // as a container (§4.3 best-fit matching).
        (IsolationLevel::Process, EnvironmentType::Container | EnvironmentType::Physical) => true,
        (IsolationLevel::Container, EnvironmentType::Physical) => true,
        _ => false,
    };
    env.architecture == requirements.architecture
        && env.capacity.memory_mb >= requirements.min_memory_mb
        && env.capacity.cpu >= requirements.min_cpu
        && requirements.required_features.is_subset(&env.capacity.features)
        && isolation_ok
}

fn surplus(capacity: &Capacity, requirements: &HardwareRequirements) -> u64 {
    (capacity.memory_mb.saturating_sub(requirements.min_memory_mb))
        + (capacity.cpu as u64).saturating_sub(requirements.min_cpu as u64)
}

/// Owns the environment pool table and the requirement-matching function.
pub struct ResourceManager {
    environments: Mutex<Vec<Environment>>,
    reset_failure_threshold: u32,
    idle_reclaim_seconds: u64,
    /// Signals the dispatcher that an environment just became allocatable.
    pub availability: Notify,
}

impl ResourceManager {
    pub fn new(environments: Vec<Environment>, reset_failure_threshold: u32, idle_reclaim_seconds: u64) -> Self {
        Self {
            environments: Mutex::new(environments),
            reset_failure_threshold,
            idle_reclaim_seconds,
            availability: Notify::new(),
        }
    }

    /// Candidate filter + best-fit selection. Distinguishes
    /// `UnsatisfiableNow` (no READY candidate right now, but some
    /// environment in the pool could eventually match) from `NoMatchEver`
    /// (no environment in the *entire configured pool* could ever match,
    /// regardless of state): `NoMatchEver` is actively detected rather than
    /// left to surface only as an indefinite `UnsatisfiableNow`.
    pub async fn try_allocate(&self, requirements: &HardwareRequirements) -> ResourceResult<AllocationHandle> {
        let mut envs = self.environments.lock().await;

        if !envs.iter().any(|e| compatible(requirements, e)) {
            return Err(ResourceError::NoMatchEver);
        }

        let best = envs
            .iter_mut()
            .filter(|e| e.status == EnvironmentStatus::Ready && e.health == EnvironmentHealth::Healthy)
            .filter(|e| compatible(requirements, e))
            .min_by(|a, b| {
                surplus(&a.capacity, requirements)
                    .cmp(&surplus(&b.capacity, requirements))
                    .then_with(|| a.env_id.cmp(&b.env_id))
            });

        match best {
            Some(env) => {
                env.status = EnvironmentStatus::Allocated;
                env.ready_since = None;
                Ok(AllocationHandle { env_id: env.env_id.clone() })
            }
            None => Err(ResourceError::UnsatisfiableNow),
        }
    }

    /// Transitions `Allocated -> Busy` once the runner has actually
    /// started, and `assigned_test` records the invariant from §3.
    pub async fn mark_busy(&self, handle: &AllocationHandle, test_id: &str) {
        let mut envs = self.environments.lock().await;
        if let Some(env) = envs.iter_mut().find(|e| e.env_id == handle.env_id) {
            env.status = EnvironmentStatus::Busy;
            env.assigned_test = Some(test_id.to_string());
        }
    }

    /// Reverses an allocation that failed before the runner started
    /// (§4.6: "the allocation is reversed (env released back to READY)").
    pub async fn revert_allocation(&self, handle: &AllocationHandle) {
        let mut envs = self.environments.lock().await;
        if let Some(env) = envs.iter_mut().find(|e| e.env_id == handle.env_id) {
            env.status = EnvironmentStatus::Ready;
            env.ready_since = Some(Utc::now());
        }
        self.availability.notify_waiters();
    }

    /// Returns the set of requirement shapes any currently-READY,
    /// healthy environment could satisfy, used by the dispatcher for
    /// head-of-line avoidance.
    pub async fn available_shapes(&self) -> HashSet<RequirementShape> {
        use crate::model::IsolationLevel;
        let envs = self.environments.lock().await;
        let mut shapes = HashSet::new();
        for env in envs
            .iter()
            .filter(|e| e.status == EnvironmentStatus::Ready && e.health == EnvironmentHealth::Healthy)
        {
            for isolation_level in [IsolationLevel::Process, IsolationLevel::Container, IsolationLevel::Vm] {
                let probe = HardwareRequirements {
                    architecture: env.architecture,
                    min_memory_mb: 0,
                    min_cpu: 0,
                    required_features: Default::default(),
                    isolation_level,
                };
                if compatible(&probe, env) {
                    shapes.insert(RequirementShape {
                        architecture: env.architecture,
                        isolation_level,
                    });
                }
            }
        }
        shapes
    }

    /// Whether `requirements` could ever be satisfied by the static pool,
    /// independent of current READY/BUSY state.
    pub async fn could_ever_satisfy(&self, requirements: &HardwareRequirements) -> bool {
        self.environments
            .lock()
            .await
            .iter()
            .any(|e| compatible(requirements, e))
    }

    /// Releases a handle after an attempt completes: transitions to
    /// `CLEANUP`, asks the caller-supplied `reset` closure to purge state,
    /// and on success returns the environment to `READY`. On repeated
    /// reset failure, marks `UNHEALTHY` and quarantines.
    pub async fn release<F, Fut>(&self, handle: &AllocationHandle, reset: F) -> ResourceResult<()>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        {
            let mut envs = self.environments.lock().await;
            if let Some(env) = envs.iter_mut().find(|e| e.env_id == handle.env_id) {
                env.status = EnvironmentStatus::Cleanup;
                env.assigned_test = None;
            }
        }

        let reset_ok = reset().await;

        let mut envs = self.environments.lock().await;
        let Some(env) = envs.iter_mut().find(|e| e.env_id == handle.env_id) else {
            return Ok(());
        };
        if reset_ok {
            env.consecutive_reset_failures = 0;
            env.status = EnvironmentStatus::Ready;
            env.health = EnvironmentHealth::Healthy;
            env.ready_since = Some(Utc::now());
            drop(envs);
            self.availability.notify_waiters();
            Ok(())
        } else {
            env.consecutive_reset_failures += 1;
            if env.consecutive_reset_failures >= self.reset_failure_threshold {
                env.status = EnvironmentStatus::Error;
                env.health = EnvironmentHealth::Unhealthy;
                warn!("environment {} quarantined after repeated reset failures", env.env_id);
                Err(ResourceError::ResetFailed(env.env_id.clone()))
            } else {
                env.health = EnvironmentHealth::Degraded;
                env.status = EnvironmentStatus::Ready;
                env.ready_since = Some(Utc::now());
                Ok(())
            }
        }
    }

    /// Quarantines an environment outright, e.g. after a kernel panic or a
    /// transport failure attributed to `failure_class = env_failure`.
    pub async fn quarantine(&self, env_id: &str) {
        let mut envs = self.environments.lock().await;
        if let Some(env) = envs.iter_mut().find(|e| e.env_id == env_id) {
            env.status = EnvironmentStatus::Maintenance;
            env.health = EnvironmentHealth::Unhealthy;
            env.assigned_test = None;
        }
        info!("environment {env_id} quarantined for inspection");
    }

    /// Externally-invoked by a health-checker (§4.3 `report_health`).
    pub async fn report_health(&self, env_id: &str, health: EnvironmentHealth) {
        let mut envs = self.environments.lock().await;
        if let Some(env) = envs.iter_mut().find(|e| e.env_id == env_id) {
            env.health = health;
            if health == EnvironmentHealth::Unhealthy {
                env.status = EnvironmentStatus::Error;
            }
        }
    }

    /// Idle reclamation: powers down billable environments that
    /// have sat READY, untouched, past `idle_reclaim_seconds`. Containers
    /// are never reclaimed — only VMs and physical boards carry real
    /// per-hour cost.
    pub async fn reclaim_idle(&self) -> Vec<EnvId> {
        use crate::model::EnvironmentType;
        let now = Utc::now();
        let mut envs = self.environments.lock().await;
        let mut reclaimed = Vec::new();
        for env in envs.iter_mut() {
            if env.env_type == EnvironmentType::Container {
                continue;
            }
            if env.status != EnvironmentStatus::Ready {
                continue;
            }
            let Some(ready_since) = env.ready_since else { continue };
            if (now - ready_since).num_seconds() as u64 >= self.idle_reclaim_seconds {
                env.status = EnvironmentStatus::Offline;
                reclaimed.push(env.env_id.clone());
            }
        }
        reclaimed
    }

    pub async fn replace_with_provisioning(&self, env_id: &str) {
        let mut envs = self.environments.lock().await;
        if let Some(env) = envs.iter_mut().find(|e| e.env_id == env_id) {
            env.status = EnvironmentStatus::Provisioning;
            env.health = EnvironmentHealth::Unknown;
            env.consecutive_reset_failures = 0;
        }
    }

    /// Marks every environment PROVISIONING, forcing re-validation before
    /// the scheduler accepts allocations (recovery step 3, §4.6).
    pub async fn mark_all_provisioning(&self) {
        let mut envs = self.environments.lock().await;
        for env in envs.iter_mut() {
            env.status = EnvironmentStatus::Provisioning;
            env.assigned_test = None;
        }
    }

    pub async fn mark_ready(&self, env_id: &str) {
        let mut envs = self.environments.lock().await;
        if let Some(env) = envs.iter_mut().find(|e| e.env_id == env_id) {
            env.status = EnvironmentStatus::Ready;
            env.health = EnvironmentHealth::Healthy;
            env.ready_since = Some(Utc::now());
        }
        self.availability.notify_waiters();
    }

    pub async fn snapshot(&self) -> Vec<Environment> {
        self.environments.lock().await.clone()
    }

    /// Fetches one environment's current state, used by the dispatcher to
    /// hand a `Runner` the full `Environment` a bare `AllocationHandle`
    /// refers to (§3 "Ownership": handles only ever expose `env_id`).
    pub async fn get(&self, env_id: &str) -> Option<Environment> {
        self.environments.lock().await.iter().find(|e| e.env_id == env_id).cloned()
    }

    /// Total number of environments in the configured pool, used to size
    /// the dispatcher's default concurrency cap when `max_concurrent_runs`
    /// is unset (§6: "Default: environment-pool size").
    pub async fn pool_size(&self) -> usize {
        self.environments.lock().await.len()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Architecture, EnvironmentMetadata, EnvironmentType, IsolationLevel};
    use std::collections::BTreeSet;

    fn env(id: &str, status: EnvironmentStatus, memory_mb: u64, cpu: u32) -> Environment {
        Environment {
            env_id: id.to_string(),
            env_type: EnvironmentType::Container,
            architecture: Architecture::X86_64,
            capacity: Capacity {
                memory_mb,
                cpu,
                features: BTreeSet::new(),
            },
            status,
            health: EnvironmentHealth::Healthy,
            assigned_test: None,
            metadata: EnvironmentMetadata::default(),
            consecutive_reset_failures: 0,
            ready_since: Some(Utc::now() - chrono::Duration::seconds(1000)),
        }
    }

    fn req(memory_mb: u64, cpu: u32) -> HardwareRequirements {
        HardwareRequirements {
            architecture: Architecture::X86_64,
            min_memory_mb: memory_mb,
            min_cpu: cpu,
            required_features: BTreeSet::new(),
            isolation_level: IsolationLevel::Container,
        }
    }

    #[tokio::test]
    async fn best_fit_picks_smallest_surplus() {
        let rm = ResourceManager::new(
            vec![
                env("big", EnvironmentStatus::Ready, 8192, 8),
                env("small", EnvironmentStatus::Ready, 1024, 1),
            ],
            2,
            300,
        );
        let handle = rm.try_allocate(&req(512, 1)).await.unwrap();
        assert_eq!(handle.env_id, "small");
    }

    #[tokio::test]
    async fn no_ready_environment_is_unsatisfiable_now() {
        let rm = ResourceManager::new(vec![env("e1", EnvironmentStatus::Busy, 1024, 1)], 2, 300);
        assert!(matches!(
            rm.try_allocate(&req(512, 1)).await,
            Err(ResourceError::UnsatisfiableNow)
        ));
    }

    #[tokio::test]
    async fn impossible_requirement_is_no_match_ever() {
        let rm = ResourceManager::new(vec![env("e1", EnvironmentStatus::Ready, 1024, 1)], 2, 300);
        let req = HardwareRequirements {
            architecture: Architecture::Riscv64,
            ..req(0, 0)
        };
        assert!(matches!(rm.try_allocate(&req).await, Err(ResourceError::NoMatchEver)));
    }

    #[tokio::test]
    async fn repeated_reset_failure_quarantines_environment() {
        let rm = ResourceManager::new(vec![env("e1", EnvironmentStatus::Ready, 1024, 1)], 2, 300);
        let handle = rm.try_allocate(&req(512, 1)).await.unwrap();
        rm.mark_busy(&handle, "t1").await;
        assert!(rm.release(&handle, || async { false }).await.is_ok());
        let result = rm.release(&handle, || async { false }).await;
        assert!(matches!(result, Err(ResourceError::ResetFailed(_))));
        let snap = rm.snapshot().await;
        assert_eq!(snap[0].status, EnvironmentStatus::Error);
    }

    #[tokio::test]
    async fn successful_reset_returns_environment_to_ready() {
        let rm = ResourceManager::new(vec![env("e1", EnvironmentStatus::Ready, 1024, 1)], 2, 300);
        let handle = rm.try_allocate(&req(512, 1)).await.unwrap();
        rm.mark_busy(&handle, "t1").await;
        rm.release(&handle, || async { true }).await.unwrap();
        let snap = rm.snapshot().await;
        assert_eq!(snap[0].status, EnvironmentStatus::Ready);
    }

    #[tokio::test]
    async fn quarantined_environment_is_excluded_from_shapes_and_allocation() {
        let rm = ResourceManager::new(vec![env("e1", EnvironmentStatus::Ready, 1024, 1)], 2, 300);
        let handle = rm.try_allocate(&req(512, 1)).await.unwrap();
        rm.mark_busy(&handle, "t1").await;

        rm.quarantine(&handle.env_id).await;

        let snap = rm.snapshot().await;
        assert_eq!(snap[0].status, EnvironmentStatus::Maintenance);
        assert_eq!(snap[0].health, EnvironmentHealth::Unhealthy);

        // A quarantined environment must not show up as an available
        // shape (dispatcher head-of-line check) nor be allocatable again,
        // even though it's the only environment in the pool.
        assert!(rm.available_shapes().await.is_empty());
        assert!(matches!(
            rm.try_allocate(&req(512, 1)).await,
            Err(ResourceError::UnsatisfiableNow)
        ));
    }

    #[tokio::test]
    async fn idle_vm_is_reclaimed_but_container_is_not() {
        let mut container = env("c1", EnvironmentStatus::Ready, 1024, 1);
        container.env_type = EnvironmentType::Container;
        let mut vm = env("v1", EnvironmentStatus::Ready, 1024, 1);
        vm.env_type = EnvironmentType::QemuX86;
        let rm = ResourceManager::new(vec![container, vm], 2, 300);
        let reclaimed = rm.reclaim_idle().await;
        assert_eq!(reclaimed, vec!["v1".to_string()]);
    }
}
