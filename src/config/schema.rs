//! Configuration schema for the orchestrator.
//!
//! A TOML-deserializable tree of plain structs with
//! `#[serde(default = "...")]` defaults, plus a tagged enum for the one
//! place the schema is polymorphic (environment backends).
//!
//! ```text
//! Config (root)
//! ├── OrchestratorConfig   - scheduling/timeout/persistence knobs
//! ├── environments         - Vec<EnvironmentConfig>, tagged enum per backend
//! │   ├── Container
//! │   ├── Vm
//! │   ├── Physical
//! │   └── Process
//! └── ReportConfig         - output directory + JUnit settings
//! ```

use std::collections::BTreeSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::model::{Architecture, EnvironmentType};

/// Root configuration structure for the orchestrator.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Core scheduling, timeout, and persistence settings.
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    /// The configured environment pool. Each entry describes one or more
    /// identical environments to provision at startup.
    pub environments: Vec<EnvironmentConfig>,

    /// Reporting settings (optional, has defaults).
    #[serde(default)]
    pub report: ReportConfig,
}

/// Core orchestrator settings — the externally recognized configuration
/// surface.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OrchestratorConfig {
    /// Hard cap on concurrent runs, regardless of environment count.
    ///
    /// `None` (default) means the cap is the environment-pool size.
    #[serde(default)]
    pub max_concurrent_runs: Option<usize>,

    /// Timeout applied when a test omits `timeout_ms`.
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,

    /// Delay between the graceful-stop signal and forced kill.
    #[serde(default = "default_timeout_grace_ms")]
    pub timeout_grace_ms: u64,

    /// Maximum latency between submission and dispatch when the wake-up
    /// signal is lost; bounds the Queue Monitor's poll interval.
    #[serde(default = "default_queue_poll_interval_ms")]
    pub queue_poll_interval_ms: u64,

    /// Threshold beyond which idle billable (VM/physical) environments are
    /// powered down. Containers are never idle-reclaimed.
    #[serde(default = "default_env_idle_reclaim_seconds")]
    pub env_idle_reclaim_seconds: u64,

    /// Consecutive reset failures that quarantine an environment.
    #[serde(default = "default_env_reset_failure_threshold")]
    pub env_reset_failure_threshold: u32,

    /// Whether a single environment-failure retry is attempted.
    #[serde(default = "default_retry_on_env_failure")]
    pub retry_on_env_failure: bool,

    /// Directory for the append-only event log and terminal-result store.
    #[serde(default = "default_persistence_root")]
    pub persistence_root: PathBuf,

    /// Consecutive durable-write failures after which the orchestrator
    /// enters degraded mode and starts rejecting new submissions.
    #[serde(default = "default_degraded_error_threshold")]
    pub degraded_error_threshold: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_runs: None,
            default_timeout_ms: default_timeout_ms(),
            timeout_grace_ms: default_timeout_grace_ms(),
            queue_poll_interval_ms: default_queue_poll_interval_ms(),
            env_idle_reclaim_seconds: default_env_idle_reclaim_seconds(),
            env_reset_failure_threshold: default_env_reset_failure_threshold(),
            retry_on_env_failure: default_retry_on_env_failure(),
            persistence_root: default_persistence_root(),
            degraded_error_threshold: default_degraded_error_threshold(),
        }
    }
}

fn default_timeout_ms() -> u64 {
    900_000 // 15 minutes
}

fn default_timeout_grace_ms() -> u64 {
    5_000
}

fn default_queue_poll_interval_ms() -> u64 {
    2_000
}

fn default_env_idle_reclaim_seconds() -> u64 {
    300
}

fn default_env_reset_failure_threshold() -> u32 {
    2
}

fn default_retry_on_env_failure() -> bool {
    true
}

fn default_persistence_root() -> PathBuf {
    PathBuf::from(".marshal")
}

fn default_degraded_error_threshold() -> u64 {
    5
}

/// Capacity advertised by an environment, used for requirement matching.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CapacityConfig {
    pub memory_mb: u64,
    pub cpu: u32,
    #[serde(default)]
    pub features: BTreeSet<String>,
}

/// One configured environment (or identical group of environments).
///
/// The tag selects the backend; each variant carries the settings its
/// Runner needs to prepare/execute/reset/collect_artifacts (spec §4.4, §9).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EnvironmentConfig {
    /// Fresh, network-restricted container per attempt (`bollard`-backed).
    Container(ContainerEnvironmentConfig),
    /// Boot-or-revert-snapshot VM image.
    Vm(VmEnvironmentConfig),
    /// Physical board, reachable over SSH and/or serial console.
    Physical(PhysicalEnvironmentConfig),
    /// Local process-group execution, no isolation.
    Process(ProcessEnvironmentConfig),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ContainerEnvironmentConfig {
    /// Prefix for generated `env_id`s; one environment per `count`.
    pub id_prefix: String,
    #[serde(default = "default_count")]
    pub count: usize,
    pub architecture: Architecture,
    pub capacity: CapacityConfig,
    /// Container image reference (e.g. `python:3.11-slim`).
    pub image: String,
    /// Network mode; `"none"` enforces the network-restriction guarantee.
    #[serde(default = "default_network_mode")]
    pub network_mode: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VmEnvironmentConfig {
    pub id_prefix: String,
    #[serde(default = "default_count")]
    pub count: usize,
    pub architecture: Architecture,
    pub capacity: CapacityConfig,
    /// Base image or snapshot name to boot/revert.
    pub image: String,
    /// Driver command used to boot/revert/destroy the VM; see `runner::vm`.
    pub driver_command: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PhysicalEnvironmentConfig {
    pub id_prefix: String,
    pub architecture: Architecture,
    pub capacity: CapacityConfig,
    /// SSH connection target, e.g. `user@10.0.0.5`.
    pub ssh_target: Option<String>,
    pub ssh_key_path: Option<PathBuf>,
    /// Serial console endpoint (e.g. a telnet `host:port`), used when the
    /// network transport is unavailable or for early-boot panic capture.
    pub serial_console: Option<String>,
    /// Power-control command template; `{action}` is one of on/off/cycle.
    pub power_control_command: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProcessEnvironmentConfig {
    pub id_prefix: String,
    #[serde(default = "default_count")]
    pub count: usize,
    pub architecture: Architecture,
    pub capacity: CapacityConfig,
    pub working_dir: Option<PathBuf>,
    #[serde(default = "default_shell")]
    pub shell: String,
}

fn default_count() -> usize {
    1
}

fn default_network_mode() -> String {
    "none".to_string()
}

fn default_shell() -> String {
    "/bin/sh".to_string()
}

impl EnvironmentConfig {
    /// The backend type this configuration provisions (spec §3). Distinct
    /// from [`crate::model::IsolationLevel`], which is what a *test*
    /// requires; the Resource Manager's `compatible()` check maps between
    /// the two (container/VM/physical environments can all satisfy a
    /// process-isolation request, but not vice versa).
    pub fn env_type(&self) -> EnvironmentType {
        match self {
            EnvironmentConfig::Container(_) => EnvironmentType::Container,
            EnvironmentConfig::Vm(c) => {
                if c.architecture == Architecture::Arm64 {
                    EnvironmentType::QemuArm
                } else {
                    EnvironmentType::QemuX86
                }
            }
            EnvironmentConfig::Physical(_) => EnvironmentType::Physical,
            EnvironmentConfig::Process(_) => EnvironmentType::Process,
        }
    }

    pub fn id_prefix(&self) -> &str {
        match self {
            EnvironmentConfig::Container(c) => &c.id_prefix,
            EnvironmentConfig::Vm(c) => &c.id_prefix,
            EnvironmentConfig::Physical(c) => &c.id_prefix,
            EnvironmentConfig::Process(c) => &c.id_prefix,
        }
    }

    pub fn count(&self) -> usize {
        match self {
            EnvironmentConfig::Container(c) => c.count,
            EnvironmentConfig::Vm(c) => c.count,
            EnvironmentConfig::Physical(_) => 1,
            EnvironmentConfig::Process(c) => c.count,
        }
    }

    pub fn architecture(&self) -> Architecture {
        match self {
            EnvironmentConfig::Container(c) => c.architecture,
            EnvironmentConfig::Vm(c) => c.architecture,
            EnvironmentConfig::Physical(c) => c.architecture,
            EnvironmentConfig::Process(c) => c.architecture,
        }
    }

    pub fn capacity(&self) -> CapacityConfig {
        match self {
            EnvironmentConfig::Container(c) => c.capacity.clone(),
            EnvironmentConfig::Vm(c) => c.capacity.clone(),
            EnvironmentConfig::Physical(c) => c.capacity.clone(),
            EnvironmentConfig::Process(c) => c.capacity.clone(),
        }
    }
}

/// Reporting settings: where JUnit/artifact output lands.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReportConfig {
    #[serde(default = "default_report_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_junit")]
    pub junit: bool,
    #[serde(default = "default_junit_file")]
    pub junit_file: String,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            output_dir: default_report_dir(),
            junit: default_junit(),
            junit_file: default_junit_file(),
        }
    }
}

fn default_report_dir() -> PathBuf {
    PathBuf::from("test-results")
}

fn default_junit() -> bool {
    true
}

fn default_junit_file() -> String {
    "junit.xml".to_string()
}
