//! # marshal
//!
//! A concurrent test execution orchestrator: accepts submitted test plans,
//! schedules them by priority against a pool of isolated execution
//! environments (containers, VMs, physical boards, or bare processes),
//! runs each test under a timeout, and survives a restart without losing
//! or silently duplicating work.
//!
//! ## Architecture
//!
//! ### Data model ([`model`])
//!
//! The entities every other module operates on: [`model::TestCase`] and
//! [`model::ExecutionPlan`] (what gets submitted), [`model::Environment`]
//! (what it runs on), and [`model::TestResult`] (what comes back).
//!
//! ### Priority Queue & Queue Monitor ([`queue`])
//!
//! [`queue::PriorityQueue`] orders pending work by `(priority, submitted_at,
//! insertion_seq)`; [`queue::QueueMonitor`] expands accepted plans into
//! queued requests.
//!
//! ### Resource Manager ([`resource`])
//!
//! [`resource::ResourceManager`] owns the environment pool table: best-fit
//! allocation, release-with-reset, health tracking, and idle reclamation.
//!
//! ### Runner Registry ([`runner`])
//!
//! One [`runner::Runner`] implementation per backend
//! ([`runner::container::ContainerRunner`], [`runner::vm::VmRunner`],
//! [`runner::physical::PhysicalRunner`], [`runner::process::ProcessRunner`]),
//! dispatched at runtime by [`runner::RunnerRegistry`].
//!
//! ### Status Tracker ([`status`]) and Persistence Store ([`persistence`])
//!
//! [`status::StatusTracker`] is the live read model; [`persistence::Persistence`]
//! is the append-only event log plus compacted result snapshot that makes
//! recovery possible.
//!
//! ### Orchestrator ([`orchestrator`])
//!
//! [`orchestrator::Orchestrator`] is the entry point: it wires every
//! collaborator above together, runs [`orchestrator::recovery::RecoveryCoordinator`]
//! at startup, and exposes the Submission and Result Retrieval APIs.
//!
//! ### Reporting ([`report`])
//!
//! Console progress output and JUnit XML export.
//!
//! ## Quick Start
//!
//! ```no_run
//! use marshal::config::load_config;
//! use marshal::orchestrator::Orchestrator;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("marshal.toml"))?;
//!     let orchestrator = Orchestrator::new(config).await?;
//!     let _handles = orchestrator.spawn_background_loops();
//!     tokio::signal::ctrl_c().await?;
//!     orchestrator.request_shutdown();
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod model;
pub mod orchestrator;
pub mod panic_detect;
pub mod persistence;
pub mod queue;
pub mod report;
pub mod resource;
pub mod runner;
pub mod status;

pub use config::{Config, load_config};
pub use model::{
    ArtifactBundle, EnvId, Environment, ExecutionPlan, HealthReport, OperationalState, PlanId, TestCase, TestId,
    TestResult,
};
pub use orchestrator::Orchestrator;
