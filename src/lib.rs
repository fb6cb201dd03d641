//! Tryjob Reconciler - test retry and result reconciliation for try jobs
//!
//! Given the test suites of a builder and a change under test, the
//! reconciler runs every suite with the change applied, retries the shards
//! that failed, reruns what still fails without the change, and decides
//! which failures the change is to blame for.
//!
//! # Architecture
//!
//! This crate follows Hexagonal Architecture principles:
//!
//! - **Domain Layer** (`domain`): result data model, configuration and the
//!   ports to external services
//! - **Service Layer** (`services`): test runs, venue groups, the retry
//!   engine, flake classification and the top-level reconciler
//! - **Adapters** (`adapters`): HTTP clients for the flakiness services and
//!   a scripted world for scenarios and tests
//! - **Infrastructure Layer** (`infrastructure`): configuration and logging
//! - **CLI Layer** (`cli`): command-line interface
//!
//! # Example
//!
//! ```ignore
//! use tryjob_reconciler::adapters::scripted::Scenario;
//! use tryjob_reconciler::services::TryjobReconciler;
//!
//! let scenario = Scenario::load(path)?;
//! let world = scenario.world().await;
//! let ctx = world.context(scenario.identity.clone(), config);
//! let builder_config = BuilderConfig::from_specs(&scenario.builders)?;
//! let report = TryjobReconciler::new(ctx, builder_config)
//!     .run_tests_with_and_without_changes(scenario.specs())
//!     .await?;
//! ```

pub mod adapters;
pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod services;

// Re-export commonly used types for convenience
pub use domain::models::{
    BuildStatus, BuilderConfig, BuilderSpec, Config, Phase, RawResult, SuiteResult, TestSpec,
    TryjobFlags,
};
pub use domain::{DomainError, DomainResult, InconsistentConfigError};
pub use infrastructure::config::{ConfigError, ConfigLoader};
pub use services::{BuildContext, ReconciliationReport, TestRun, TryjobReconciler};
