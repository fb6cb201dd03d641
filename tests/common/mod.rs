//! Common test utilities for integration tests
//!
//! Scenario fixtures and a one-call reconciliation of a scenario.

#![allow(dead_code)]

use std::path::PathBuf;

use tempfile::TempDir;
use tryjob_reconciler::adapters::scripted::{Scenario, ScriptedWorld};
use tryjob_reconciler::domain::models::{BuilderConfig, Config};
use tryjob_reconciler::services::{ReconciliationReport, TryjobReconciler};

/// Setup test logging
///
/// Initializes tracing subscriber for test output.
/// Call this at the beginning of tests that need logging.
pub fn setup_test_logging() {
    use tracing_subscriber::fmt;

    let _ = fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Write `yaml` to a scenario file in a fresh temporary directory.
pub fn write_scenario(yaml: &str) -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let path = dir.path().join("scenario.yaml");
    std::fs::write(&path, yaml).expect("Failed to write scenario");
    (dir, path)
}

/// Play out a scenario with the default configuration.
pub async fn reconcile(yaml: &str) -> (ScriptedWorld, ReconciliationReport) {
    reconcile_with(yaml, Config::default()).await
}

pub async fn reconcile_with(yaml: &str, config: Config) -> (ScriptedWorld, ReconciliationReport) {
    setup_test_logging();
    let (_dir, path) = write_scenario(yaml);
    let scenario = Scenario::load(&path).expect("Failed to load scenario");
    let world = scenario.world().await;
    let ctx = world
        .context(scenario.identity.clone(), config)
        .with_tryserver(scenario.is_tryserver)
        .with_footers(scenario.footers.clone());
    let builder_config = BuilderConfig::from_specs(&scenario.builders).expect("Invalid builders");

    let report = TryjobReconciler::new(ctx, builder_config)
        .run_tests_with_and_without_changes(scenario.specs())
        .await
        .expect("Reconciliation failed");
    (world, report)
}
