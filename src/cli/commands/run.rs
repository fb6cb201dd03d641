//! Reconcile a scripted try job.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;
use tracing::info;

use crate::adapters::http::{FailureRateClient, KnownFlakesClient};
use crate::adapters::scripted::Scenario;
use crate::cli::output::{list_table, output, truncate, CommandOutput};
use crate::domain::models::{BuildStatus, BuilderConfig, Config, RawResult, StepStatus};
use crate::services::context::BuildContext;
use crate::services::reconciliation::{ReconciliationReport, TryjobReconciler};

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Scenario file (.yaml, .yml or .json) describing the try job
    pub scenario: PathBuf,

    /// Include every recorded step in the output
    #[arg(long)]
    pub steps: bool,
}

#[derive(Debug, Serialize)]
pub struct RunOutput {
    pub builder: String,
    #[serde(flatten)]
    pub report: ReconciliationReport,
    #[serde(skip)]
    pub show_steps: bool,
}

impl RunOutput {
    fn flag_names(&self) -> Vec<&'static str> {
        let flags = &self.report.flags;
        [
            (flags.invalid_test_results, "invalid_test_results"),
            (flags.test_failure, "test_failure"),
            (flags.compile_failure, "compile_failure"),
            (flags.do_not_retry, "do_not_retry"),
            (flags.clobber_requested, "clobber_requested"),
        ]
        .into_iter()
        .filter_map(|(set, name)| set.then_some(name))
        .collect()
    }
}

impl CommandOutput for RunOutput {
    fn to_human(&self) -> String {
        let result = &self.report.raw_result;
        let mut lines = vec![format!("{}: {}", self.builder, result.status.as_str())];
        if !result.summary_markdown.is_empty() {
            lines.push(String::new());
            lines.push(result.summary_markdown.clone());
        }

        if !self.report.suites.is_empty() {
            let mut table = list_table(&["suite", "venue", "phases", "failures", "known flaky", "verdict"]);
            for suite in &self.report.suites {
                table.add_row(vec![
                    suite.name.clone(),
                    suite.venue.clone(),
                    suite.phases.join(", "),
                    truncate(&suite.failures.join(", "), 40),
                    suite.known_flaky.len().to_string(),
                    if suite.unrecoverable { "FAILED" } else { "ok" }.to_string(),
                ]);
            }
            lines.push(String::new());
            lines.push(table.to_string());
        }

        let flags = self.flag_names();
        if !flags.is_empty() {
            lines.push(String::new());
            lines.push(format!("Flags: {}", flags.join(", ")));
        }

        if self.show_steps {
            lines.push(String::new());
            for step in &self.report.steps {
                let status = match step.status {
                    StepStatus::Success => "ok",
                    StepStatus::Warning => "warning",
                    StepStatus::Failure => "failure",
                };
                lines.push(format!("[{status}] {}", step.name));
                for line in step.text.lines().filter(|l| !l.is_empty()) {
                    lines.push(format!("    {line}"));
                }
            }
        }
        lines.join("\n")
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

/// Build the context for `scenario`, talking to real flakiness services
/// when they are configured.
async fn build_context(scenario: &Scenario, config: Config) -> Result<BuildContext> {
    let world = scenario.world().await;
    let mut services = world.collaborators();
    if let Some(client) = FailureRateClient::from_config(&config.analysis)? {
        services.flakiness = Some(Arc::new(client));
    }
    if let Some(client) = KnownFlakesClient::from_config(&config.analysis)? {
        services.known_flakes = Some(Arc::new(client));
    }
    Ok(BuildContext::new(scenario.identity.clone(), config, services)
        .with_tryserver(scenario.is_tryserver)
        .with_footers(scenario.footers.clone()))
}

/// Reconcile the scenario and print the verdict.
///
/// Infrastructure failures are reported as an `INFRA_FAILURE` verdict rather
/// than an error.
pub async fn execute(args: RunArgs, config: Config, json_mode: bool) -> Result<BuildStatus> {
    let scenario = Scenario::load(&args.scenario)
        .with_context(|| format!("Failed to load scenario {}", args.scenario.display()))?;
    let builder_config =
        BuilderConfig::from_specs(&scenario.builders).context("Invalid builder configuration")?;
    info!(
        builder = %scenario.identity.builder,
        suites = scenario.suites.len(),
        "reconciling try job"
    );

    let ctx = build_context(&scenario, config).await?;
    let reconciler = TryjobReconciler::new(ctx, builder_config);
    let report = match reconciler.run_tests_with_and_without_changes(scenario.specs()).await {
        Ok(report) => report,
        Err(e) if e.is_infra() => {
            let ctx = reconciler.context();
            ReconciliationReport {
                raw_result: RawResult::infra_failure(e.to_string()),
                flags: ctx.flags().await,
                steps: ctx.steps().await,
                suites: Vec::new(),
                flakiness: None,
            }
        }
        Err(e) => return Err(e).context("Reconciliation failed"),
    };

    let status = report.raw_result.status;
    output(
        &RunOutput {
            builder: scenario.identity.builder.clone(),
            report,
            show_steps: args.steps,
        },
        json_mode,
    );
    Ok(status)
}
