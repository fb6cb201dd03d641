//! Scenario files describing a whole try job for the scripted world.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{PhaseScript, ScriptedWorld};
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{BuilderSpec, KnownFlake, Phase, TestSpec, TestVariantFailureRate};
use crate::services::context::BuildIdentity;

/// A suite together with what it reports in each phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioSuite {
    #[serde(flatten)]
    pub spec: TestSpec,
    #[serde(default)]
    pub phases: BTreeMap<Phase, PhaseScript>,
}

/// A complete try job: who builds, what changed, how every suite behaves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    pub identity: BuildIdentity,
    #[serde(default = "default_tryserver")]
    pub is_tryserver: bool,
    #[serde(default)]
    pub footers: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub affected_files: Vec<String>,
    /// Mirrored builder specs; at least one is required.
    pub builders: Vec<BuilderSpec>,
    #[serde(default)]
    pub suites: Vec<ScenarioSuite>,
    #[serde(default)]
    pub compile_failures: Vec<Phase>,
    #[serde(default = "default_results_enabled")]
    pub results_enabled: bool,
    #[serde(default)]
    pub failure_rates: Vec<TestVariantFailureRate>,
    #[serde(default)]
    pub known_flakes: Vec<KnownFlake>,
}

const fn default_tryserver() -> bool {
    true
}

const fn default_results_enabled() -> bool {
    true
}

impl Scenario {
    /// Load a scenario from a `.json`, `.yaml` or `.yml` file.
    pub fn load(path: &Path) -> DomainResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            DomainError::Precondition(format!("cannot read scenario {}: {e}", path.display()))
        })?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Ok(serde_json::from_str(&content)?),
            _ => Ok(serde_yaml::from_str(&content)?),
        }
    }

    pub fn specs(&self) -> Vec<TestSpec> {
        self.suites.iter().map(|s| s.spec.clone()).collect()
    }

    /// Scripted collaborators playing out this scenario.
    pub async fn world(&self) -> ScriptedWorld {
        let world = ScriptedWorld::default();
        world.checkout.set_affected_files(self.affected_files.clone()).await;
        for phase in &self.compile_failures {
            world.build.fail_compile(*phase).await;
        }
        world.results.set_enabled(self.results_enabled);
        world.flakiness.set_failure_rates(self.failure_rates.clone()).await;
        world.known_flakes.set_flakes(self.known_flakes.clone()).await;
        for suite in &self.suites {
            for (phase, script) in &suite.phases {
                world.script(&suite.spec.name, *phase, script.clone()).await;
            }
        }
        world
    }
}
