//! In-memory collaborators driven by per-suite scripts.
//!
//! A [`ScriptedWorld`] answers every port from a shared [`ScriptBook`]: what
//! each suite reports in each phase, which compiles fail, and what the
//! flakiness services know. It backs the integration tests and the `run`
//! command's scenario files.

mod ports;
mod scenario;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::domain::models::{Config, Phase, RawTestResult, Tag, TestStatus};
use crate::services::context::{BuildContext, BuildIdentity, Collaborators};

pub use ports::{
    ScriptedBuild, ScriptedCheckout, ScriptedFlakiness, ScriptedKnownFlakes, ScriptedLab,
    ScriptedLocal, ScriptedRemote, ScriptedResults,
};
pub use scenario::{Scenario, ScenarioSuite};

/// One test's runs as scripted for a phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptedTest {
    pub name: String,
    #[serde(default = "default_statuses")]
    pub statuses: Vec<TestStatus>,
    #[serde(default)]
    pub expected: bool,
}

fn default_statuses() -> Vec<TestStatus> {
    vec![TestStatus::Pass]
}

/// What a suite reports in one phase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseScript {
    /// Remote shards whose harness exits nonzero.
    #[serde(default)]
    pub failed_shards: Vec<u32>,
    /// Exit code of a local run; nonzero also fails a lab run.
    #[serde(default)]
    pub exit_code: i32,
    #[serde(default)]
    pub tests: Vec<ScriptedTest>,
    /// The lab forgets to answer for this suite.
    #[serde(default)]
    pub no_lab_response: bool,
}

impl PhaseScript {
    /// Every test passes as expected.
    pub fn passing(tests: &[&str]) -> Self {
        Self {
            tests: tests
                .iter()
                .map(|name| ScriptedTest {
                    name: (*name).to_string(),
                    statuses: vec![TestStatus::Pass],
                    expected: true,
                })
                .collect(),
            ..Self::default()
        }
    }

    /// `failed_shards` exit nonzero and every test in `tests` fails.
    pub fn failing(failed_shards: &[u32], tests: &[&str]) -> Self {
        Self {
            failed_shards: failed_shards.to_vec(),
            exit_code: 1,
            tests: tests
                .iter()
                .map(|name| ScriptedTest {
                    name: (*name).to_string(),
                    statuses: vec![TestStatus::Fail],
                    expected: false,
                })
                .collect(),
            ..Self::default()
        }
    }

    /// The harness exits nonzero without reporting a single failure.
    pub fn crashed(failed_shards: &[u32]) -> Self {
        Self {
            failed_shards: failed_shards.to_vec(),
            exit_code: 1,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_test(mut self, name: &str, statuses: &[TestStatus]) -> Self {
        self.tests.push(ScriptedTest {
            name: name.to_string(),
            statuses: statuses.to_vec(),
            expected: false,
        });
        self
    }

    #[must_use]
    pub const fn without_lab_response(mut self) -> Self {
        self.no_lab_response = true;
        self
    }

    pub fn harness_failed(&self) -> bool {
        self.exit_code != 0 || !self.failed_shards.is_empty()
    }

    fn raw_results(&self, suite: &str) -> Vec<RawTestResult> {
        self.tests
            .iter()
            .flat_map(|test| {
                test.statuses.iter().map(move |status| RawTestResult {
                    test_id: format!("ninja://:{suite}/{}", test.name),
                    variant_hash: format!("{suite}-variant"),
                    variant: BTreeMap::from([("test_suite".to_string(), suite.to_string())]),
                    status: *status,
                    expected: test.expected,
                    duration_ms: Some(5),
                    failure_reason: None,
                    tags: vec![Tag {
                        key: "test_name".to_string(),
                        value: test.name.clone(),
                    }],
                })
            })
            .collect()
    }
}

/// Scripts and invocations shared by every scripted collaborator.
#[derive(Debug, Default)]
pub struct ScriptBook {
    scripts: RwLock<BTreeMap<(String, Phase), PhaseScript>>,
    /// Invocation name to the suite and phase that produced it.
    invocations: RwLock<BTreeMap<String, (String, Phase)>>,
}

impl ScriptBook {
    pub async fn set(&self, suite: &str, phase: Phase, script: PhaseScript) {
        self.scripts
            .write()
            .await
            .insert((suite.to_string(), phase), script);
    }

    /// Script for `suite` in `phase`; an unscripted suite passes silently.
    pub async fn get(&self, suite: &str, phase: Phase) -> PhaseScript {
        self.scripts
            .read()
            .await
            .get(&(suite.to_string(), phase))
            .cloned()
            .unwrap_or_default()
    }

    async fn register_invocation(&self, suite: &str, phase: Phase) -> String {
        let name = format!("invocations/{}", uuid::Uuid::new_v4());
        self.invocations
            .write()
            .await
            .insert(name.clone(), (suite.to_string(), phase));
        name
    }

    async fn invocation_source(&self, name: &str) -> Option<(String, Phase)> {
        self.invocations.read().await.get(name).cloned()
    }
}

/// Phase encoded in a step name such as `browser_tests (with patch)`.
fn phase_of_step(step_name: &str) -> Option<Phase> {
    let (_, suffix) = step_name.rsplit_once(" (")?;
    Phase::from_str(suffix.strip_suffix(')')?)
}

/// Every scripted collaborator, sharing one script book.
pub struct ScriptedWorld {
    pub book: Arc<ScriptBook>,
    pub checkout: Arc<ScriptedCheckout>,
    pub build: Arc<ScriptedBuild>,
    pub remote: Arc<ScriptedRemote>,
    pub local: Arc<ScriptedLocal>,
    pub lab: Arc<ScriptedLab>,
    pub results: Arc<ScriptedResults>,
    pub flakiness: Arc<ScriptedFlakiness>,
    pub known_flakes: Arc<ScriptedKnownFlakes>,
}

impl Default for ScriptedWorld {
    fn default() -> Self {
        let book = Arc::new(ScriptBook::default());
        Self {
            checkout: Arc::new(ScriptedCheckout::default()),
            build: Arc::new(ScriptedBuild::default()),
            remote: Arc::new(ScriptedRemote::new(Arc::clone(&book))),
            local: Arc::new(ScriptedLocal::new(Arc::clone(&book))),
            lab: Arc::new(ScriptedLab::new(Arc::clone(&book))),
            results: Arc::new(ScriptedResults::new(Arc::clone(&book))),
            flakiness: Arc::new(ScriptedFlakiness::default()),
            known_flakes: Arc::new(ScriptedKnownFlakes::default()),
            book,
        }
    }
}

impl ScriptedWorld {
    pub async fn script(&self, suite: &str, phase: Phase, script: PhaseScript) {
        self.book.set(suite, phase, script).await;
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            checkout: self.checkout.clone(),
            build: self.build.clone(),
            remote: self.remote.clone(),
            local: self.local.clone(),
            lab: self.lab.clone(),
            results: self.results.clone(),
            flakiness: Some(self.flakiness.clone()),
            known_flakes: Some(self.known_flakes.clone()),
        }
    }

    pub fn context(&self, identity: BuildIdentity, config: Config) -> BuildContext {
        BuildContext::new(identity, config, self.collaborators())
    }
}
