//! Per-build context shared by every component of a reconciliation run.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{OnceCell, RwLock};

use crate::domain::errors::DomainResult;
use crate::domain::models::{Config, ExperimentKey, Phase, StepSummary, TryjobFlags};
use crate::domain::ports::{
    BuildService, FlakinessAnalysis, KnownFlakesService, LabService, LocalTestRunner,
    RemoteTaskService, ResultBackend, SourceCheckout,
};

/// Commit message footer that disables suite-level retries.
pub const SKIP_RETRY_FOOTER: &str = "Disable-Retries";

/// Cross-repository dependency footer, unsupported on these builders.
pub const CQ_DEPEND_FOOTER: &str = "Cq-Depends";

/// Who is building what.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildIdentity {
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub bucket: String,
    pub builder: String,
    #[serde(default)]
    pub change_number: Option<u64>,
    #[serde(default)]
    pub build_number: Option<u64>,
}

/// Handles to every external collaborator.
#[derive(Clone)]
pub struct Collaborators {
    pub checkout: Arc<dyn SourceCheckout>,
    pub build: Arc<dyn BuildService>,
    pub remote: Arc<dyn RemoteTaskService>,
    pub local: Arc<dyn LocalTestRunner>,
    pub lab: Arc<dyn LabService>,
    pub results: Arc<dyn ResultBackend>,
    /// Optional; without it nothing is classified by failure rate.
    pub flakiness: Option<Arc<dyn FlakinessAnalysis>>,
    /// Optional; without it no legacy known flakes are consulted.
    pub known_flakes: Option<Arc<dyn KnownFlakesService>>,
}

/// Build outputs keyed by whether the change was applied.
type ArtifactStore = BTreeMap<(bool, String), String>;

/// Explicit state of one build, passed to every call.
///
/// Memoized lookups live in `OnceCell`s; records that accumulate over the
/// build (artifacts, flags, step summaries) sit behind async locks.
pub struct BuildContext {
    pub identity: BuildIdentity,
    pub is_tryserver: bool,
    pub config: Config,
    pub services: Collaborators,
    footers: BTreeMap<String, Vec<String>>,
    affected_files: OnceCell<Vec<String>>,
    artifacts: RwLock<ArtifactStore>,
    flags: RwLock<TryjobFlags>,
    steps: RwLock<Vec<StepSummary>>,
}

impl BuildContext {
    pub fn new(identity: BuildIdentity, config: Config, services: Collaborators) -> Self {
        Self {
            identity,
            is_tryserver: true,
            config,
            services,
            footers: BTreeMap::new(),
            affected_files: OnceCell::new(),
            artifacts: RwLock::new(BTreeMap::new()),
            flags: RwLock::new(TryjobFlags::default()),
            steps: RwLock::new(Vec::new()),
        }
    }

    #[must_use]
    pub const fn with_tryserver(mut self, is_tryserver: bool) -> Self {
        self.is_tryserver = is_tryserver;
        self
    }

    #[must_use]
    pub fn with_footers(mut self, footers: BTreeMap<String, Vec<String>>) -> Self {
        self.footers = footers;
        self
    }

    pub fn footer(&self, key: &str) -> &[String] {
        self.footers.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn experiment_key(&self) -> ExperimentKey<'_> {
        ExperimentKey {
            builder: &self.identity.builder,
            change_number: self.identity.change_number,
            build_number: self.identity.build_number,
        }
    }

    /// Files touched by the change, fetched once per build.
    pub async fn affected_files(&self) -> DomainResult<&[String]> {
        let checkout = Arc::clone(&self.services.checkout);
        let files = self
            .affected_files
            .get_or_try_init(|| async move { checkout.affected_files().await })
            .await?;
        Ok(files.as_slice())
    }

    /// Remember build outputs produced for `phase`.
    pub async fn record_artifacts(&self, phase: Phase, artifacts: BTreeMap<String, String>) {
        let mut store = self.artifacts.write().await;
        for (target, digest) in artifacts {
            store.insert((phase.is_patched(), target), digest);
        }
    }

    /// Artifact reference for `target` built the way `phase` needs it.
    pub async fn artifact(&self, target: &str, phase: Phase) -> Option<String> {
        self.artifacts
            .read()
            .await
            .get(&(phase.is_patched(), target.to_string()))
            .cloned()
    }

    pub async fn update_flags(&self, update: impl FnOnce(&mut TryjobFlags) + Send) {
        update(&mut *self.flags.write().await);
    }

    pub async fn flags(&self) -> TryjobFlags {
        *self.flags.read().await
    }

    pub async fn record_step(&self, step: StepSummary) {
        tracing::info!(step = %step.name, status = ?step.status, "step recorded");
        self.steps.write().await.push(step);
    }

    pub async fn steps(&self) -> Vec<StepSummary> {
        self.steps.read().await.clone()
    }
}
