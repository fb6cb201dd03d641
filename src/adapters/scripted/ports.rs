use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{phase_of_step, ScriptBook};
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    BuildStatus, CollectedTask, CompileOutcome, Exoneration, FailingVariant, FinishedTaskSets,
    Invocation, KnownFlake, KnownFlakesQuery, LabRequest, LabResponse, LocalOutcome,
    LocalRunRequest, Phase, ShardResult, ShardState, TaskHandle, TaskRequest,
    TestVariantFailureRate,
};
use crate::domain::ports::{
    BuildService, FlakinessAnalysis, KnownFlakesService, LabService, LocalTestRunner,
    RemoteTaskService, ResultBackend, SourceCheckout,
};

fn phase_of(step_name: &str) -> DomainResult<Phase> {
    phase_of_step(step_name)
        .ok_or_else(|| DomainError::Precondition(format!("step '{step_name}' names no phase")))
}

#[derive(Debug, Default)]
pub struct ScriptedCheckout {
    affected_files: RwLock<Vec<String>>,
    affected_files_calls: AtomicUsize,
    deapply_calls: AtomicUsize,
}

impl ScriptedCheckout {
    pub async fn set_affected_files(&self, files: Vec<String>) {
        *self.affected_files.write().await = files;
    }

    pub fn affected_files_calls(&self) -> usize {
        self.affected_files_calls.load(Ordering::SeqCst)
    }

    pub fn deapply_calls(&self) -> usize {
        self.deapply_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceCheckout for ScriptedCheckout {
    async fn affected_files(&self) -> DomainResult<Vec<String>> {
        self.affected_files_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.affected_files.read().await.clone())
    }

    async fn deapply_patch(&self) -> DomainResult<()> {
        self.deapply_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct ScriptedBuild {
    failing_phases: RwLock<Vec<Phase>>,
    compiles: RwLock<Vec<(Phase, Vec<String>)>>,
    clobbers: AtomicUsize,
}

impl ScriptedBuild {
    pub async fn fail_compile(&self, phase: Phase) {
        self.failing_phases.write().await.push(phase);
    }

    /// Every compile requested so far, in order.
    pub async fn compiles(&self) -> Vec<(Phase, Vec<String>)> {
        self.compiles.read().await.clone()
    }

    pub fn clobbers(&self) -> usize {
        self.clobbers.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BuildService for ScriptedBuild {
    async fn compile(&self, targets: &[String], phase: Phase) -> DomainResult<CompileOutcome> {
        self.compiles.write().await.push((phase, targets.to_vec()));
        if self.failing_phases.read().await.contains(&phase) {
            return Ok(CompileOutcome {
                status: BuildStatus::Failure,
                summary_markdown: format!("Compile failed ({phase})"),
                artifacts: BTreeMap::new(),
            });
        }
        let patch_state = if phase.is_patched() { "patched" } else { "unpatched" };
        Ok(CompileOutcome {
            status: BuildStatus::Success,
            summary_markdown: String::new(),
            artifacts: targets
                .iter()
                .map(|t| (t.clone(), format!("{t}-{patch_state}-digest")))
                .collect(),
        })
    }

    async fn clobber(&self) -> DomainResult<()> {
        self.clobbers.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug)]
struct SubmittedTask {
    suite: String,
    phase: Phase,
    shard_indices: Vec<u32>,
}

#[derive(Debug)]
pub struct ScriptedRemote {
    book: Arc<ScriptBook>,
    submitted: RwLock<Vec<TaskRequest>>,
    tasks: RwLock<BTreeMap<String, SubmittedTask>>,
    stall_polling: AtomicBool,
}

impl ScriptedRemote {
    pub fn new(book: Arc<ScriptBook>) -> Self {
        Self {
            book,
            submitted: RwLock::new(Vec::new()),
            tasks: RwLock::new(BTreeMap::new()),
            stall_polling: AtomicBool::new(false),
        }
    }

    /// Make polling report nothing finished, forcing one-by-one collection.
    pub fn stall_polling(&self, stall: bool) {
        self.stall_polling.store(stall, Ordering::SeqCst);
    }

    pub async fn submitted(&self) -> Vec<TaskRequest> {
        self.submitted.read().await.clone()
    }
}

#[async_trait]
impl RemoteTaskService for ScriptedRemote {
    async fn submit(&self, request: TaskRequest) -> DomainResult<TaskHandle> {
        let phase = phase_of(&request.name)?;
        let task_set_id = Uuid::new_v4().to_string();
        let invocation = self.book.register_invocation(&request.suite, phase).await;
        let task_ids = request
            .shard_indices
            .iter()
            .map(|i| format!("{task_set_id}-{i}"))
            .collect();

        self.tasks.write().await.insert(
            task_set_id.clone(),
            SubmittedTask {
                suite: request.suite.clone(),
                phase,
                shard_indices: request.shard_indices.clone(),
            },
        );
        let handle = TaskHandle {
            task_set_id,
            task_ids,
            shard_indices: request.shard_indices.clone(),
            invocation_names: vec![invocation],
        };
        self.submitted.write().await.push(request);
        Ok(handle)
    }

    async fn wait_for_finished_task_set(
        &self,
        task_sets: &[String],
        attempts: u32,
    ) -> DomainResult<FinishedTaskSets> {
        if self.stall_polling.load(Ordering::SeqCst) {
            return Ok(FinishedTaskSets {
                finished: Vec::new(),
                attempts: attempts + 1,
            });
        }
        let tasks = self.tasks.read().await;
        Ok(FinishedTaskSets {
            finished: task_sets
                .iter()
                .filter(|id| tasks.contains_key(*id))
                .cloned()
                .collect(),
            attempts: attempts + 1,
        })
    }

    async fn collect(&self, handle: &TaskHandle) -> DomainResult<CollectedTask> {
        let tasks = self.tasks.read().await;
        let task = tasks.get(&handle.task_set_id).ok_or_else(|| {
            DomainError::InfraFailure(format!("unknown task set {}", handle.task_set_id))
        })?;
        let script = self.book.get(&task.suite, task.phase).await;
        Ok(CollectedTask {
            shards: task
                .shard_indices
                .iter()
                .map(|index| ShardResult {
                    index: *index,
                    state: ShardState::Completed,
                    exit_code: Some(i32::from(script.failed_shards.contains(index))),
                })
                .collect(),
            invocation_names: Vec::new(),
        })
    }
}

#[derive(Debug)]
pub struct ScriptedLocal {
    book: Arc<ScriptBook>,
    runs: RwLock<Vec<LocalRunRequest>>,
}

impl ScriptedLocal {
    pub fn new(book: Arc<ScriptBook>) -> Self {
        Self {
            book,
            runs: RwLock::new(Vec::new()),
        }
    }

    pub async fn runs(&self) -> Vec<LocalRunRequest> {
        self.runs.read().await.clone()
    }
}

#[async_trait]
impl LocalTestRunner for ScriptedLocal {
    async fn run(&self, request: LocalRunRequest) -> DomainResult<LocalOutcome> {
        let phase = phase_of(&request.step_name)?;
        let script = self.book.get(&request.suite, phase).await;
        let invocation = self.book.register_invocation(&request.suite, phase).await;
        self.runs.write().await.push(request);
        Ok(LocalOutcome {
            exit_code: script.exit_code,
            invocation_names: vec![invocation],
        })
    }
}

#[derive(Debug)]
pub struct ScriptedLab {
    book: Arc<ScriptBook>,
    batches: RwLock<BTreeMap<String, Vec<LabRequest>>>,
}

impl ScriptedLab {
    pub fn new(book: Arc<ScriptBook>) -> Self {
        Self {
            book,
            batches: RwLock::new(BTreeMap::new()),
        }
    }

    pub async fn batches(&self) -> usize {
        self.batches.read().await.len()
    }
}

#[async_trait]
impl LabService for ScriptedLab {
    async fn schedule_suites(&self, requests: Vec<LabRequest>, _timeout_secs: u64) -> DomainResult<String> {
        let batch_id = Uuid::new_v4().to_string();
        self.batches.write().await.insert(batch_id.clone(), requests);
        Ok(batch_id)
    }

    async fn wait_on_suites(&self, batch_id: &str, _timeout_secs: u64) -> DomainResult<Vec<LabResponse>> {
        let requests = self
            .batches
            .read()
            .await
            .get(batch_id)
            .cloned()
            .ok_or_else(|| DomainError::InfraFailure(format!("unknown lab batch {batch_id}")))?;

        let mut responses = Vec::with_capacity(requests.len());
        for request in requests {
            let phase = phase_of(&request.step_name)?;
            let script = self.book.get(&request.suite, phase).await;
            if script.no_lab_response {
                continue;
            }
            let invocation = self.book.register_invocation(&request.suite, phase).await;
            responses.push(LabResponse {
                step_name: request.step_name,
                passed: !script.harness_failed(),
                invocation_names: vec![invocation],
            });
        }
        Ok(responses)
    }
}

#[derive(Debug)]
pub struct ScriptedResults {
    book: Arc<ScriptBook>,
    enabled: AtomicBool,
    included: RwLock<Vec<String>>,
    exonerations: RwLock<Vec<Exoneration>>,
}

impl ScriptedResults {
    pub fn new(book: Arc<ScriptBook>) -> Self {
        Self {
            book,
            enabled: AtomicBool::new(true),
            included: RwLock::new(Vec::new()),
            exonerations: RwLock::new(Vec::new()),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub async fn included(&self) -> Vec<String> {
        self.included.read().await.clone()
    }

    pub async fn exonerations(&self) -> Vec<Exoneration> {
        self.exonerations.read().await.clone()
    }
}

#[async_trait]
impl ResultBackend for ScriptedResults {
    fn enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    async fn query(&self, invocation_names: &[String]) -> DomainResult<Vec<Invocation>> {
        let mut invocations = Vec::with_capacity(invocation_names.len());
        for name in invocation_names {
            let (suite, phase) = self.book.invocation_source(name).await.ok_or_else(|| {
                DomainError::MalformedResponse(format!("unknown invocation {name}"))
            })?;
            let script = self.book.get(&suite, phase).await;
            invocations.push(Invocation {
                name: name.clone(),
                test_results: script.raw_results(&suite),
            });
        }
        Ok(invocations)
    }

    async fn include_invocations(&self, invocation_names: &[String]) -> DomainResult<()> {
        self.included
            .write()
            .await
            .extend(invocation_names.iter().cloned());
        Ok(())
    }

    async fn exonerate(&self, exonerations: Vec<Exoneration>) -> DomainResult<()> {
        self.exonerations.write().await.extend(exonerations);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct ScriptedFlakiness {
    failure_rates: RwLock<Vec<TestVariantFailureRate>>,
    unavailable: AtomicBool,
    queries: RwLock<Vec<Vec<FailingVariant>>>,
}

impl ScriptedFlakiness {
    pub async fn set_failure_rates(&self, rates: Vec<TestVariantFailureRate>) {
        *self.failure_rates.write().await = rates;
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn queries(&self) -> Vec<Vec<FailingVariant>> {
        self.queries.read().await.clone()
    }
}

#[async_trait]
impl FlakinessAnalysis for ScriptedFlakiness {
    async fn query_failure_rate(&self, variants: &[FailingVariant]) -> DomainResult<Vec<TestVariantFailureRate>> {
        self.queries.write().await.push(variants.to_vec());
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DomainError::ServiceUnavailable(
                "failure rate analysis unreachable".to_string(),
            ));
        }
        Ok(self
            .failure_rates
            .read()
            .await
            .iter()
            .filter(|rate| {
                variants
                    .iter()
                    .any(|v| v.test_id == rate.test_id && v.variant_hash == rate.variant_hash)
            })
            .cloned()
            .collect())
    }
}

#[derive(Debug, Default)]
pub struct ScriptedKnownFlakes {
    flakes: RwLock<Vec<KnownFlake>>,
    unavailable: AtomicBool,
    queries: RwLock<Vec<KnownFlakesQuery>>,
}

impl ScriptedKnownFlakes {
    pub async fn set_flakes(&self, flakes: Vec<KnownFlake>) {
        *self.flakes.write().await = flakes;
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn queries(&self) -> Vec<KnownFlakesQuery> {
        self.queries.read().await.clone()
    }
}

#[async_trait]
impl KnownFlakesService for ScriptedKnownFlakes {
    async fn query_known_flakes(&self, query: &KnownFlakesQuery) -> DomainResult<Vec<KnownFlake>> {
        self.queries.write().await.push(query.clone());
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DomainError::ServiceUnavailable("known flakes service unreachable".to_string()));
        }
        Ok(self
            .flakes
            .read()
            .await
            .iter()
            .filter(|flake| query.tests.contains(&flake.test))
            .cloned()
            .collect())
    }
}
