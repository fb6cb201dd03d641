pub mod build_result;
pub mod builder_config;
pub mod config;
pub mod dispatch;
pub mod flakiness;
pub mod phase;
pub mod suite_result;
pub mod test_result;
pub mod test_spec;

pub use build_result::{
    BuildStatus, CompileOutcome, RawResult, StepStatus, StepSummary, TryjobFlags,
};
pub use builder_config::{reconcile_field, BuilderConfig, BuilderSpec};
pub use config::{
    AnalysisConfig, Config, FlakeConfig, LabConfig, LoggingConfig, RemoteConfig, RetryConfig,
    SummaryConfig,
};
pub use dispatch::{
    CollectedTask, FinishedTaskSets, LabRequest, LabResponse, LocalOutcome, LocalRunRequest,
    ShardResult, ShardState, TaskHandle, TaskRequest,
};
pub use flakiness::{
    parse_known_flakes, FailingVariant, FlakeClassification, FlakeTestRef, IntervalStats,
    IssueId, KnownFlake, KnownFlakesQuery, RecentVerdict, TestVariantFailureRate,
    VerdictExample,
};
pub use phase::Phase;
pub use suite_result::{ResultSet, SuiteResult};
pub use test_result::{Exoneration, Invocation, PerTestResult, RawTestResult, Tag, TestStatus};
pub use test_spec::{
    ExperimentKey, ExperimentPolicy, TaskTimeouts, TestOptions, TestSelection, TestSpec, Venue,
};
