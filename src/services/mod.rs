pub mod context;
pub mod exoneration;
pub mod flake_classifier;
pub mod flakiness_report;
pub mod reconciliation;
pub mod retry_engine;
pub mod summary;
pub mod test_group;
pub mod test_run;

pub use context::{BuildContext, BuildIdentity, Collaborators};
pub use flakiness_report::FlakinessReport;
pub use reconciliation::{ReconciliationReport, SuiteOverview, TryjobReconciler};
pub use retry_engine::{RetryOptions, RunTestsOutcome};
pub use test_group::TestGroup;
pub use test_run::TestRun;
