//! Port trait definitions (Hexagonal Architecture)
//!
//! Every collaborator of the reconciliation engine sits behind one of these
//! async traits:
//! - SourceCheckout: files touched by the change, deapplying the patch
//! - BuildService: compiling and isolating test targets
//! - RemoteTaskService: dispatching and collecting sharded remote tasks
//! - LocalTestRunner: running a suite on the build machine
//! - LabService: batched submissions to a hardware lab
//! - ResultBackend: structured test results and exonerations
//! - FlakinessAnalysis / KnownFlakesService: historical flakiness
//!
//! Adapters under `crate::adapters` implement them.

pub mod build_service;
pub mod flakiness;
pub mod lab_service;
pub mod local_test_runner;
pub mod remote_task_service;
pub mod result_backend;
pub mod source_checkout;

pub use build_service::BuildService;
pub use flakiness::{FlakinessAnalysis, KnownFlakesService};
pub use lab_service::LabService;
pub use local_test_runner::LocalTestRunner;
pub use remote_task_service::RemoteTaskService;
pub use result_backend::ResultBackend;
pub use source_checkout::SourceCheckout;
