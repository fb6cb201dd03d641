//! Domain layer for the try-job reconciliation engine
//!
//! This module contains the result data model, the phase vocabulary, and the
//! ports through which every external collaborator is reached.

pub mod errors;
pub mod models;
pub mod ports;

// Re-export error types for convenient access
pub use errors::{DomainError, DomainResult, InconsistentConfigError};
