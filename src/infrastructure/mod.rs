//! Infrastructure layer module
//!
//! Configuration loading and logging setup. Adapters for external services
//! live in [`crate::adapters`].

pub mod config;
pub mod logging;
