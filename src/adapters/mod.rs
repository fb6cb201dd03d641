//! Adapters implementing the domain ports.

pub mod http;
pub mod scripted;
