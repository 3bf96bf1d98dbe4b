//! sparkrelay - broker-to-SMS notification relay
//!
//! This library maintains a single subscription to a pub/sub broker topic
//! and forwards each inbound message as an SMS alert through an external
//! notification provider.

pub mod app;
pub mod broker;
pub mod cli;
pub mod config;
pub mod core;
pub mod errors;
pub mod internal_metrics;
pub mod notification;
pub mod relay;
pub mod task_manager;

// Re-export core types for convenience
pub use crate::core::*;
