//! Sidecar harness - test-lifecycle orchestration for sidecar proxy tests
//!
//! This library brings up client/server proxy pairs for integration tests:
//! - Hands out disjoint port blocks to concurrently running scenarios
//! - Launches proxy processes and waits for their administrative endpoint
//! - Publishes versioned listener/cluster snapshots per proxy node
//! - Polls stats endpoints until readiness or an expected state is reached
//! - Starts HTTP/TCP backends (optionally over TLS) as traffic targets
//! - Always stops proxies and removes their on-disk artifacts afterwards

pub mod admin;
pub mod backend;
pub mod config;
pub mod error;
pub mod matcher;
pub mod poller;
pub mod ports;
pub mod process;
pub mod setup;
pub mod snapshot;
pub mod stats;

pub use error::{ErrorClass, HarnessError, Result};
pub use setup::{ScenarioContext, ScenarioOutcome, TestSetup};

pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
