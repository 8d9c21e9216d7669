//! Error taxonomy for the harness
//!
//! Setup-phase errors abort a scenario before its body runs. Teardown-phase
//! errors are collected and logged but never stop the remaining cleanup steps.

use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;
use thiserror::Error;

use crate::matcher::Mismatch;
use crate::process::Role;

/// Result type alias for harness operations
pub type Result<T> = std::result::Result<T, HarnessError>;

/// Coarse classification of a [`HarnessError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// No free port range could be found
    ResourceExhaustion,
    /// The proxy could not be spawned or never became live
    Launch,
    /// A readiness or stats poll ran out of budget
    Convergence,
    /// A single-shot stats assertion failed
    Assertion,
    /// Stop or cleanup of a proxy or backend failed
    Teardown,
    /// Invalid configuration, resource definitions or payloads
    Configuration,
    /// The caller-supplied test body failed
    Body,
}

impl ErrorClass {
    /// Whether an error of this class aborts the scenario
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ErrorClass::Teardown)
    }

    /// Stable code for log fields
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::ResourceExhaustion => "RESOURCE_EXHAUSTION",
            ErrorClass::Launch => "LAUNCH",
            ErrorClass::Convergence => "CONVERGENCE",
            ErrorClass::Assertion => "ASSERTION",
            ErrorClass::Teardown => "TEARDOWN",
            ErrorClass::Configuration => "CONFIGURATION",
            ErrorClass::Body => "BODY",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type for the harness
#[derive(Debug, Error)]
pub enum HarnessError {
    /// The allocator walked past the end of the port space
    #[error("no available port range: a block of {block_size} ports starting at {base} exceeds 65535")]
    NoPortRange { base: u32, block_size: u16 },

    /// The proxy executable could not be started
    #[error("failed to spawn {role} proxy {}: {source}", binary.display())]
    Spawn {
        role: Role,
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Another live instance already owns this admin port
    #[error("admin port {0} already belongs to a live proxy instance")]
    AdminPortBusy(u16),

    /// The administrative endpoint never answered within the launch budget
    #[error("{role} proxy on admin port {admin_port} not live after {waited:?}: {last}")]
    LaunchTimeout {
        role: Role,
        admin_port: u16,
        waited: Duration,
        last: String,
    },

    /// The process exited before its administrative endpoint answered
    #[error("{role} proxy exited during startup: {status}")]
    ExitedDuringStartup { role: Role, status: ExitStatus },

    /// A poll exhausted its wall-clock budget
    #[error("{what} did not converge after {attempts} attempts: {last}")]
    Convergence {
        what: String,
        attempts: u32,
        last: String,
    },

    /// The proxy exited on its own after the shutdown request, but not cleanly
    #[error("{role} proxy exited uncleanly: {status}")]
    UncleanExit { role: Role, status: ExitStatus },

    /// A single-shot assertion against an already-fetched snapshot failed
    #[error("stats assertion failed: {0}")]
    Assertion(#[from] Mismatch),

    /// Transport failure talking to an administrative endpoint
    #[error("admin request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The administrative endpoint answered with a non-success status
    #[error("admin request to {url} returned status {status}")]
    Status { url: String, status: u16 },

    /// A stats payload could not be parsed
    #[error("invalid stats payload: {0}")]
    Parse(String),

    /// A configuration resource definition could not be parsed
    #[error("invalid {kind} resource: {reason}")]
    InvalidResource { kind: String, reason: String },

    /// Invalid harness configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// A backend server could not be started
    #[error("backend error: {0}")]
    Backend(String),

    /// Waiting for a stopping proxy failed
    #[error("waiting for {role} proxy to exit failed: {source}")]
    Stop {
        role: Role,
        #[source]
        source: std::io::Error,
    },

    /// Cleanup of a process-local artifact failed
    #[error("cleanup of {} failed: {source}", path.display())]
    Cleanup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// IO error while preparing a scenario (scratch directory, rendered config)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The test body returned an error
    #[error("test body failed: {0}")]
    Body(anyhow::Error),
}

impl HarnessError {
    /// Classify this error according to the harness error taxonomy
    pub fn class(&self) -> ErrorClass {
        match self {
            HarnessError::NoPortRange { .. } => ErrorClass::ResourceExhaustion,
            HarnessError::Spawn { .. }
            | HarnessError::AdminPortBusy(_)
            | HarnessError::LaunchTimeout { .. }
            | HarnessError::ExitedDuringStartup { .. }
            | HarnessError::Backend(_)
            | HarnessError::Io(_) => ErrorClass::Launch,
            HarnessError::Convergence { .. } => ErrorClass::Convergence,
            HarnessError::Assertion(_) => ErrorClass::Assertion,
            HarnessError::UncleanExit { .. }
            | HarnessError::Stop { .. }
            | HarnessError::Cleanup { .. } => ErrorClass::Teardown,
            HarnessError::Http { .. } | HarnessError::Status { .. } => ErrorClass::Convergence,
            HarnessError::Parse(_)
            | HarnessError::InvalidResource { .. }
            | HarnessError::Config(_) => ErrorClass::Configuration,
            HarnessError::Body(_) => ErrorClass::Body,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert_eq!(
            HarnessError::NoPortRange {
                base: 65530,
                block_size: 20
            }
            .class(),
            ErrorClass::ResourceExhaustion
        );
        assert_eq!(
            HarnessError::AdminPortBusy(20001).class(),
            ErrorClass::Launch
        );
        assert_eq!(
            HarnessError::Convergence {
                what: "readiness".to_string(),
                attempts: 15,
                last: "still warming".to_string(),
            }
            .class(),
            ErrorClass::Convergence
        );
        assert_eq!(
            HarnessError::Body(anyhow::anyhow!("boom")).class(),
            ErrorClass::Body
        );
    }

    #[test]
    fn test_setup_failures_are_fatal_and_stop_failures_are_not() {
        let bind = HarnessError::Backend("tcp backend failed to bind port 20000".to_string());
        assert_eq!(bind.class(), ErrorClass::Launch);
        assert!(bind.class().is_fatal());

        let io = HarnessError::from(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "scratch dir",
        ));
        assert_eq!(io.class(), ErrorClass::Launch);
        assert!(io.class().is_fatal());

        let stop = HarnessError::Stop {
            role: Role::Client,
            source: std::io::Error::new(std::io::ErrorKind::Other, "wait failed"),
        };
        assert_eq!(stop.class(), ErrorClass::Teardown);
        assert!(!stop.class().is_fatal());

        let cleanup = HarnessError::Cleanup {
            path: PathBuf::from("/dev/shm/envoy_shared_memory_10"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        assert_eq!(cleanup.class(), ErrorClass::Teardown);
    }

    #[test]
    fn test_only_teardown_is_non_fatal() {
        assert!(!ErrorClass::Teardown.is_fatal());
        assert!(ErrorClass::Launch.is_fatal());
        assert!(ErrorClass::ResourceExhaustion.is_fatal());
        assert!(ErrorClass::Convergence.is_fatal());
    }

    #[test]
    fn test_error_messages() {
        let err = HarnessError::NoPortRange {
            base: 65530,
            block_size: 20,
        };
        assert!(err.to_string().contains("no available port range"));

        let err = HarnessError::Convergence {
            what: "readiness of admin port 20001".to_string(),
            attempts: 15,
            last: "listeners warming: 1".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("15 attempts"));
        assert!(msg.contains("listeners warming: 1"));
    }

    #[test]
    fn test_class_codes() {
        assert_eq!(ErrorClass::ResourceExhaustion.as_str(), "RESOURCE_EXHAUSTION");
        assert_eq!(ErrorClass::Teardown.to_string(), "TEARDOWN");
    }
}
