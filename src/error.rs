//! Error taxonomy for execution coordination.
//!
//! Only [`ConfigurationError`] and [`ExecutionError`] ever reach callers
//! directly. Dispatch failures become a `Failed` outcome, channel failures are
//! logged and retried, and reconciliation failures are retried with the next
//! batch of results.

use thiserror::Error;

use crate::ci::artifacts::ArtifactError;
use crate::model::{ExecutionState, RequestId};

/// Missing or malformed CI/backend configuration. Fatal, surfaced before dispatch.
#[derive(Error, Debug)]
pub enum ConfigurationError {
    /// No CI repository is configured.
    #[error("no CI repository configured")]
    MissingRepository,

    /// A repository is configured but there is no credential for it.
    #[error("no CI token configured for repository {repository}")]
    MissingToken { repository: String },

    /// The repository reference is not of the form `owner/repo`.
    #[error("invalid CI repository '{0}', expected owner/repo")]
    InvalidRepository(String),

    /// The backend base URL cannot be used.
    #[error("invalid backend URL '{url}': {reason}")]
    InvalidBackendUrl { url: String, reason: String },

    /// The CI client could not be constructed.
    #[error("failed to build CI client: {0}")]
    Client(String),

    /// The configuration sources could not be read or deserialized.
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
}

/// The CI system refused or failed to accept a run.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// The dispatch call itself was rejected.
    #[error("CI rejected the workflow dispatch: {0}")]
    Rejected(String),

    /// The dispatch was accepted but the resulting run never appeared.
    #[error("no CI run found for request {request_id} after {attempts} lookups")]
    RunNotFound { request_id: RequestId, attempts: u32 },

    /// A CI API call made while locating the run failed.
    #[error("CI API error: {0}")]
    Api(String),
}

/// A single channel's attempt to obtain results failed. Always recoverable.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChannelError {
    /// Network-level failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// The remote answered with an unexpected HTTP status.
    #[error("unexpected HTTP status {status} from {url}")]
    Status { status: u16, url: String },

    /// A payload could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// Result artifacts could not be turned into test results.
    #[error("artifact error: {0}")]
    Artifact(#[from] ArtifactError),

    /// The channel cannot serve this request at all.
    #[error("channel unavailable: {0}")]
    Unavailable(String),

    /// The channel gave up after repeated failures.
    #[error("gave up after {attempts} consecutive failures, last: {last}")]
    Exhausted { attempts: u32, last: String },
}

impl ChannelError {
    /// Wrap any displayable transport failure.
    pub fn transport(err: impl std::fmt::Display) -> Self {
        ChannelError::Transport(err.to_string())
    }
}

/// The record store rejected a read or write.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    /// The store is temporarily unreachable.
    #[error("record store unavailable: {0}")]
    Unavailable(String),

    /// A write was rejected.
    #[error("record store rejected update for {test_case_id}: {reason}")]
    Rejected { test_case_id: String, reason: String },
}

/// A reconciliation batch could not be written. The batch is retried later.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReconciliationError {
    /// The underlying store failed.
    #[error("reconciliation failed after {applied} updates: {source}")]
    Store {
        applied: usize,
        #[source]
        source: StoreError,
    },
}

/// Errors returned synchronously from `ExecutionCoordinator::start`.
#[derive(Error, Debug)]
pub enum ExecutionError {
    /// Required configuration is missing; nothing was dispatched.
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// The request named no test cases.
    #[error("an execution needs at least one test case")]
    NoTestCases,
}

/// A state change the request state machine does not allow.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("invalid transition from {from} to {to}")]
pub struct InvalidTransition {
    pub from: ExecutionState,
    pub to: ExecutionState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_error_messages() {
        assert_eq!(
            ConfigurationError::MissingRepository.to_string(),
            "no CI repository configured"
        );
        let err = ConfigurationError::MissingToken {
            repository: "acme/app".to_string(),
        };
        assert!(err.to_string().contains("acme/app"));
    }

    #[test]
    fn test_execution_error_is_transparent_over_configuration() {
        let err: ExecutionError = ConfigurationError::MissingRepository.into();
        assert_eq!(err.to_string(), "no CI repository configured");
    }

    #[test]
    fn test_reconciliation_error_reports_progress() {
        let err = ReconciliationError::Store {
            applied: 2,
            source: StoreError::Unavailable("offline".to_string()),
        };
        assert!(err.to_string().contains("after 2 updates"));
    }
}
