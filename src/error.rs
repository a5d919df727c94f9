//! Error types for the cluster lifecycle
//!
//! Only terminating conditions live here. Transport failures and transient
//! API errors are absorbed by the watchers and never reach the caller.

use std::path::PathBuf;
use std::time::Duration;

use lifecycle_common::{PollError, RetryError};
use thiserror::Error;

use crate::control_plane::ApiError;
use crate::provision::ProvisionError;

/// Main error type for lifecycle operations
#[derive(Debug, Error)]
pub enum Error {
    /// Required license or credential inputs are absent
    #[error("prerequisite missing: {} not set", .missing.join(", "))]
    PrerequisiteMissing {
        /// Names of the missing inputs
        missing: Vec<String>,
    },

    /// Plan or apply exhausted its retries or its timeout
    #[error("{action} failed: {source}")]
    ProvisionFailed {
        /// Provisioning action (plan, apply)
        action: &'static str,
        /// Retry outcome, carrying the last attempt's error
        #[source]
        source: RetryError<ProvisionError>,
    },

    /// The control-plane host set could not be read after apply
    #[error("could not resolve control plane hosts: {source}")]
    HostDiscovery {
        /// Underlying adapter error
        #[source]
        source: ProvisionError,
    },

    /// No host reported the service's completion marker in time
    #[error(
        "timeout waiting for {service} service to bootstrap on any of: {hosts} ({polls} polls)",
        hosts = .hosts_checked.join(", ")
    )]
    BootstrapTimeout {
        /// Service that never finished
        service: String,
        /// Hosts that were checked on every poll
        hosts_checked: Vec<String>,
        /// Polls performed before giving up
        polls: u32,
    },

    /// The control-plane API never answered a liveness call
    #[error("control plane API never became reachable after {waited:?}")]
    ApiNeverReady {
        /// Time spent waiting
        waited: Duration,
    },

    /// Nodes did not all report Ready before the ceiling
    #[error(
        "waiting for all nodes to become ready timed out: expected {expected}, observed {observed} ({ready} ready)"
    )]
    NodesNotReady {
        /// Node count expected from the cluster variables
        expected: usize,
        /// Node count returned by the last successful listing
        observed: usize,
        /// Ready nodes in the last successful listing
        ready: usize,
    },

    /// Destroy exhausted its retries or its timeout; the recovery hook has run
    #[error("destroying cluster failed: {source}")]
    DestroyFailed {
        /// Retry outcome, carrying the last attempt's error
        #[source]
        source: RetryError<ProvisionError>,
    },

    /// Removing local build artifacts failed
    #[error("could not clean build directory: {source}")]
    CleanFailed {
        /// Underlying adapter error
        #[source]
        source: ProvisionError,
    },

    /// A read-only control-plane query failed
    #[error("control plane query {query} failed: {source}")]
    Query {
        /// What was being queried
        query: String,
        /// Underlying API error
        #[source]
        source: ApiError,
    },

    /// A wait loop stopped on a fatal check error
    #[error(transparent)]
    Wait(#[from] PollError),

    /// Invalid or unreadable configuration
    #[error("configuration error: {message}")]
    Config {
        /// Description of what is wrong
        message: String,
    },

    /// A local file could not be read
    #[error("could not read {}: {source}", .path.display())]
    Io {
        /// File that was read
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Create a configuration error with the given message
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a query error for the named control-plane query
    pub fn query(query: impl Into<String>, source: ApiError) -> Self {
        Self::Query {
            query: query.into(),
            source,
        }
    }
}
