//! Cluster lifecycle - provision, wait for, and tear down one cluster under test
//!
//! A run moves one cluster through
//! provision → bootstrap-wait → readiness-wait → (use) → destroy.
//! Each phase is bounded by a fixed retry or poll policy, and a failed
//! bootstrap leaves logs from every control-plane host behind.
//!
//! # Modules
//!
//! - [`controller`] - Phase sequencing, plan/start/stop/destroy
//! - [`bootstrap`] - Waits for bootstrap markers on control-plane hosts
//! - [`readiness`] - Waits for the API and for every node to be Ready
//! - [`diagnostics`] - Best-effort log capture after a failed bootstrap
//! - [`provision`] - Infrastructure tool adapter (make + terraform)
//! - [`remote`] - Command execution on hosts over ssh
//! - [`control_plane`] - Read-only Kubernetes queries
//! - [`identity`] - Cluster name and admin credentials
//! - [`recovery`] - Hook run when destroy gives up
//! - [`tfvars`] - Cluster shape from the terraform variables file
//! - [`config`] - Run configuration and recognised environment variables
//! - [`cli`] - Command line entry points
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod bootstrap;
pub mod cli;
pub mod config;
pub mod control_plane;
pub mod controller;
pub mod diagnostics;
pub mod error;
pub mod identity;
pub mod provision;
pub mod readiness;
pub mod recovery;
pub mod remote;
pub mod tfvars;

pub use cli::Cli;
pub use config::{LifecycleConfig, CLUSTER_ENV};
pub use controller::{Collaborators, LifecycleController, LifecyclePhase, StopOutcome};
pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
