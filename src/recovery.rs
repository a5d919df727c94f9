//! Hook invoked when destroy gives up

use async_trait::async_trait;
use lifecycle_common::RetryError;
#[cfg(test)]
use mockall::automock;
use tracing::debug;

use crate::identity::ClusterIdentity;
use crate::provision::ProvisionError;

/// Last chance to clean up after a failed destroy, e.g. deleting leaked
/// cloud resources by tag. Runs exactly once per failed destroy; its outcome
/// does not change the error returned to the caller.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RecoveryHook: Send + Sync {
    /// Attempt recovery for `identity` after `error`
    async fn recover(&self, identity: &ClusterIdentity, error: &RetryError<ProvisionError>);
}

/// Recovery hook that does nothing
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopRecovery;

#[async_trait]
impl RecoveryHook for NoopRecovery {
    async fn recover(&self, identity: &ClusterIdentity, error: &RetryError<ProvisionError>) {
        debug!(cluster = %identity.name, error = %error, "No recovery configured");
    }
}
