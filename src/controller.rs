//! Lifecycle controller
//!
//! Sequences one cluster through provision, bootstrap, readiness and
//! teardown. Every step runs to completion before the next starts.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use lifecycle_common::{run_with_retry, EnvOverlay, RetryPolicy};
use tracing::{error, info, warn};

use crate::bootstrap::BootstrapWatcher;
use crate::config::{
    LifecycleConfig, ADMIN_EMAIL_ENV, ADMIN_PASSWORD_ENV, CLUSTER_ENV, CLUSTER_NAME_ENV,
    LICENSE_PATH_ENV, PLATFORM_ENV, PULL_SECRET_PATH_ENV,
};
use crate::control_plane::{join_api_addresses, ControlPlane, NodeHealthSnapshot};
use crate::diagnostics::DiagnosticsCollector;
use crate::error::Error;
use crate::identity::{ClusterIdentity, IdentityGenerator};
use crate::provision::{build_dir, ProvisionError, Provisioner};
use crate::readiness::ReadinessWatcher;
use crate::recovery::{NoopRecovery, RecoveryHook};
use crate::remote::{HostSet, RemoteExecutor};
use crate::tfvars::TfVars;
use crate::Result;

/// Provisioning actions take at most 30 minutes including retries
pub const PROVISION_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Plan: three attempts, no timeout
pub const PLAN_RETRY: RetryPolicy = RetryPolicy::attempts(3);

/// Apply: three attempts, verbose retries, 30 minute ceiling
pub const APPLY_RETRY: RetryPolicy = RetryPolicy::attempts(3)
    .with_verbose_retries()
    .with_timeout(PROVISION_TIMEOUT);

/// Destroy: same shape as apply
pub const DESTROY_RETRY: RetryPolicy = APPLY_RETRY;

/// Where the cluster currently is in its lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecyclePhase {
    /// Constructed; nothing applied yet
    Planned,
    /// Apply in progress
    Applying,
    /// Waiting for bootstrap services and nodes
    Bootstrapping,
    /// Every node reported Ready
    NodesReady,
    /// Destroy in progress
    Destroying,
    /// Infrastructure torn down
    Destroyed,
    /// A step failed; only destroy remains meaningful
    Failed,
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Planned => "Planned",
            Self::Applying => "Applying",
            Self::Bootstrapping => "Bootstrapping",
            Self::NodesReady => "NodesReady",
            Self::Destroying => "Destroying",
            Self::Destroyed => "Destroyed",
            Self::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// Result of [`LifecycleController::stop`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StopOutcome {
    /// Cleanup was inhibited; the cluster is still running
    CleanupSkipped(ClusterIdentity),
    /// The cluster was destroyed
    Destroyed,
}

/// Paths inside the installer repository for one cluster
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuildLayout {
    /// `<repo>/build/<name>`
    pub build_path: PathBuf,
    /// Admin kubeconfig written by the installer
    pub kubeconfig: PathBuf,
    /// Diagnostics output
    pub logs_path: PathBuf,
}

impl BuildLayout {
    /// Layout for `cluster` under `repo_root`
    pub fn new(repo_root: &Path, cluster: &str) -> Self {
        let build_path = build_dir(repo_root, cluster);
        Self {
            kubeconfig: build_path.join("generated").join("auth").join("kubeconfig"),
            logs_path: build_path.join("logs"),
            build_path,
        }
    }
}

/// Adapters the controller drives
#[derive(Clone)]
pub struct Collaborators {
    /// Infrastructure tool
    pub provisioner: Arc<dyn Provisioner>,
    /// Command transport to hosts
    pub remote: Arc<dyn RemoteExecutor>,
    /// Control API client
    pub control_plane: Arc<dyn ControlPlane>,
    /// Called once when destroy gives up
    pub recovery: Arc<dyn RecoveryHook>,
}

impl Collaborators {
    /// Collaborators with no recovery hook
    pub fn new(
        provisioner: Arc<dyn Provisioner>,
        remote: Arc<dyn RemoteExecutor>,
        control_plane: Arc<dyn ControlPlane>,
    ) -> Self {
        Self {
            provisioner,
            remote,
            control_plane,
            recovery: Arc::new(NoopRecovery),
        }
    }

    /// Replace the recovery hook
    pub fn with_recovery(mut self, recovery: Arc<dyn RecoveryHook>) -> Self {
        self.recovery = recovery;
        self
    }
}

/// Drives one cluster through its lifecycle.
pub struct LifecycleController {
    config: LifecycleConfig,
    identity: ClusterIdentity,
    expected_nodes: usize,
    layout: BuildLayout,
    collaborators: Collaborators,
    phase: LifecyclePhase,
    hosts: Option<HostSet>,
}

impl LifecycleController {
    /// Check prerequisites and fix the run's identity.
    ///
    /// Nothing is provisioned here; a missing license or pull secret fails
    /// before any side effect.
    pub fn new(config: LifecycleConfig, tfvars: &TfVars, collaborators: Collaborators) -> Result<Self> {
        let missing = config.missing_prerequisites();
        if !missing.is_empty() {
            return Err(Error::PrerequisiteMissing { missing });
        }

        let identity = IdentityGenerator::new(&tfvars.prefix)
            .with_name(config.cluster_name.clone())
            .with_admin_email(config.admin_email.clone())
            .with_admin_password(config.admin_password.clone())
            .identity()
            .clone();
        let layout = BuildLayout::new(&config.repo_root, &identity.name);

        info!(
            cluster = %identity.name,
            expected_nodes = tfvars.node_count(),
            build = %layout.build_path.display(),
            "Cluster lifecycle initialized"
        );

        Ok(Self {
            config,
            identity,
            expected_nodes: tfvars.node_count(),
            layout,
            collaborators,
            phase: LifecyclePhase::Planned,
            hosts: None,
        })
    }

    /// Current phase
    pub fn phase(&self) -> LifecyclePhase {
        self.phase
    }

    /// The run's identity
    pub fn identity(&self) -> &ClusterIdentity {
        &self.identity
    }

    /// Paths in the build directory
    pub fn layout(&self) -> &BuildLayout {
        &self.layout
    }

    /// Node count the cluster must reach
    pub fn expected_nodes(&self) -> usize {
        self.expected_nodes
    }

    /// Control-plane hosts, once resolved after apply
    pub fn hosts(&self) -> Option<&HostSet> {
        self.hosts.as_ref()
    }

    /// Environment handed to every provisioning invocation
    pub fn env_variables(&self) -> EnvOverlay {
        let mut env = EnvOverlay::new()
            .with(CLUSTER_ENV, &self.identity.name)
            .with(CLUSTER_NAME_ENV, &self.identity.name)
            .with(ADMIN_EMAIL_ENV, &self.identity.admin_email)
            .with(ADMIN_PASSWORD_ENV, &self.identity.admin_password);
        if let Some(platform) = &self.config.platform {
            env = env.with(PLATFORM_ENV, platform);
        }
        if let Some(path) = &self.config.license_path {
            env = env.with(LICENSE_PATH_ENV, path.display().to_string());
        }
        if let Some(path) = &self.config.pull_secret_path {
            env = env.with(PULL_SECRET_PATH_ENV, path.display().to_string());
        }
        env
    }

    /// Compute the change set, up to three attempts
    pub async fn plan(&self) -> Result<()> {
        let provisioner = &self.collaborators.provisioner;
        let outcome = run_with_retry(&PLAN_RETRY, "plan", &self.env_variables(), |env| async move {
            provisioner.plan(&env).await
        })
        .await;

        outcome.map_err(|source| {
            error!(cluster = %self.identity.name, error = %source, "Planning cluster failed");
            Error::ProvisionFailed {
                action: "plan",
                source,
            }
        })
    }

    /// Apply, then wait for bootstrap and node readiness
    pub async fn start(&mut self) -> Result<()> {
        let result = self.start_inner().await;
        if result.is_err() {
            self.phase = LifecyclePhase::Failed;
        }
        result
    }

    /// Re-apply against the same identity and wait again
    pub async fn update_cluster(&mut self) -> Result<()> {
        info!(cluster = %self.identity.name, "Updating cluster");
        self.start().await
    }

    async fn start_inner(&mut self) -> Result<()> {
        self.apply().await?;
        let hosts = self.resolve_hosts().await?;
        self.wait_until_ready(&hosts).await?;
        Ok(())
    }

    async fn apply(&mut self) -> Result<()> {
        self.phase = LifecyclePhase::Applying;
        info!(cluster = %self.identity.name, "Applying cluster");

        let provisioner = &self.collaborators.provisioner;
        run_with_retry(&APPLY_RETRY, "apply", &self.env_variables(), |env| async move {
            provisioner.apply(&env).await
        })
        .await
        .map_err(|source| Error::ProvisionFailed {
            action: "apply",
            source,
        })
    }

    async fn resolve_hosts(&mut self) -> Result<HostSet> {
        if let Some(hosts) = &self.hosts {
            return Ok(hosts.clone());
        }

        let hosts = self
            .collaborators
            .provisioner
            .control_plane_hosts(&self.env_variables())
            .await
            .map_err(|source| Error::HostDiscovery { source })?;
        let hosts = HostSet::new(hosts);
        if hosts.is_empty() {
            return Err(Error::HostDiscovery {
                source: ProvisionError::Output("no control plane hosts".to_string()),
            });
        }

        info!(hosts = %hosts, "Resolved control plane hosts");
        self.hosts = Some(hosts.clone());
        Ok(hosts)
    }

    async fn wait_until_ready(&mut self, hosts: &HostSet) -> Result<NodeHealthSnapshot> {
        self.phase = LifecyclePhase::Bootstrapping;

        let remote = self.collaborators.remote.clone();
        let diagnostics =
            DiagnosticsCollector::new(remote.clone(), &self.identity.name, &self.layout.logs_path);
        BootstrapWatcher::new(remote, diagnostics)
            .wait_for_bootstrapping(hosts)
            .await?;

        let snapshot = ReadinessWatcher::new(
            self.collaborators.control_plane.clone(),
            &self.layout.kubeconfig,
        )
        .wait_until_ready(self.expected_nodes())
        .await?;

        self.phase = LifecyclePhase::NodesReady;
        info!(cluster = %self.identity.name, nodes = snapshot.observed(), "Cluster is ready");
        Ok(snapshot)
    }

    /// Tear down unless cleanup is inhibited; clean the build directory in CI
    pub async fn stop(&mut self) -> Result<StopOutcome> {
        if self.config.skip_cleanup {
            warn!(cluster = %self.identity.name, "Cleanup inhibiting flag set. Stopping here.");
            info!(
                email = %self.identity.admin_email,
                password = %self.identity.admin_password,
                "Console credentials"
            );
            return Ok(StopOutcome::CleanupSkipped(self.identity.clone()));
        }

        self.destroy().await?;
        if self.config.ci {
            self.clean().await?;
        }
        Ok(StopOutcome::Destroyed)
    }

    /// Destroy with retries; the recovery hook runs once if it gives up
    pub async fn destroy(&mut self) -> Result<()> {
        self.phase = LifecyclePhase::Destroying;
        info!(cluster = %self.identity.name, "Destroying cluster");

        let provisioner = &self.collaborators.provisioner;
        let outcome = run_with_retry(&DESTROY_RETRY, "destroy", &self.env_variables(), |env| async move {
            provisioner.destroy(&env).await
        })
        .await;

        match outcome {
            Ok(()) => {
                self.phase = LifecyclePhase::Destroyed;
                info!(cluster = %self.identity.name, "Cluster destroyed");
                Ok(())
            }
            Err(source) => {
                error!(cluster = %self.identity.name, error = %source, "Destroying cluster failed");
                self.collaborators
                    .recovery
                    .recover(&self.identity, &source)
                    .await;
                self.phase = LifecyclePhase::Failed;
                Err(Error::DestroyFailed { source })
            }
        }
    }

    /// Remove local build artifacts
    pub async fn clean(&self) -> Result<()> {
        self.collaborators
            .provisioner
            .clean(&self.env_variables())
            .await
            .map_err(|source| Error::CleanFailed { source })
    }

    /// Keys stored in a secret of the running cluster
    pub async fn secret_files(&self, namespace: &str, secret: &str) -> Result<Vec<String>> {
        self.collaborators
            .control_plane
            .secret_keys(&self.layout.kubeconfig, namespace, secret)
            .await
            .map_err(|e| Error::query(format!("secret {}/{}", namespace, secret), e))
    }

    /// API server pod name to the external IP of the master it runs on
    pub async fn api_ip_addresses(&self) -> Result<BTreeMap<String, Option<String>>> {
        let control_plane = &self.collaborators.control_plane;
        let masters = control_plane
            .master_addresses(&self.layout.kubeconfig)
            .await
            .map_err(|e| Error::query("master node addresses", e))?;
        let pods = control_plane
            .api_server_pods(&self.layout.kubeconfig)
            .await
            .map_err(|e| Error::query("api server pods", e))?;
        Ok(join_api_addresses(&pods, &masters))
    }
}
