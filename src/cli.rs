//! Command line surface
//!
//! Flags fall back to the environment variables the installer's test
//! harness has always used, so CI jobs need no changes.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tracing::{error, info};

use crate::config::{
    LifecycleConfig, ADMIN_EMAIL_ENV, ADMIN_PASSWORD_ENV, CI_ENV, CLUSTER_ENV, LICENSE_PATH_ENV,
    PLATFORM_ENV, PULL_SECRET_PATH_ENV, SKIP_CLEANUP_ENV, TF_VARS_FILE_ENV,
};
use crate::control_plane::KubeControlPlane;
use crate::controller::{Collaborators, LifecycleController, StopOutcome};
use crate::error::Error;
use crate::provision::{MakeProvisioner, DEFAULT_HOSTS_OUTPUT};
use crate::remote::{SshExecutor, DEFAULT_SSH_COMMAND_TIMEOUT, DEFAULT_SSH_USER};
use crate::tfvars::TfVars;
use crate::Result;

/// Provision, wait for, and tear down one cluster under test
#[derive(Parser, Debug)]
#[command(name = "cluster-lifecycle")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Lifecycle step to run
    #[command(subcommand)]
    pub command: Commands,
}

/// Lifecycle steps
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Compute the change set
    Plan(ClusterArgs),
    /// Apply and wait until every node is Ready
    Start(ClusterArgs),
    /// Destroy the cluster named by CLUSTER
    Stop(ClusterArgs),
    /// Re-apply an existing cluster and wait again
    Update(ClusterArgs),
    /// Start, then always stop
    Run(ClusterArgs),
}

/// Inputs shared by every subcommand
#[derive(Args, Debug, Clone)]
pub struct ClusterArgs {
    /// Installer repository root
    #[arg(long, default_value = ".")]
    pub repo_root: PathBuf,

    /// Terraform variables file (JSON)
    #[arg(long = "tfvars", env = TF_VARS_FILE_ENV)]
    pub tfvars_file: PathBuf,

    /// Fixed cluster name; generated from the tfvars prefix otherwise
    #[arg(long, env = CLUSTER_ENV)]
    pub cluster: Option<String>,

    /// Console admin email
    #[arg(long, env = ADMIN_EMAIL_ENV)]
    pub admin_email: Option<String>,

    /// Console admin password
    #[arg(long, env = ADMIN_PASSWORD_ENV, hide_env_values = true)]
    pub admin_password: Option<String>,

    /// License file
    #[arg(long, env = LICENSE_PATH_ENV)]
    pub license_path: Option<PathBuf>,

    /// Pull secret file
    #[arg(long, env = PULL_SECRET_PATH_ENV)]
    pub pull_secret_path: Option<PathBuf>,

    /// Leave the cluster running on stop
    #[arg(long = "dont-clean-up", env = SKIP_CLEANUP_ENV, num_args = 0..=1, default_missing_value = "1")]
    pub dont_clean_up: Option<String>,

    /// Running under CI; clean the build directory after destroy
    #[arg(long = "ci", env = CI_ENV, num_args = 0..=1, default_missing_value = "1")]
    pub ci: Option<String>,

    /// Target platform
    #[arg(long, env = PLATFORM_ENV)]
    pub platform: Option<String>,

    /// Login user on control-plane hosts
    #[arg(long, default_value = DEFAULT_SSH_USER)]
    pub ssh_user: String,

    /// Private key for control-plane hosts
    #[arg(long)]
    pub ssh_key: Option<PathBuf>,

    /// Seconds a single remote command may run
    #[arg(long, default_value_t = DEFAULT_SSH_COMMAND_TIMEOUT.as_secs())]
    pub ssh_timeout: u64,

    /// Terraform output listing control-plane addresses
    #[arg(long, default_value = DEFAULT_HOSTS_OUTPUT)]
    pub hosts_output: String,
}

impl ClusterArgs {
    /// Resolve into the lifecycle configuration
    pub fn to_config(&self) -> LifecycleConfig {
        LifecycleConfig {
            repo_root: self.repo_root.clone(),
            cluster_name: self.cluster.clone(),
            admin_email: self.admin_email.clone(),
            admin_password: self.admin_password.clone(),
            license_path: self.license_path.clone(),
            pull_secret_path: self.pull_secret_path.clone(),
            skip_cleanup: self.dont_clean_up.is_some(),
            ci: self.ci.is_some(),
            platform: self.platform.clone(),
        }
    }

    fn controller(&self) -> Result<LifecycleController> {
        let tfvars = TfVars::load(&self.tfvars_file)?;

        let provisioner =
            MakeProvisioner::new(&self.repo_root).with_hosts_output(&self.hosts_output);

        let collaborators = Collaborators::new(
            Arc::new(provisioner),
            Arc::new(self.ssh_executor()),
            Arc::new(KubeControlPlane),
        );
        LifecycleController::new(self.to_config(), &tfvars, collaborators)
    }

    fn ssh_executor(&self) -> SshExecutor {
        let ssh = SshExecutor::new(&self.ssh_user)
            .with_command_timeout(Duration::from_secs(self.ssh_timeout));
        match &self.ssh_key {
            Some(key) => ssh.with_identity_file(key),
            None => ssh,
        }
    }
}

impl Cli {
    /// Run the selected subcommand
    pub async fn run(self) -> Result<()> {
        match self.command {
            Commands::Plan(args) => args.controller()?.plan().await,
            Commands::Start(args) => args.controller()?.start().await,
            Commands::Update(args) => args.controller()?.update_cluster().await,
            Commands::Stop(args) => {
                // A generated name would point at a build directory nobody created
                if args.cluster.is_none() {
                    return Err(Error::config(format!(
                        "stop needs {} to name the cluster to destroy",
                        CLUSTER_ENV
                    )));
                }
                let outcome = args.controller()?.stop().await?;
                report(&outcome);
                Ok(())
            }
            Commands::Run(args) => {
                let mut controller = args.controller()?;
                let started = controller.start().await;
                let stopped = controller.stop().await;
                finish_run(started, stopped)
            }
        }
    }
}

/// Combine the outcomes of start and stop; a start failure wins.
fn finish_run(started: Result<()>, stopped: Result<StopOutcome>) -> Result<()> {
    match (started, stopped) {
        (Err(e), Err(stop_err)) => {
            error!(error = %stop_err, "Teardown after failed start also failed");
            Err(e)
        }
        (Err(e), Ok(outcome)) => {
            report(&outcome);
            Err(e)
        }
        (Ok(()), stopped) => {
            report(&stopped?);
            Ok(())
        }
    }
}

fn report(outcome: &StopOutcome) {
    match outcome {
        StopOutcome::CleanupSkipped(identity) => {
            info!(cluster = %identity.name, "Cluster left running")
        }
        StopOutcome::Destroyed => info!("Cluster destroyed"),
    }
}
