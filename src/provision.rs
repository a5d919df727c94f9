//! Provisioning adapter
//!
//! The infrastructure tool is driven through make targets in the installer
//! repository (`make -C <repo> plan|apply|destroy|clean`). Each invocation
//! receives the run's environment overlay on top of the process environment.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use lifecycle_common::EnvOverlay;
#[cfg(test)]
use mockall::automock;
use tokio::process::Command;
use tracing::{debug, info};

use crate::CLUSTER_ENV;

/// Terraform output holding the control-plane addresses
pub const DEFAULT_HOSTS_OUTPUT: &str = "master_ips";

/// Errors from a single provisioning invocation
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    /// The command could not be started
    #[error("failed to run `{command}`: {source}")]
    Spawn {
        /// Command line
        command: String,
        /// Underlying IO error
        #[source]
        source: std::io::Error,
    },

    /// The command ran and exited unsuccessfully
    #[error("`{command}` exited with {}", .code.map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string()))]
    Exit {
        /// Command line
        command: String,
        /// Exit code, `None` when killed by a signal
        code: Option<i32>,
    },

    /// Provisioning output could not be interpreted
    #[error("invalid provisioning output: {0}")]
    Output(String),
}

/// Trait for the external infrastructure tool
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Compute the change set without applying it
    async fn plan(&self, env: &EnvOverlay) -> Result<(), ProvisionError>;

    /// Create or update the infrastructure
    async fn apply(&self, env: &EnvOverlay) -> Result<(), ProvisionError>;

    /// Tear the infrastructure down
    async fn destroy(&self, env: &EnvOverlay) -> Result<(), ProvisionError>;

    /// Remove local build artifacts
    async fn clean(&self, env: &EnvOverlay) -> Result<(), ProvisionError>;

    /// Addresses of the control-plane hosts created by the last apply
    async fn control_plane_hosts(&self, env: &EnvOverlay) -> Result<Vec<String>, ProvisionError>;
}

/// Runs make targets from the installer repository and reads terraform outputs.
pub struct MakeProvisioner {
    repo_root: PathBuf,
    hosts_output: String,
}

impl MakeProvisioner {
    /// Create a provisioner rooted at the installer repository
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
            hosts_output: DEFAULT_HOSTS_OUTPUT.to_string(),
        }
    }

    /// Read control-plane addresses from a different terraform output
    pub fn with_hosts_output(mut self, output: impl Into<String>) -> Self {
        self.hosts_output = output.into();
        self
    }

    async fn run_target(&self, target: &str, env: &EnvOverlay) -> Result<(), ProvisionError> {
        let command = format!("make -C {} {}", self.repo_root.display(), target);
        info!(target, "Running {}", command);

        let status = Command::new("make")
            .arg("-C")
            .arg(&self.repo_root)
            .arg(target)
            .envs(env.iter())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|source| ProvisionError::Spawn {
                command: command.clone(),
                source,
            })?;

        if !status.success() {
            return Err(ProvisionError::Exit {
                command,
                code: status.code(),
            });
        }
        Ok(())
    }

    fn state_path(&self, env: &EnvOverlay) -> Result<PathBuf, ProvisionError> {
        let cluster = env
            .get(CLUSTER_ENV)
            .ok_or_else(|| ProvisionError::Output(format!("{} not set in overlay", CLUSTER_ENV)))?;
        Ok(build_dir(&self.repo_root, cluster).join("terraform.tfstate"))
    }
}

/// Build directory for a cluster inside the installer repository
pub fn build_dir(repo_root: &Path, cluster: &str) -> PathBuf {
    repo_root.join("build").join(cluster)
}

#[async_trait]
impl Provisioner for MakeProvisioner {
    async fn plan(&self, env: &EnvOverlay) -> Result<(), ProvisionError> {
        self.run_target("plan", env).await
    }

    async fn apply(&self, env: &EnvOverlay) -> Result<(), ProvisionError> {
        self.run_target("apply", env).await
    }

    async fn destroy(&self, env: &EnvOverlay) -> Result<(), ProvisionError> {
        self.run_target("destroy", env).await
    }

    async fn clean(&self, env: &EnvOverlay) -> Result<(), ProvisionError> {
        self.run_target("clean", env).await
    }

    async fn control_plane_hosts(&self, env: &EnvOverlay) -> Result<Vec<String>, ProvisionError> {
        let state = self.state_path(env)?;
        let command = format!("terraform output -json -state={}", state.display());
        debug!("Running {}", command);

        let output = Command::new("terraform")
            .arg("output")
            .arg("-json")
            .arg(format!("-state={}", state.display()))
            .envs(env.iter())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| ProvisionError::Spawn {
                command: command.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(ProvisionError::Exit {
                command,
                code: output.status.code(),
            });
        }

        parse_hosts_output(&String::from_utf8_lossy(&output.stdout), &self.hosts_output)
    }
}

/// Extract a list of addresses from `terraform output -json`.
///
/// Accepts a list of strings or a single comma-separated string, the two
/// shapes installer modules use for address outputs.
pub fn parse_hosts_output(json: &str, output: &str) -> Result<Vec<String>, ProvisionError> {
    let outputs: serde_json::Value = serde_json::from_str(json)
        .map_err(|e| ProvisionError::Output(format!("terraform output is not JSON: {}", e)))?;

    let value = outputs
        .get(output)
        .and_then(|o| o.get("value"))
        .ok_or_else(|| ProvisionError::Output(format!("output {} not found", output)))?;

    let hosts: Vec<String> = match value {
        serde_json::Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        serde_json::Value::String(s) => s
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        other => {
            return Err(ProvisionError::Output(format!(
                "output {} has unexpected shape: {}",
                output, other
            )))
        }
    };

    if hosts.is_empty() {
        return Err(ProvisionError::Output(format!("output {} is empty", output)));
    }
    Ok(hosts)
}
