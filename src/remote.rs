//! Remote command execution on cluster hosts
//!
//! Hosts are reached over OpenSSH in batch mode. A non-zero exit from the
//! remote command is a normal outcome (the caller decides what it means);
//! only failures of the transport itself are errors.

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::process::Command;
use tracing::debug;

/// Exit status OpenSSH reserves for its own failures
const SSH_TRANSPORT_EXIT: i32 = 255;

/// Default login user on control-plane hosts
pub const DEFAULT_SSH_USER: &str = "core";

/// Output of a command run on a remote host
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
    /// Exit code of the remote command
    pub exit_code: i32,
}

impl CommandOutput {
    /// Whether the remote command exited with status 0
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Transport-level failures reaching a host
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    /// The ssh client could not be started
    #[error("failed to start ssh for {host}: {source}")]
    Spawn {
        /// Target host
        host: String,
        /// Underlying IO error
        #[source]
        source: std::io::Error,
    },

    /// ssh could not connect or authenticate
    #[error("ssh transport to {host} failed: {message}")]
    Transport {
        /// Target host
        host: String,
        /// ssh's own diagnostic output
        message: String,
    },

    /// The command did not complete in time
    #[error("command on {host} timed out after {timeout:?}")]
    Timeout {
        /// Target host
        host: String,
        /// Configured command timeout
        timeout: Duration,
    },
}

/// Trait for running shell commands on a host
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Run `command` on `host` and capture its output
    async fn execute(&self, host: &str, command: &str) -> Result<CommandOutput, RemoteError>;
}

/// Ordered, immutable set of control-plane host addresses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostSet(Vec<String>);

impl HostSet {
    /// Build a host set, preserving order and dropping duplicates
    pub fn new(hosts: impl IntoIterator<Item = String>) -> Self {
        let mut ordered: Vec<String> = Vec::new();
        for host in hosts {
            if !ordered.contains(&host) {
                ordered.push(host);
            }
        }
        Self(ordered)
    }

    /// Iterate over hosts in order
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Number of hosts
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set has no hosts
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Hosts as owned strings, for error context
    pub fn to_vec(&self) -> Vec<String> {
        self.0.clone()
    }
}

impl fmt::Display for HostSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.0.join(", "))
    }
}

/// Ceiling for one remote command unless overridden
pub const DEFAULT_SSH_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

/// OpenSSH-backed executor.
pub struct SshExecutor {
    user: String,
    identity_file: Option<PathBuf>,
    connect_timeout: Duration,
    command_timeout: Duration,
}

impl Default for SshExecutor {
    fn default() -> Self {
        Self {
            user: DEFAULT_SSH_USER.to_string(),
            identity_file: None,
            connect_timeout: Duration::from_secs(10),
            command_timeout: DEFAULT_SSH_COMMAND_TIMEOUT,
        }
    }
}

impl SshExecutor {
    /// Executor logging in as `user`
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            ..Default::default()
        }
    }

    /// Authenticate with a specific private key
    pub fn with_identity_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.identity_file = Some(path.into());
        self
    }

    /// Override the per-command timeout
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    fn ssh_args(&self, host: &str, command: &str) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs()),
        ];
        if let Some(key) = &self.identity_file {
            args.push("-i".to_string());
            args.push(key.display().to_string());
        }
        args.push(format!("{}@{}", self.user, host));
        args.push(command.to_string());
        args
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn execute(&self, host: &str, command: &str) -> Result<CommandOutput, RemoteError> {
        debug!(host = %host, command = %command, "Running remote command");

        let child = Command::new("ssh")
            .args(self.ssh_args(host, command))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.command_timeout, child)
            .await
            .map_err(|_| RemoteError::Timeout {
                host: host.to_string(),
                timeout: self.command_timeout,
            })?
            .map_err(|source| RemoteError::Spawn {
                host: host.to_string(),
                source,
            })?;

        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let exit_code = match output.status.code() {
            Some(SSH_TRANSPORT_EXIT) | None => {
                return Err(RemoteError::Transport {
                    host: host.to_string(),
                    message: stderr.trim().to_string(),
                })
            }
            Some(code) => code,
        };

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr,
            exit_code,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_set_keeps_order_and_drops_duplicates() {
        let hosts = HostSet::new(
            ["10.0.0.2", "10.0.0.1", "10.0.0.2"]
                .into_iter()
                .map(String::from),
        );
        assert_eq!(hosts.iter().collect::<Vec<_>>(), vec!["10.0.0.2", "10.0.0.1"]);
        assert_eq!(hosts.len(), 2);
        assert_eq!(hosts.to_string(), "[10.0.0.2, 10.0.0.1]");
    }

    #[test]
    fn ssh_args_target_user_at_host_in_batch_mode() {
        let ssh = SshExecutor::new("core").with_identity_file("/keys/id_rsa");
        let args = ssh.ssh_args("10.0.0.1", "test -e /opt/tectonic/init_bootkube.done");

        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(args.contains(&"ConnectTimeout=10".to_string()));
        let key = args.iter().position(|a| a == "-i").unwrap();
        assert_eq!(args[key + 1], "/keys/id_rsa");
        assert_eq!(args[args.len() - 2], "core@10.0.0.1");
        assert_eq!(args[args.len() - 1], "test -e /opt/tectonic/init_bootkube.done");
    }

    #[test]
    fn command_timeout_defaults_and_overrides() {
        assert_eq!(SshExecutor::default().command_timeout, DEFAULT_SSH_COMMAND_TIMEOUT);
        let ssh = SshExecutor::new("core").with_command_timeout(Duration::from_secs(30));
        assert_eq!(ssh.command_timeout, Duration::from_secs(30));
    }

    #[test]
    fn ssh_args_without_identity_file() {
        let args = SshExecutor::default().ssh_args("h", "true");
        assert!(!args.contains(&"-i".to_string()));
        assert_eq!(args[args.len() - 2], "core@h");
    }

    #[test]
    fn command_output_success_is_exit_zero() {
        let ok = CommandOutput::default();
        let failed = CommandOutput {
            exit_code: 1,
            ..Default::default()
        };
        assert!(ok.success());
        assert!(!failed.success());
    }
}
