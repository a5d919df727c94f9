//! Best-effort log capture from control-plane hosts
//!
//! Runs when bootstrapping fails. Every failure here is logged and swallowed
//! so the original bootstrap error is what reaches the caller.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use crate::remote::{HostSet, RemoteExecutor};

/// Services whose journals are captured from every host
pub const DIAGNOSTIC_SERVICES: [&str; 4] = ["bootkube", "tectonic", "kubelet", "k8s-node-bootstrap"];

const CONTAINER_LOGS_COMMAND: &str =
    "docker ps -a; for c in $(docker ps -aq); do echo \"=== $c\"; docker logs $c 2>&1; done";

/// What a collection pass managed to save
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DiagnosticsReport {
    /// Files written
    pub collected: Vec<PathBuf>,
    /// Commands or writes that failed
    pub failures: usize,
}

/// Saves container-runtime and service logs for every host.
#[derive(Clone)]
pub struct DiagnosticsCollector {
    remote: Arc<dyn RemoteExecutor>,
    cluster_name: String,
    output_dir: PathBuf,
}

impl DiagnosticsCollector {
    /// Collector writing under `output_dir/<host>/`
    pub fn new(
        remote: Arc<dyn RemoteExecutor>,
        cluster_name: impl Into<String>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            remote,
            cluster_name: cluster_name.into(),
            output_dir: output_dir.into(),
        }
    }

    /// Collect logs from every host, one host and one command at a time
    pub async fn collect(&self, hosts: &HostSet) -> DiagnosticsReport {
        let mut report = DiagnosticsReport::default();

        for host in hosts.iter() {
            let host_dir = self.output_dir.join(host);
            if let Err(e) = tokio::fs::create_dir_all(&host_dir).await {
                warn!(host = %host, error = %e, "Failed to create diagnostics directory");
                report.failures += 1 + DIAGNOSTIC_SERVICES.len();
                continue;
            }

            let docker_log = host_dir.join(format!("{}-docker.log", self.cluster_name));
            self.save(host, CONTAINER_LOGS_COMMAND, &docker_log, &mut report)
                .await;

            for service in DIAGNOSTIC_SERVICES {
                let command = format!("sudo journalctl --no-pager -u {}", service);
                let path = host_dir.join(format!("{}.log", service));
                self.save(host, &command, &path, &mut report).await;
            }
        }

        info!(
            collected = report.collected.len(),
            failures = report.failures,
            dir = %self.output_dir.display(),
            "Diagnostics collected"
        );
        report
    }

    async fn save(&self, host: &str, command: &str, path: &Path, report: &mut DiagnosticsReport) {
        let output = match self.remote.execute(host, command).await {
            Ok(output) => output,
            Err(e) => {
                warn!(host = %host, command = %command, error = %e, "Failed to fetch logs");
                report.failures += 1;
                return;
            }
        };

        if !output.success() {
            warn!(
                host = %host,
                command = %command,
                exit_code = output.exit_code,
                stderr = %output.stderr.trim(),
                "Log command exited non-zero"
            );
            report.failures += 1;
        }

        match tokio::fs::write(path, output.stdout.as_bytes()).await {
            Ok(()) => {
                info!(host = %host, path = %path.display(), "Saved logs");
                report.collected.push(path.to_path_buf());
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to write logs");
                report.failures += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{CommandOutput, MockRemoteExecutor, RemoteError};

    fn hosts(list: &[&str]) -> HostSet {
        HostSet::new(list.iter().map(|h| h.to_string()))
    }

    #[tokio::test]
    async fn saves_docker_and_service_logs_per_host() {
        let dir = tempfile::tempdir().unwrap();
        let mut remote = MockRemoteExecutor::new();
        remote.expect_execute().times(10).returning(|host, command| {
            Ok(CommandOutput {
                stdout: format!("{} :: {}", host, command),
                ..Default::default()
            })
        });

        let collector = DiagnosticsCollector::new(Arc::new(remote), "smoke-abc123", dir.path());
        let report = collector.collect(&hosts(&["10.0.0.1", "10.0.0.2"])).await;

        assert_eq!(report.collected.len(), 10);
        assert_eq!(report.failures, 0);

        let docker = dir.path().join("10.0.0.1").join("smoke-abc123-docker.log");
        assert!(std::fs::read_to_string(docker).unwrap().contains("docker ps"));
        let kubelet = dir.path().join("10.0.0.2").join("kubelet.log");
        assert!(std::fs::read_to_string(kubelet)
            .unwrap()
            .contains("journalctl --no-pager -u kubelet"));
    }

    #[tokio::test]
    async fn unreachable_host_does_not_stop_collection() {
        let dir = tempfile::tempdir().unwrap();
        let mut remote = MockRemoteExecutor::new();
        remote.expect_execute().returning(|host, _| {
            if host == "10.0.0.1" {
                Err(RemoteError::Transport {
                    host: host.to_string(),
                    message: "Connection refused".to_string(),
                })
            } else {
                Ok(CommandOutput::default())
            }
        });

        let collector = DiagnosticsCollector::new(Arc::new(remote), "c", dir.path());
        let report = collector.collect(&hosts(&["10.0.0.1", "10.0.0.2"])).await;

        assert_eq!(report.failures, 5);
        assert_eq!(report.collected.len(), 5);
        assert!(report
            .collected
            .iter()
            .all(|p| p.starts_with(dir.path().join("10.0.0.2"))));
    }

    #[tokio::test]
    async fn non_zero_exit_is_counted_but_output_kept() {
        let dir = tempfile::tempdir().unwrap();
        let mut remote = MockRemoteExecutor::new();
        remote.expect_execute().returning(|_, _| {
            Ok(CommandOutput {
                stdout: "partial".to_string(),
                stderr: "No journal files were found.".to_string(),
                exit_code: 1,
            })
        });

        let collector = DiagnosticsCollector::new(Arc::new(remote), "c", dir.path());
        let report = collector.collect(&hosts(&["h"])).await;

        assert_eq!(report.failures, 5);
        assert_eq!(report.collected.len(), 5);
    }
}
