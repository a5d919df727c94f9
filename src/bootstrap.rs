//! Bootstrap watcher
//!
//! Each bootstrap service drops a marker file on the control-plane host that
//! ran it. The cluster is bootstrapped once every service in
//! [`BOOTSTRAP_SERVICES`] has left its marker on at least one host.

use std::sync::Arc;
use std::time::Duration;

use lifecycle_common::{poll_until, PollError, PollPolicy};
use tracing::{error, info, warn};

use crate::diagnostics::DiagnosticsCollector;
use crate::error::Error;
use crate::remote::{HostSet, RemoteExecutor};
use crate::Result;

/// Services waited on, in order
pub const BOOTSTRAP_SERVICES: [&str; 2] = ["bootkube", "tectonic"];

/// 180 polls, 10 seconds apart: 30 minutes per service
pub const BOOTSTRAP_POLL_POLICY: PollPolicy =
    PollPolicy::new(Duration::from_secs(10), Duration::from_secs(30 * 60)).with_max_polls(180);

/// Emit a progress line every this many polls
const PROGRESS_EVERY: u32 = 5;

/// Shell command succeeding once `service` has finished bootstrapping
pub fn marker_command(service: &str) -> String {
    format!("test -e /opt/tectonic/init_{}.done", service)
}

/// Waits for bootstrap markers on the control-plane hosts.
pub struct BootstrapWatcher {
    remote: Arc<dyn RemoteExecutor>,
    diagnostics: DiagnosticsCollector,
    policy: PollPolicy,
}

impl BootstrapWatcher {
    /// Watcher using the standard poll policy
    pub fn new(remote: Arc<dyn RemoteExecutor>, diagnostics: DiagnosticsCollector) -> Self {
        Self {
            remote,
            diagnostics,
            policy: BOOTSTRAP_POLL_POLICY,
        }
    }

    /// Override the poll policy
    pub fn with_policy(mut self, policy: PollPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Wait for every bootstrap service in order.
    ///
    /// On failure, logs are collected from every host before the error is
    /// returned.
    pub async fn wait_for_bootstrapping(&self, hosts: &HostSet) -> Result<()> {
        match self.wait_for_services(hosts).await {
            Ok(()) => {
                info!(hosts = %hosts, "Cluster bootstrapped");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, hosts = %hosts, "Bootstrapping failed, collecting diagnostics");
                let report = self.diagnostics.collect(hosts).await;
                if report.failures > 0 {
                    warn!(failures = report.failures, "Some diagnostics could not be collected");
                }
                Err(e)
            }
        }
    }

    async fn wait_for_services(&self, hosts: &HostSet) -> Result<()> {
        for service in BOOTSTRAP_SERVICES {
            self.wait_for_service(service, hosts).await?;
        }
        Ok(())
    }

    /// Poll until any host reports `service`'s marker. Returns that host.
    pub async fn wait_for_service(&self, service: &str, hosts: &HostSet) -> Result<String> {
        let description = format!("{} service to bootstrap", service);
        let mut polls = 0u32;

        let result = poll_until(&self.policy, &description, || {
            polls += 1;
            let poll = polls;
            async move {
                let finished = self.finished_on_any(service, hosts).await;
                if finished.is_none() && poll % PROGRESS_EVERY == 0 {
                    info!(service = %service, poll, "Waiting for bootstrapping of {} service to complete", service);
                    info!("Checked master nodes: {}", hosts);
                }
                Ok(finished)
            }
        })
        .await;

        match result {
            Ok(host) => Ok(host),
            Err(PollError::Exhausted { polls, .. }) => Err(Error::BootstrapTimeout {
                service: service.to_string(),
                hosts_checked: hosts.to_vec(),
                polls,
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// First host, in order, whose marker for `service` exists.
    ///
    /// Hosts after the first match are not checked. Unreachable hosts count
    /// as not finished.
    pub async fn finished_on_any(&self, service: &str, hosts: &HostSet) -> Option<String> {
        let command = marker_command(service);

        for host in hosts.iter() {
            match self.remote.execute(host, &command).await {
                Ok(output) if output.success() => {
                    info!(service = %service, host = %host, "{} service finished successfully", service);
                    return Some(host.to_string());
                }
                Ok(_) => {}
                Err(e) => warn!(host = %host, error = %e, "Failed to check bootstrap marker"),
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{CommandOutput, MockRemoteExecutor, RemoteError};
    use mockall::predicate::{always, eq};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn hosts(n: usize) -> HostSet {
        HostSet::new((1..=n).map(|i| format!("10.0.0.{}", i)))
    }

    fn exit(code: i32) -> CommandOutput {
        CommandOutput {
            exit_code: code,
            ..Default::default()
        }
    }

    fn watcher(remote: MockRemoteExecutor, dir: &std::path::Path) -> BootstrapWatcher {
        let remote: Arc<dyn RemoteExecutor> = Arc::new(remote);
        let diagnostics = DiagnosticsCollector::new(remote.clone(), "smoke", dir);
        BootstrapWatcher::new(remote, diagnostics)
    }

    #[test]
    fn marker_path_names_the_service() {
        assert_eq!(
            marker_command("bootkube"),
            "test -e /opt/tectonic/init_bootkube.done"
        );
    }

    #[tokio::test]
    async fn first_host_with_marker_wins_and_later_hosts_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let command = marker_command("bootkube");
        let mut remote = MockRemoteExecutor::new();
        remote
            .expect_execute()
            .with(eq("10.0.0.1"), eq(command.clone()))
            .times(1)
            .returning(|_, _| Ok(exit(1)));
        remote
            .expect_execute()
            .with(eq("10.0.0.2"), always())
            .times(1)
            .returning(|host, _| {
                Err(RemoteError::Transport {
                    host: host.to_string(),
                    message: "Connection timed out".to_string(),
                })
            });
        remote
            .expect_execute()
            .with(eq("10.0.0.3"), always())
            .times(1)
            .returning(|_, _| Ok(exit(0)));
        remote
            .expect_execute()
            .with(eq("10.0.0.4"), always())
            .times(0);
        remote
            .expect_execute()
            .with(eq("10.0.0.5"), always())
            .times(0);

        let watcher = watcher(remote, dir.path());
        let host = watcher.finished_on_any("bootkube", &hosts(5)).await;

        assert_eq!(host.as_deref(), Some("10.0.0.3"));
    }

    #[tokio::test(start_paused = true)]
    async fn waits_until_marker_appears() {
        let dir = tempfile::tempdir().unwrap();
        let checks = Arc::new(AtomicU32::new(0));
        let checks_clone = checks.clone();

        let mut remote = MockRemoteExecutor::new();
        remote.expect_execute().returning(move |host, _| {
            let n = checks_clone.fetch_add(1, Ordering::SeqCst) + 1;
            // Two hosts per poll; the first host finishes on the fifth poll
            if host == "10.0.0.1" && n >= 9 {
                Ok(exit(0))
            } else {
                Ok(exit(1))
            }
        });

        let watcher = watcher(remote, dir.path());
        let start = tokio::time::Instant::now();
        let host = watcher.wait_for_service("tectonic", &hosts(2)).await.unwrap();

        assert_eq!(host, "10.0.0.1");
        assert_eq!(checks.load(Ordering::SeqCst), 9);
        assert_eq!(start.elapsed(), Duration::from_secs(40));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_names_service_and_hosts_and_collects_diagnostics() {
        let dir = tempfile::tempdir().unwrap();
        let marker_checks = Arc::new(AtomicU32::new(0));
        let log_fetches = Arc::new(AtomicU32::new(0));
        let (m, l) = (marker_checks.clone(), log_fetches.clone());

        let mut remote = MockRemoteExecutor::new();
        remote.expect_execute().returning(move |_, command| {
            if command.starts_with("test -e") {
                m.fetch_add(1, Ordering::SeqCst);
                Ok(exit(1))
            } else {
                l.fetch_add(1, Ordering::SeqCst);
                Ok(CommandOutput {
                    stdout: "log line".to_string(),
                    ..Default::default()
                })
            }
        });

        let policy = PollPolicy::new(Duration::from_secs(10), Duration::from_secs(1800))
            .with_max_polls(3);
        let watcher = watcher(remote, dir.path()).with_policy(policy);

        let err = watcher.wait_for_bootstrapping(&hosts(2)).await.unwrap_err();

        match err {
            Error::BootstrapTimeout {
                service,
                hosts_checked,
                polls,
            } => {
                assert_eq!(service, "bootkube");
                assert_eq!(hosts_checked, vec!["10.0.0.1", "10.0.0.2"]);
                assert_eq!(polls, 3);
            }
            other => panic!("expected bootstrap timeout, got {:?}", other),
        }
        assert_eq!(marker_checks.load(Ordering::SeqCst), 6);
        assert_eq!(log_fetches.load(Ordering::SeqCst), 10);
        assert!(dir.path().join("10.0.0.2").join("bootkube.log").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn standard_policy_gives_up_after_thirty_minutes() {
        let dir = tempfile::tempdir().unwrap();
        let checks = Arc::new(AtomicU32::new(0));
        let checks_clone = checks.clone();

        let mut remote = MockRemoteExecutor::new();
        remote.expect_execute().returning(move |_, _| {
            checks_clone.fetch_add(1, Ordering::SeqCst);
            Ok(exit(1))
        });

        let watcher = watcher(remote, dir.path());
        let start = tokio::time::Instant::now();
        let err = watcher.wait_for_service("bootkube", &hosts(1)).await.unwrap_err();
        let elapsed = start.elapsed();

        assert!(matches!(err, Error::BootstrapTimeout { polls: 180, .. }));
        assert_eq!(checks.load(Ordering::SeqCst), 180);
        assert!(elapsed >= Duration::from_secs(1800) - BOOTSTRAP_POLL_POLICY.interval);
        assert!(elapsed <= Duration::from_secs(1800) + BOOTSTRAP_POLL_POLICY.interval);
    }

    #[tokio::test(start_paused = true)]
    async fn bootkube_then_tectonic() {
        let dir = tempfile::tempdir().unwrap();
        let mut seq = mockall::Sequence::new();
        let mut remote = MockRemoteExecutor::new();
        remote
            .expect_execute()
            .with(eq("10.0.0.1"), eq(marker_command("bootkube")))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(exit(0)));
        remote
            .expect_execute()
            .with(eq("10.0.0.1"), eq(marker_command("tectonic")))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(exit(0)));

        let watcher = watcher(remote, dir.path());
        watcher.wait_for_bootstrapping(&hosts(1)).await.unwrap();
        assert!(!dir.path().join("10.0.0.1").exists());
    }
}
