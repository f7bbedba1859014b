//! Provisioning run across the configured hosts
//!
//! Hosts are processed in list order. With `concurrency > 1` several hosts
//! are in flight at once but results are still reported in list order.
//! The run checks the cancellation token before dialing each host.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use zeroize::Zeroizing;

use crate::config::ProvisionConfig;
use crate::ssh::{
    HostKeyPrompt, InstallOutcome, KeyPairStatus, KeyStore, KnownHostsStore, RemoteKeyInstaller,
    SshError, TrustedHostVerifier,
};

/// One step of the run: install the deployer key on a single host
#[async_trait]
pub trait HostProvisioner: Send + Sync {
    /// Runs once before any host is contacted
    async fn prepare(&self) -> Result<KeyPairStatus, SshError>;

    async fn provision_host(&self, host: &str) -> Result<InstallOutcome, SshError>;
}

/// [`HostProvisioner`] backed by a real SSH connection per host
pub struct SshProvisioner {
    installer: RemoteKeyInstaller,
    port: u16,
    username: String,
    password: Zeroizing<String>,
    authorized_keys_path: String,
    timeout: Duration,
}

impl SshProvisioner {
    /// Wire key store, known hosts and verifier from `config`
    pub fn from_config(
        config: &ProvisionConfig,
        prompt: Arc<dyn HostKeyPrompt>,
    ) -> Result<Self, SshError> {
        let keystore = Arc::new(KeyStore::from_config(config)?);
        let known_hosts = KnownHostsStore::new(config.known_hosts_file());
        let verifier = Arc::new(TrustedHostVerifier::new(
            known_hosts,
            config.strict_host_key_checking,
            prompt,
        ));

        Ok(Self {
            installer: RemoteKeyInstaller::new(keystore, verifier),
            port: config.port,
            username: config.username.clone(),
            password: Zeroizing::new(config.password.clone()),
            authorized_keys_path: config.authorized_keys_path.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        })
    }

    pub fn installer(&self) -> &RemoteKeyInstaller {
        &self.installer
    }
}

#[async_trait]
impl HostProvisioner for SshProvisioner {
    async fn prepare(&self) -> Result<KeyPairStatus, SshError> {
        let status = self.installer.ensure_local_key().await?;
        let keystore = self.installer.keystore();
        match status {
            KeyPairStatus::Generated => info!(
                "Generated SSH key pair {} / {}",
                keystore.private_key_path().display(),
                keystore.public_key_path().display()
            ),
            KeyPairStatus::Existing => info!(
                "Using existing SSH key {}",
                keystore.private_key_path().display()
            ),
        }
        Ok(status)
    }

    async fn provision_host(&self, host: &str) -> Result<InstallOutcome, SshError> {
        self.installer
            .provision(
                host,
                self.port,
                &self.username,
                &self.password,
                &self.authorized_keys_path,
                self.timeout,
            )
            .await
    }
}

/// Result for one attempted host
#[derive(Debug)]
pub struct HostOutcome {
    pub host: String,
    pub result: Result<InstallOutcome, SshError>,
}

/// Everything a run did, in host-list order
#[derive(Debug, Default)]
pub struct ProvisionReport {
    pub outcomes: Vec<HostOutcome>,
    /// Hosts never dialed because the run was cancelled or stopped early
    pub skipped: Vec<String>,
}

impl ProvisionReport {
    pub fn succeeded(&self) -> impl Iterator<Item = &HostOutcome> {
        self.outcomes.iter().filter(|o| o.result.is_ok())
    }

    pub fn failed(&self) -> impl Iterator<Item = &HostOutcome> {
        self.outcomes.iter().filter(|o| o.result.is_err())
    }

    /// True when every host was attempted and none failed
    pub fn is_success(&self) -> bool {
        self.skipped.is_empty() && self.failed().next().is_none()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    pub concurrency: usize,
    pub continue_on_error: bool,
}

impl From<&ProvisionConfig> for RunOptions {
    fn from(config: &ProvisionConfig) -> Self {
        Self {
            concurrency: config.concurrency,
            continue_on_error: config.continue_on_error,
        }
    }
}

/// Provision every host in `hosts`
///
/// The local key is prepared once up front; a failure there aborts the run
/// before any host is contacted. Without `continue_on_error` the first
/// failing host stops new hosts from starting; hosts already in flight
/// finish and are reported.
pub async fn run<P>(
    provisioner: &P,
    hosts: &[String],
    options: RunOptions,
    cancel: &CancellationToken,
) -> Result<ProvisionReport, SshError>
where
    P: HostProvisioner + ?Sized,
{
    provisioner.prepare().await?;

    let stop = cancel.child_token();
    let mut report = ProvisionReport::default();

    let mut results = std::pin::pin!(stream::iter(hosts.iter().cloned())
        .map(|host| {
            let stop = stop.clone();
            async move {
                if stop.is_cancelled() {
                    return (host, None);
                }
                let result = provisioner.provision_host(&host).await;
                (host, Some(result))
            }
        })
        .buffered(options.concurrency.max(1)));

    while let Some((host, result)) = results.next().await {
        let Some(result) = result else {
            report.skipped.push(host);
            continue;
        };

        if let Err(e) = &result {
            error!("Provisioning {} failed: {}", host, e);
            if !options.continue_on_error && !stop.is_cancelled() {
                warn!("Stopping after failure on {}", host);
                stop.cancel();
            }
        }
        report.outcomes.push(HostOutcome { host, result });
    }

    if cancel.is_cancelled() && !report.skipped.is_empty() {
        warn!(
            "Run cancelled, {} host(s) not provisioned",
            report.skipped.len()
        );
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeProvisioner {
        failing: Vec<&'static str>,
        prepare_fails: bool,
        prepared: AtomicUsize,
        contacted: Mutex<Vec<String>>,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        cancel_on: Option<(&'static str, CancellationToken)>,
    }

    #[async_trait]
    impl HostProvisioner for FakeProvisioner {
        async fn prepare(&self) -> Result<KeyPairStatus, SshError> {
            self.prepared.fetch_add(1, Ordering::SeqCst);
            if self.prepare_fails {
                return Err(SshError::KeyGeneration("no entropy".to_string()));
            }
            Ok(KeyPairStatus::Generated)
        }

        async fn provision_host(&self, host: &str) -> Result<InstallOutcome, SshError> {
            self.contacted.lock().push(host.to_string());
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if let Some((trigger, token)) = &self.cancel_on {
                if host == *trigger {
                    token.cancel();
                }
            }
            if self.failing.iter().any(|f| *f == host) {
                return Err(SshError::ConnectionFailed {
                    host: host.to_string(),
                    message: "connection refused".to_string(),
                });
            }
            Ok(InstallOutcome::Installed)
        }
    }

    fn hosts(names: &[&str]) -> Vec<String> {
        names.iter().map(|h| h.to_string()).collect()
    }

    fn options(concurrency: usize, continue_on_error: bool) -> RunOptions {
        RunOptions {
            concurrency,
            continue_on_error,
        }
    }

    #[tokio::test]
    async fn test_sequential_run_keeps_order_and_prepares_once() {
        let fake = FakeProvisioner::default();
        let report = run(
            &fake,
            &hosts(&["a", "b", "c"]),
            options(1, false),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(report.is_success());
        assert_eq!(fake.prepared.load(Ordering::SeqCst), 1);
        assert_eq!(*fake.contacted.lock(), vec!["a", "b", "c"]);
        assert_eq!(fake.peak.load(Ordering::SeqCst), 1);
        let order: Vec<_> = report.outcomes.iter().map(|o| o.host.as_str()).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_prepare_failure_contacts_no_host() {
        let fake = FakeProvisioner {
            prepare_fails: true,
            ..Default::default()
        };
        let err = run(
            &fake,
            &hosts(&["a"]),
            options(1, false),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, SshError::KeyGeneration(_)));
        assert!(fake.contacted.lock().is_empty());
    }

    #[tokio::test]
    async fn test_fail_fast_skips_remaining_hosts() {
        let fake = FakeProvisioner {
            failing: vec!["b"],
            ..Default::default()
        };
        let report = run(
            &fake,
            &hosts(&["a", "b", "c", "d"]),
            options(1, false),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(!report.is_success());
        assert_eq!(*fake.contacted.lock(), vec!["a", "b"]);
        assert_eq!(report.skipped, vec!["c", "d"]);
        assert_eq!(report.failed().count(), 1);
    }

    #[tokio::test]
    async fn test_continue_on_error_attempts_every_host() {
        let fake = FakeProvisioner {
            failing: vec!["b"],
            ..Default::default()
        };
        let report = run(
            &fake,
            &hosts(&["a", "b", "c"]),
            options(1, true),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(report.skipped.is_empty());
        assert_eq!(report.succeeded().count(), 2);
        let failed: Vec<_> = report.failed().map(|o| o.host.as_str()).collect();
        assert_eq!(failed, vec!["b"]);
    }

    #[tokio::test]
    async fn test_cancellation_is_checked_before_each_host() {
        let token = CancellationToken::new();
        let fake = FakeProvisioner {
            cancel_on: Some(("a", token.clone())),
            ..Default::default()
        };
        let report = run(&fake, &hosts(&["a", "b", "c"]), options(1, true), &token)
            .await
            .unwrap();

        assert_eq!(*fake.contacted.lock(), vec!["a"]);
        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(report.skipped, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_already_cancelled_run_dials_nothing() {
        let token = CancellationToken::new();
        token.cancel();
        let fake = FakeProvisioner::default();
        let report = run(&fake, &hosts(&["a", "b"]), options(2, false), &token)
            .await
            .unwrap();

        assert!(fake.contacted.lock().is_empty());
        assert_eq!(report.skipped, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_bounded_concurrency_reports_in_list_order() {
        let fake = FakeProvisioner::default();
        let report = run(
            &fake,
            &hosts(&["a", "b", "c", "d", "e"]),
            options(2, false),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(report.is_success());
        assert!(fake.peak.load(Ordering::SeqCst) <= 2);
        let order: Vec<_> = report.outcomes.iter().map(|o| o.host.as_str()).collect();
        assert_eq!(order, vec!["a", "b", "c", "d", "e"]);
    }

    #[test]
    fn test_run_options_from_config() {
        let config = ProvisionConfig {
            concurrency: 4,
            continue_on_error: true,
            ..Default::default()
        };
        let options = RunOptions::from(&config);
        assert_eq!(options.concurrency, 4);
        assert!(options.continue_on_error);
    }
}
