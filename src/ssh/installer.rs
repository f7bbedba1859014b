//! Public key installation on remote hosts
//!
//! Appends the deployer's public key to the remote `authorized_keys` file
//! unless the exact line is already there, so repeated runs never duplicate it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info};

use super::client::{ConnectTarget, SshClient};
use super::error::SshError;
use super::keystore::{KeyPairStatus, KeyStore};
use super::session::RemoteShell;
use super::verifier::TrustedHostVerifier;

const MARK_PRESENT: &str = "appdeployer:key-present";
const MARK_INSTALLED: &str = "appdeployer:key-installed";

/// What happened to the remote authorized_keys file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    Installed,
    AlreadyPresent,
}

/// Quote `value` for a POSIX shell
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// Quote a remote path, leaving a leading `~/` for the remote shell to expand
pub fn remote_path_arg(path: &str) -> String {
    if path == "~" {
        return "~".to_string();
    }
    match path.strip_prefix("~/") {
        Some(rest) => format!("~/{}", shell_quote(rest)),
        None => shell_quote(path),
    }
}

/// Shell command that appends `key_line` to `remote_path` only when absent
///
/// Creates the parent directory (0700) and file (0600) if needed, repairs a
/// missing trailing newline before appending, and prints a marker telling
/// which branch ran.
pub fn append_if_absent_command(key_line: &str, remote_path: &str) -> String {
    format!(
        "umask 077; KEY={key}; FILE={file}; \
         mkdir -p \"$(dirname \"$FILE\")\" && touch \"$FILE\" && \
         if grep -qxF \"$KEY\" \"$FILE\"; then echo {present}; \
         else \
         if [ -s \"$FILE\" ] && [ -n \"$(tail -c 1 \"$FILE\")\" ]; then echo >> \"$FILE\"; fi && \
         printf '%s\\n' \"$KEY\" >> \"$FILE\" && echo {installed}; fi",
        key = shell_quote(key_line),
        file = remote_path_arg(remote_path),
        present = MARK_PRESENT,
        installed = MARK_INSTALLED,
    )
}

/// Run the conditional append through `shell`
pub async fn install_public_key<S>(
    shell: &mut S,
    key_line: &str,
    remote_path: &str,
) -> Result<InstallOutcome, SshError>
where
    S: RemoteShell + ?Sized,
{
    let command = append_if_absent_command(key_line, remote_path);
    let output = shell.exec(&command).await?;

    if !output.success() {
        let status = output
            .exit_status
            .map(|s| s.to_string())
            .unwrap_or_else(|| "none".to_string());
        return Err(SshError::RemoteCommand {
            host: shell.host().to_string(),
            message: format!(
                "updating {} exited with status {}: {}",
                remote_path,
                status,
                output.stderr.trim()
            ),
        });
    }

    match output.stdout.lines().map(str::trim).last() {
        Some(MARK_PRESENT) => Ok(InstallOutcome::AlreadyPresent),
        Some(MARK_INSTALLED) => Ok(InstallOutcome::Installed),
        _ => Err(SshError::RemoteCommand {
            host: shell.host().to_string(),
            message: format!("unexpected output: {:?}", output.stdout.trim()),
        }),
    }
}

/// Connects to hosts and installs the local public key
pub struct RemoteKeyInstaller {
    keystore: Arc<KeyStore>,
    client: SshClient,
    /// Serialises first-time key generation between concurrent hosts
    keygen_lock: Mutex<()>,
}

impl RemoteKeyInstaller {
    pub fn new(keystore: Arc<KeyStore>, verifier: Arc<TrustedHostVerifier>) -> Self {
        Self {
            keystore,
            client: SshClient::new(verifier),
            keygen_lock: Mutex::new(()),
        }
    }

    pub fn keystore(&self) -> &KeyStore {
        &self.keystore
    }

    /// Make sure a local key pair exists, generating it at most once
    pub async fn ensure_local_key(&self) -> Result<KeyPairStatus, SshError> {
        let _guard = self.keygen_lock.lock().await;
        if self.keystore.exists() {
            return Ok(KeyPairStatus::Existing);
        }

        let keystore = self.keystore.clone();
        tokio::task::spawn_blocking(move || keystore.ensure_key_pair())
            .await
            .map_err(|e| SshError::KeyGeneration(format!("key generation task failed: {}", e)))?
    }

    /// Install the local public key into `authorized_keys_path` on `host:port`
    pub async fn provision(
        &self,
        host: &str,
        port: u16,
        username: &str,
        password: &str,
        authorized_keys_path: &str,
        timeout: Duration,
    ) -> Result<InstallOutcome, SshError> {
        self.ensure_local_key().await?;
        let key_line = self.keystore.load_public_key()?;

        let target = ConnectTarget {
            host,
            port,
            username,
            password,
            timeout,
        };
        let mut session = self.client.connect(&target).await?;

        let result = install_public_key(&mut session, &key_line, authorized_keys_path).await;
        session.close().await;

        match &result {
            Ok(InstallOutcome::Installed) => info!(
                "SSH public key added to {} on {}:{}",
                authorized_keys_path, host, port
            ),
            Ok(InstallOutcome::AlreadyPresent) => info!(
                "SSH public key already present in {} on {}:{}",
                authorized_keys_path, host, port
            ),
            Err(e) => debug!("Key installation on {}:{} failed: {}", host, port, e),
        }
        result
    }
}
