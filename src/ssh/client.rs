//! SSH Client implementation using russh

use std::sync::Arc;
use std::time::Duration;

use russh::client;
use russh::keys::PublicKey;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::error::SshError;
use super::known_hosts::{host_identifier, HostKey};
use super::session::RemoteSession;
use super::verifier::TrustedHostVerifier;

/// Lower bound for the idle timeout of an established session
const SESSION_IDLE_FLOOR: Duration = Duration::from_secs(120);

/// Where and as whom to connect
#[derive(Clone)]
pub struct ConnectTarget<'a> {
    pub host: &'a str,
    pub port: u16,
    pub username: &'a str,
    pub password: &'a str,
    pub timeout: Duration,
}

/// Password-authenticated SSH client
pub struct SshClient {
    verifier: Arc<TrustedHostVerifier>,
}

impl SshClient {
    pub fn new(verifier: Arc<TrustedHostVerifier>) -> Self {
        Self { verifier }
    }

    /// Dial, verify the host key, and authenticate
    pub async fn connect(&self, target: &ConnectTarget<'_>) -> Result<RemoteSession, SshError> {
        let host_id = host_identifier(target.host, target.port);
        let timeout_secs = target.timeout.as_secs();

        info!("Connecting to SSH server at {}:{}", target.host, target.port);

        let stream = tokio::time::timeout(
            target.timeout,
            TcpStream::connect((target.host, target.port)),
        )
        .await
        .map_err(|_| SshError::Timeout {
            host: host_id.clone(),
            stage: "dial",
            secs: timeout_secs,
        })?
        .map_err(|e| SshError::ConnectionFailed {
            host: host_id.clone(),
            message: e.to_string(),
        })?;

        let ssh_config = client::Config {
            inactivity_timeout: Some(target.timeout.max(SESSION_IDLE_FLOOR)),
            ..Default::default()
        };

        let handler = ClientHandler::new(host_id.clone(), self.verifier.clone());
        let mut verifying = handler.verifying();

        let handshake = client::connect_stream(Arc::new(ssh_config), stream, handler);
        tokio::pin!(handshake);
        let deadline = tokio::time::sleep(target.timeout);
        tokio::pin!(deadline);
        let mut watching = true;

        // Banner and key exchange share one deadline; time spent waiting on
        // the operator prompt does not count and the deadline restarts after it
        let handshake_result = loop {
            tokio::select! {
                result = &mut handshake => break result,
                _ = &mut deadline, if !*verifying.borrow() => {
                    warn!("SSH handshake with {} timed out after {:?}", host_id, target.timeout);
                    return Err(SshError::Timeout {
                        host: host_id.clone(),
                        stage: "handshake",
                        secs: timeout_secs,
                    });
                }
                changed = verifying.changed(), if watching => {
                    if changed.is_err() {
                        watching = false;
                    } else if !*verifying.borrow() {
                        deadline
                            .as_mut()
                            .reset(tokio::time::Instant::now() + target.timeout);
                    }
                }
            }
        };

        let mut handle = handshake_result.map_err(|e| handshake_error(&host_id, e))?;

        debug!("SSH handshake with {} completed", host_id);

        let authenticated = tokio::time::timeout(
            target.timeout,
            handle.authenticate_password(target.username, target.password),
        )
        .await
        .map_err(|_| SshError::Timeout {
            host: host_id.clone(),
            stage: "authentication",
            secs: timeout_secs,
        })?
        .map_err(|e| SshError::AuthenticationFailed {
            host: host_id.clone(),
            username: target.username.to_string(),
            message: e.to_string(),
        })?;

        if !authenticated.success() {
            return Err(SshError::AuthenticationFailed {
                host: host_id,
                username: target.username.to_string(),
                message: "password rejected by server".to_string(),
            });
        }

        info!("SSH authentication as {} on {} successful", target.username, host_id);

        Ok(RemoteSession::new(handle, host_id, target.timeout))
    }
}

/// Verifier rejections pass through untouched; other failures name the host
fn handshake_error(host_id: &str, err: SshError) -> SshError {
    match err {
        e if e.is_security_failure() => e,
        SshError::ProtocolError(message) => SshError::ConnectionFailed {
            host: host_id.to_string(),
            message,
        },
        other => other,
    }
}

/// Client handler for russh callbacks
///
/// Hands the server's host key to the [`TrustedHostVerifier`]. Rejections
/// surface as the handler error so they reach the caller unchanged.
pub struct ClientHandler {
    host_id: String,
    verifier: Arc<TrustedHostVerifier>,
    /// `true` while the verifier (and possibly the operator) is deciding
    verifying: watch::Sender<bool>,
}

impl ClientHandler {
    pub fn new(host_id: String, verifier: Arc<TrustedHostVerifier>) -> Self {
        let (verifying, _) = watch::channel(false);
        Self {
            host_id,
            verifier,
            verifying,
        }
    }

    pub fn verifying(&self) -> watch::Receiver<bool> {
        self.verifying.subscribe()
    }
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let key = HostKey::from_public_key(server_public_key);
        let verifier = self.verifier.clone();
        let host_id = self.host_id.clone();

        self.verifying.send_replace(true);
        // Verification may block on the operator prompt
        let verdict = tokio::task::spawn_blocking(move || verifier.verify(&host_id, &key)).await;
        self.verifying.send_replace(false);

        verdict.map_err(|e| {
            SshError::ProtocolError(format!("host key verification task failed: {}", e))
        })??;

        Ok(true)
    }
}
