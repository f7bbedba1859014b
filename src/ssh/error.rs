//! SSH Error types

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SshError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Key encoding failed: {0}")]
    Encoding(String),

    #[error("Filesystem error at {path}: {source}")]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read local public key {path}: {source}")]
    LocalKeyRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Connection to {host} failed: {message}")]
    ConnectionFailed { host: String, message: String },

    #[error("Connection to {host} timed out after {secs}s ({stage})")]
    Timeout {
        host: String,
        stage: &'static str,
        secs: u64,
    },

    #[error("Authentication as {username} on {host} failed: {message}")]
    AuthenticationFailed {
        host: String,
        username: String,
        message: String,
    },

    #[error(
        "HOST KEY VERIFICATION FAILED for {host}: POSSIBLE MAN-IN-THE-MIDDLE ATTACK! \
         Expected {expected_fingerprint}, got {actual_fingerprint}. \
         If the key change is legitimate, remove the old entry from {known_hosts}"
    )]
    HostKeyMismatch {
        host: String,
        expected_fingerprint: String,
        actual_fingerprint: String,
        known_hosts: PathBuf,
    },

    #[error("Host key for {host} was not confirmed (fingerprint {fingerprint})")]
    HostKeyNotConfirmed { host: String, fingerprint: String },

    #[error("Remote command on {host} failed: {message}")]
    RemoteCommand { host: String, message: String },

    #[error("SSH protocol error: {0}")]
    ProtocolError(String),
}

impl SshError {
    /// Host key mismatch and declined confirmation are trust decisions, not transient failures.
    pub fn is_security_failure(&self) -> bool {
        matches!(
            self,
            SshError::HostKeyMismatch { .. } | SshError::HostKeyNotConfirmed { .. }
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, SshError::Timeout { .. })
    }

    pub(crate) fn filesystem(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SshError::Filesystem {
            path: path.into(),
            source,
        }
    }
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        SshError::ProtocolError(err.to_string())
    }
}
