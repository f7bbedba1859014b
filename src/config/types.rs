//! Provisioning configuration types

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::storage::expand_user;
use crate::ssh::SshError;

/// Smallest RSA modulus accepted for the deployer identity
pub const MIN_KEY_BITS: usize = 2048;

/// Largest RSA modulus accepted; anything bigger takes minutes to generate
pub const MAX_KEY_BITS: usize = 16384;

/// Everything the provisioning workflow needs, built once and passed down
#[derive(Clone, Serialize, Deserialize)]
pub struct ProvisionConfig {
    /// Comma-separated list of target hosts
    #[serde(default = "default_hosts")]
    pub hosts: String,

    /// SSH port (default: 22)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Username for password authentication
    #[serde(default)]
    pub username: String,

    /// Password for the initial connection
    #[serde(default)]
    pub password: String,

    /// Remote authorized_keys file (expanded by the remote shell)
    #[serde(default = "default_authorized_keys_path")]
    pub authorized_keys_path: String,

    /// Local private key file
    #[serde(default = "default_private_key_path")]
    pub private_key_path: String,

    /// Local public key file
    #[serde(default = "default_public_key_path")]
    pub public_key_path: String,

    /// Local known_hosts file
    #[serde(default = "default_known_hosts_path")]
    pub known_hosts_path: String,

    /// Strict host key checking (default: true)
    /// - true: unknown hosts need confirmation and are recorded
    /// - false: unknown hosts are accepted without recording
    ///
    /// Changed keys are rejected in both modes.
    #[serde(default = "default_strict")]
    pub strict_host_key_checking: bool,

    /// Dial, authentication and remote command timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// RSA modulus length for a newly generated identity
    #[serde(default = "default_key_bits")]
    pub key_bits: usize,

    /// Comment written after the public key
    #[serde(default = "default_key_comment")]
    pub key_comment: String,

    /// Hosts provisioned at the same time (1 = sequential)
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Keep going with the remaining hosts after one fails
    #[serde(default)]
    pub continue_on_error: bool,
}

fn default_hosts() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    22
}

fn default_authorized_keys_path() -> String {
    "~/.ssh/authorized_keys".to_string()
}

fn default_private_key_path() -> String {
    "~/.ssh/appdeployer".to_string()
}

fn default_public_key_path() -> String {
    "~/.ssh/appdeployer.pub".to_string()
}

fn default_known_hosts_path() -> String {
    "~/.ssh/known_hosts".to_string()
}

fn default_strict() -> bool {
    true
}

fn default_timeout() -> u64 {
    10
}

fn default_key_bits() -> usize {
    MIN_KEY_BITS
}

fn default_key_comment() -> String {
    "appdeployer".to_string()
}

fn default_concurrency() -> usize {
    1
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            hosts: default_hosts(),
            port: default_port(),
            username: String::new(),
            password: String::new(),
            authorized_keys_path: default_authorized_keys_path(),
            private_key_path: default_private_key_path(),
            public_key_path: default_public_key_path(),
            known_hosts_path: default_known_hosts_path(),
            strict_host_key_checking: default_strict(),
            timeout_secs: default_timeout(),
            key_bits: default_key_bits(),
            key_comment: default_key_comment(),
            concurrency: default_concurrency(),
            continue_on_error: false,
        }
    }
}

impl fmt::Debug for ProvisionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvisionConfig")
            .field("hosts", &self.hosts)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("authorized_keys_path", &self.authorized_keys_path)
            .field("private_key_path", &self.private_key_path)
            .field("public_key_path", &self.public_key_path)
            .field("known_hosts_path", &self.known_hosts_path)
            .field("strict_host_key_checking", &self.strict_host_key_checking)
            .field("timeout_secs", &self.timeout_secs)
            .field("key_bits", &self.key_bits)
            .field("concurrency", &self.concurrency)
            .field("continue_on_error", &self.continue_on_error)
            .finish()
    }
}

impl ProvisionConfig {
    /// Split the comma-separated host list, dropping blanks
    pub fn host_list(&self) -> Vec<String> {
        self.hosts
            .split(',')
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn private_key_file(&self) -> PathBuf {
        expand_user(&self.private_key_path)
    }

    pub fn public_key_file(&self) -> PathBuf {
        expand_user(&self.public_key_path)
    }

    pub fn known_hosts_file(&self) -> PathBuf {
        expand_user(&self.known_hosts_path)
    }

    /// Reject configurations the workflow cannot run with
    pub fn validate(&self) -> Result<(), SshError> {
        if self.username.trim().is_empty() {
            return Err(SshError::InvalidConfig("username is required".to_string()));
        }
        if self.password.trim().is_empty() {
            return Err(SshError::InvalidConfig("password is required".to_string()));
        }
        if self.host_list().is_empty() {
            return Err(SshError::InvalidConfig(
                "at least one host is required".to_string(),
            ));
        }
        if self.port == 0 {
            return Err(SshError::InvalidConfig("port must be non-zero".to_string()));
        }
        if self.authorized_keys_path.trim().is_empty() {
            return Err(SshError::InvalidConfig(
                "authorized_keys_path is required".to_string(),
            ));
        }
        validate_key_bits(self.key_bits)?;
        if self.concurrency == 0 {
            return Err(SshError::InvalidConfig(
                "concurrency must be at least 1".to_string(),
            ));
        }
        if self.timeout_secs == 0 {
            return Err(SshError::InvalidConfig(
                "timeout_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

pub fn validate_key_bits(bits: usize) -> Result<(), SshError> {
    if bits < MIN_KEY_BITS {
        return Err(SshError::InvalidConfig(format!(
            "RSA key size {} is below the minimum of {} bits",
            bits, MIN_KEY_BITS
        )));
    }
    if bits > MAX_KEY_BITS {
        return Err(SshError::InvalidConfig(format!(
            "RSA key size {} exceeds the maximum of {} bits",
            bits, MAX_KEY_BITS
        )));
    }
    Ok(())
}
