//! Deployer identity key pair
//!
//! Generates one RSA key pair, writes the private half as a PKCS#1 PEM file
//! readable only by the owner and the public half as an `authorized_keys`
//! line. An existing private key is never regenerated or rotated.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use rsa::pkcs1::{EncodeRsaPrivateKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use ssh_key::public::KeyData;
use ssh_key::Mpint;
use tracing::{debug, info};

use super::error::SshError;
use crate::config::{validate_key_bits, ProvisionConfig};

const PRIVATE_KEY_MODE: u32 = 0o600;
const PUBLIC_KEY_MODE: u32 = 0o644;
const KEY_DIR_MODE: u32 = 0o700;

/// What `ensure_key_pair` found or did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPairStatus {
    /// A private key was already on disk and was left untouched
    Existing,
    /// A new pair was generated and written
    Generated,
}

/// Owns the deployer's key files
#[derive(Debug, Clone)]
pub struct KeyStore {
    private_key_path: PathBuf,
    public_key_path: PathBuf,
    bits: usize,
    comment: String,
}

impl KeyStore {
    pub fn new(
        private_key_path: PathBuf,
        public_key_path: PathBuf,
        bits: usize,
        comment: impl Into<String>,
    ) -> Result<Self, SshError> {
        validate_key_bits(bits)?;
        Ok(Self {
            private_key_path,
            public_key_path,
            bits,
            comment: comment.into(),
        })
    }

    pub fn from_config(config: &ProvisionConfig) -> Result<Self, SshError> {
        Self::new(
            config.private_key_file(),
            config.public_key_file(),
            config.key_bits,
            config.key_comment.clone(),
        )
    }

    pub fn private_key_path(&self) -> &Path {
        &self.private_key_path
    }

    pub fn public_key_path(&self) -> &Path {
        &self.public_key_path
    }

    /// Whether a private key is already present
    pub fn exists(&self) -> bool {
        self.private_key_path.exists()
    }

    /// Generate and store a key pair unless a private key already exists
    ///
    /// CPU-bound for fresh keys; async callers should run it on a blocking thread.
    pub fn ensure_key_pair(&self) -> Result<KeyPairStatus, SshError> {
        if self.exists() {
            debug!(
                "Reusing existing private key at {:?}",
                self.private_key_path
            );
            return Ok(KeyPairStatus::Existing);
        }

        info!(
            "Generating {}-bit RSA key pair at {:?}",
            self.bits, self.private_key_path
        );

        let private_key = RsaPrivateKey::new(&mut rand::rngs::OsRng, self.bits)
            .map_err(|e| SshError::KeyGeneration(e.to_string()))?;

        let pem = private_key
            .to_pkcs1_pem(LineEnding::LF)
            .map_err(|e| SshError::KeyGeneration(format!("PEM encoding failed: {}", e)))?;

        write_private_key(&self.private_key_path, pem.as_bytes())?;
        self.encode_public_key(&private_key.to_public_key())?;

        info!(
            "SSH key pair written (private: {:?}, public: {:?})",
            self.private_key_path, self.public_key_path
        );
        Ok(KeyPairStatus::Generated)
    }

    /// Write `public_key` as an `authorized_keys` line and return that line
    pub fn encode_public_key(&self, public_key: &RsaPublicKey) -> Result<String, SshError> {
        let line = authorized_key_line(public_key, &self.comment)?;

        ensure_parent_dir(&self.public_key_path)?;
        write_with_mode(
            &self.public_key_path,
            format!("{}\n", line).as_bytes(),
            PUBLIC_KEY_MODE,
        )?;
        set_mode(&self.public_key_path, PUBLIC_KEY_MODE)?;

        Ok(line)
    }

    /// Read the public key line, trimmed of surrounding whitespace
    pub fn load_public_key(&self) -> Result<String, SshError> {
        let contents =
            fs::read_to_string(&self.public_key_path).map_err(|source| SshError::LocalKeyRead {
                path: self.public_key_path.clone(),
                source,
            })?;

        let line = contents.trim();
        if line.is_empty() {
            return Err(SshError::LocalKeyRead {
                path: self.public_key_path.clone(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "public key file is empty",
                ),
            });
        }
        Ok(line.to_string())
    }
}

/// Render an RSA public key in OpenSSH `authorized_keys` format
pub fn authorized_key_line(public_key: &RsaPublicKey, comment: &str) -> Result<String, SshError> {
    let e = Mpint::from_positive_bytes(&public_key.e().to_bytes_be())
        .map_err(|e| SshError::Encoding(format!("invalid RSA exponent: {}", e)))?;
    let n = Mpint::from_positive_bytes(&public_key.n().to_bytes_be())
        .map_err(|e| SshError::Encoding(format!("invalid RSA modulus: {}", e)))?;

    let key = ssh_key::PublicKey::new(KeyData::Rsa(ssh_key::public::RsaPublicKey { e, n }), comment);
    key.to_openssh()
        .map_err(|e| SshError::Encoding(format!("OpenSSH encoding failed: {}", e)))
}

fn write_private_key(path: &Path, pem: &[u8]) -> Result<(), SshError> {
    ensure_parent_dir(path)?;
    write_with_mode(path, pem, PRIVATE_KEY_MODE)?;
    set_mode(path, PRIVATE_KEY_MODE)
}

/// The open mode only applies to new files and is filtered by the umask
fn set_mode(path: &Path, mode: u32) -> Result<(), SshError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
            .map_err(|e| SshError::filesystem(path, e))?;
    }
    #[cfg(not(unix))]
    let _ = (path, mode);

    Ok(())
}

/// Create missing parent directories, owner-only
pub(crate) fn ensure_parent_dir(path: &Path) -> Result<(), SshError> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() || parent.exists() {
        return Ok(());
    }

    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(KEY_DIR_MODE);
    }
    builder
        .create(parent)
        .map_err(|e| SshError::filesystem(parent, e))
}

fn write_with_mode(path: &Path, data: &[u8], mode: u32) -> Result<(), SshError> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;

    let mut file = options
        .open(path)
        .map_err(|e| SshError::filesystem(path, e))?;
    file.write_all(data)
        .and_then(|_| file.sync_all())
        .map_err(|e| SshError::filesystem(path, e))
}
