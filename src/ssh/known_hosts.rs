//! Known hosts management for SSH host key verification
//!
//! Parses the OpenSSH `known_hosts` text format into [`KnownHostEntry`]
//! values and appends newly trusted keys. The file is only ever appended
//! to, never rewritten.

use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use parking_lot::Mutex;
use russh::keys::{PublicKey, PublicKeyBase64};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use super::error::SshError;
use super::keystore::ensure_parent_dir;

const KNOWN_HOSTS_MODE: u32 = 0o644;

/// A host public key as presented on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostKey {
    key_type: String,
    blob: Vec<u8>,
}

impl HostKey {
    pub fn new(key_type: impl Into<String>, blob: Vec<u8>) -> Self {
        Self {
            key_type: key_type.into(),
            blob,
        }
    }

    pub fn from_public_key(key: &PublicKey) -> Self {
        Self::new(key.algorithm().as_str(), key.public_key_bytes())
    }

    pub fn key_type(&self) -> &str {
        &self.key_type
    }

    pub fn blob(&self) -> &[u8] {
        &self.blob
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.blob)
    }

    /// SHA256 fingerprint in OpenSSH notation (`SHA256:<unpadded base64>`)
    pub fn fingerprint(&self) -> String {
        let hash = Sha256::digest(&self.blob);
        format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
    }
}

/// One usable line of a known_hosts file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownHostEntry {
    /// Host names from the first field (comma-separated in the file)
    pub hosts: Vec<String>,
    pub key: HostKey,
}

impl KnownHostEntry {
    /// Parse `<host>[,<host>...] <key-type> <base64> [comment]`
    ///
    /// Returns `None` for blank lines, comments, hashed or marker entries and
    /// anything malformed.
    pub fn parse_line(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }

        let mut fields = line.split_whitespace();
        let host_field = fields.next()?;
        let key_type = fields.next()?;
        let key_data = fields.next()?;

        // @cert-authority / @revoked markers and hashed names (|1|...) are not handled
        if host_field.starts_with('@') {
            return None;
        }

        let hosts: Vec<String> = host_field
            .split(',')
            .filter(|h| !h.is_empty() && !h.starts_with('|'))
            .map(str::to_lowercase)
            .collect();
        if hosts.is_empty() {
            return None;
        }

        let blob = BASE64.decode(key_data).ok()?;

        Some(Self {
            hosts,
            key: HostKey::new(key_type, blob),
        })
    }

    pub fn matches(&self, host_id: &str) -> bool {
        let host_id = host_id.to_lowercase();
        self.hosts.iter().any(|h| *h == host_id)
    }
}

/// Parse every usable entry, skipping malformed lines
pub fn parse_known_hosts(contents: &str) -> Vec<KnownHostEntry> {
    contents
        .lines()
        .filter_map(KnownHostEntry::parse_line)
        .collect()
}

/// Identifier a host is recorded under: `host` on port 22, `[host]:port` otherwise
pub fn host_identifier(host: &str, port: u16) -> String {
    let host = host.to_lowercase();
    if port == 22 {
        host
    } else {
        format!("[{}]:{}", host, port)
    }
}

/// Result of looking a host up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostLookup {
    /// First entry for the host
    Found(HostKey),
    /// The file exists but has no entry for the host
    NotFound,
    /// There is no known_hosts file yet
    FileAbsent,
}

/// Append-only known_hosts file
pub struct KnownHostsStore {
    path: PathBuf,
    /// Serialises appends from concurrent provisioning tasks
    write_lock: Mutex<()>,
}

impl KnownHostsStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Find the first entry for `host_id`
    pub fn lookup(&self, host_id: &str) -> Result<HostLookup, SshError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Known hosts file {:?} does not exist", self.path);
                return Ok(HostLookup::FileAbsent);
            }
            Err(e) => return Err(SshError::filesystem(&self.path, e)),
        };

        let found = contents
            .lines()
            .filter_map(KnownHostEntry::parse_line)
            .find(|entry| entry.matches(host_id));

        Ok(match found {
            Some(entry) => HostLookup::Found(entry.key),
            None => HostLookup::NotFound,
        })
    }

    /// Append a new entry
    pub fn append(&self, host_id: &str, key: &HostKey) -> Result<(), SshError> {
        let _guard = self.write_lock.lock();
        self.append_locked(host_id, key)
    }

    /// Look `host_id` up and, only if it is still unknown, let `decide` choose whether to append
    ///
    /// Lookup, decision and append happen under one lock so concurrent first
    /// contacts with the same host cannot both record a key.
    pub fn lookup_or_insert_with<F>(
        &self,
        host_id: &str,
        key: &HostKey,
        decide: F,
    ) -> Result<InsertOutcome, SshError>
    where
        F: FnOnce() -> bool,
    {
        let _guard = self.write_lock.lock();

        match self.lookup(host_id)? {
            HostLookup::Found(existing) => Ok(InsertOutcome::AlreadyKnown(existing)),
            HostLookup::NotFound | HostLookup::FileAbsent => {
                if decide() {
                    self.append_locked(host_id, key)?;
                    Ok(InsertOutcome::Inserted)
                } else {
                    Ok(InsertOutcome::Declined)
                }
            }
        }
    }

    fn append_locked(&self, host_id: &str, key: &HostKey) -> Result<(), SshError> {
        ensure_parent_dir(&self.path)?;

        let mut options = OpenOptions::new();
        options.create(true).read(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(KNOWN_HOSTS_MODE);
        }

        let mut file = options
            .open(&self.path)
            .map_err(|e| SshError::filesystem(&self.path, e))?;

        let needs_newline = ends_without_newline(&mut file)
            .map_err(|e| SshError::filesystem(&self.path, e))?;

        let mut line = String::new();
        if needs_newline {
            line.push('\n');
        }
        line.push_str(&format!("{} {} {}\n", host_id, key.key_type(), key.to_base64()));

        file.write_all(line.as_bytes())
            .map_err(|e| SshError::filesystem(&self.path, e))?;

        info!(
            "Added host key for {} (type: {}) to {:?}",
            host_id,
            key.key_type(),
            self.path
        );
        Ok(())
    }
}

/// Outcome of [`KnownHostsStore::lookup_or_insert_with`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Another entry was already there; nothing was written
    AlreadyKnown(HostKey),
    Inserted,
    Declined,
}

fn ends_without_newline(file: &mut fs::File) -> std::io::Result<bool> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::Start(len - 1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}
