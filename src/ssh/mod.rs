//! SSH module - deployer identity provisioning
//!
//! This module provides the SSH side of the VM workflow using the russh library.
//!
//! # Features
//! - RSA identity generation and storage (`keystore`)
//! - Host key verification via ~/.ssh/known_hosts with trust on first use
//! - Pluggable confirmation for unknown hosts (console, auto-accept, auto-reject)
//! - Idempotent installation of the public key into remote authorized_keys

mod client;
mod error;
pub mod installer;
pub mod keystore;
pub mod known_hosts;
pub mod prompt;
mod session;
pub mod verifier;

pub use client::{ClientHandler, ConnectTarget, SshClient};
pub use error::SshError;
pub use installer::{install_public_key, InstallOutcome, RemoteKeyInstaller};
pub use keystore::{KeyPairStatus, KeyStore};
pub use known_hosts::{host_identifier, HostKey, HostLookup, KnownHostEntry, KnownHostsStore};
pub use prompt::{AutoAccept, AutoReject, ConsolePrompt, HostKeyPrompt};
pub use session::{ExecOutput, RemoteSession, RemoteShell};
pub use verifier::{TrustDecision, TrustedHostVerifier};
