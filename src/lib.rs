//! AppDeployer - SSH identity provisioning
//!
//! Generates the deployer's RSA identity once, verifies target hosts against
//! `known_hosts` with trust on first use, and installs the public key into
//! each host's `authorized_keys` so later steps can log in without a password.

pub mod config;
pub mod provision;
pub mod ssh;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global tracing subscriber (`RUST_LOG`, default `info`)
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
