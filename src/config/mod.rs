//! Configuration Management Module
//!
//! One explicit configuration struct for the provisioning workflow, loaded
//! from JSON and overridden by command-line flags.

pub mod storage;
pub mod types;

pub use storage::{expand_user, load_config, StorageError};
pub use types::{validate_key_bits, ProvisionConfig, MAX_KEY_BITS, MIN_KEY_BITS};
