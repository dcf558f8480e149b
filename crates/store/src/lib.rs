//! SwarmRoute Store
//!
//! File-backed [`RoutingStore`](swarmroute_core::RoutingStore), identity key
//! files and the platform directories they live in.

mod file;
mod keys;
mod paths;

pub use file::JsonFileStore;
pub use keys::{load_or_generate_signing_keypair, KeyfileError};
pub use paths::{default_config_dir, default_config_path, default_data_dir, default_key_dir, expand_path};
