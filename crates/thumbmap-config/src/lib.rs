//! Configuration parsing for thumbmap
//!
//! This crate handles parsing KDL configuration files, resolving key names
//! to evdev codes, and the types shared between the daemon and the CLI.

mod context;
mod control;
mod error;
mod keys;
mod model;
mod parser;

pub use context::{Layer, LayerValue};
pub use control::{control_socket_path, ControlRequest, ControlResponse, RemapperStatus};
pub use error::{ConfigError, InvalidKeyInfo, KeyPosition, SourceLocation};
pub use keys::{
    canonical_combination, code_to_key, combination_keys, is_modifier_key, is_valid_combination,
    key_to_code, MODIFIER_KEYS,
};
pub use model::*;
pub use parser::{is_valid_key, parse_config, parse_config_str, validate_keys};
