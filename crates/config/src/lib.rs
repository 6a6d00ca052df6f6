//! Configuration loading, schema, and env substitution.
//!
//! Config files: `weft.toml`, `weft.yaml`, or `weft.json`
//! Searched in `./` then `~/.config/weft/`.
//!
//! Supports `${ENV_VAR}` substitution in all string values.

pub mod env;
pub mod error;
pub mod loader;
pub mod schema;

pub use {
    error::{Error, Result},
    loader::{
        config_dir, discover_and_load, find_or_default_config_path, load_config, save_config,
    },
    schema::{
        ChatConfig, ProviderEntry, ProvidersConfig, ReasoningTags, ToolMode, WeftConfig,
    },
};
