//! # switchyard-settings
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`SwitchyardSettings::default()`]
//! 2. **Settings file**: `~/.switchyard/settings.json` or an explicit path
//!    (deep-merged over defaults)
//! 3. **Environment variables**: `SWITCHYARD_*` overrides
//!
//! Unlike the store-backed routing and limit tables, these values are read
//! once at startup.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, deep_merge, load_settings, load_settings_from_path, resolve_data_path,
    settings_dir, settings_path,
};
pub use types::*;
