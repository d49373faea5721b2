//! # vigil-settings
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`VigilSettings::default()`]
//! 2. **User file**: `~/.vigil/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `VIGIL_*` overrides (highest priority)
//!
//! Only the binary loads settings. Library crates take their own config structs.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, apply_overrides, deep_merge, load_settings, load_settings_from_path,
    settings_path, vigil_dir,
};
pub use types::*;
