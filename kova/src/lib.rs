//! The kova process: settings, job manifests and the commands the binary runs.

pub mod commands;
pub mod config;
pub mod manifest;

pub use config::Settings;
pub use manifest::{Manifest, ManifestError};
