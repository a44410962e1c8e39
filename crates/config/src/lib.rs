//! autocert-config: settings for autocert
//!
//! This crate loads the operator settings from a structured file, a dotenv
//! file and the process environment, validates them, and publishes reloaded
//! snapshots when the file changes.

pub mod config;
pub mod watcher;

pub use config::*;
pub use watcher::{ConfigWatcher, ReloadManager};
