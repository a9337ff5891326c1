//! Configuration Module
//!
//! Loading, validation and hot reload of the relay configuration.

pub mod manager;
pub mod types;
pub mod watcher;

pub use manager::{CliOverrides, ConfigManager};
pub use types::*;
pub use watcher::{ConfigChangeEvent, ConfigWatcher};
