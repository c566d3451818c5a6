//! Application module
//!
//! Wires the reporting subsystem, the exporter registry and the config watcher
//! together and drives their background tasks.

pub mod core;
pub mod services;
pub mod tasks;

pub use self::core::Application;
pub use self::services::ApplicationServices;
