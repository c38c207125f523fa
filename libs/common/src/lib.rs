//! voltage-plc basic library
//!
//! Provides the ambient functions shared by the workspace:
//! - logging initialisation and runtime level changes
//! - layered configuration loading

pub mod config_loader;
pub mod logging;

pub use config_loader::{load_config_from_file, load_layered};
pub use logging::LogConfig;
