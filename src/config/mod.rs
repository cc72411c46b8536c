//! Configuration module
//!
//! Rule definitions and runtime settings, loaded from JSON and validated
//! before any listener binds.

mod loader;
mod types;

pub use loader::{load_config, load_config_str};
pub use types::{LogConfig, Protocol, RelayConfig, RelayRule};
