pub mod config;
pub mod types;

pub use config::{ClusterwatchConfig, HealthSettings, RegistrationConfig};
pub use types::*;
