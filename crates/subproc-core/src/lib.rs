pub mod command;
pub mod config;
pub mod error;
pub mod history;
pub mod types;

pub use command::Command;
pub use config::{Config, ConfigError};
pub use error::CommandError;
pub use history::{CommandHistory, DEFAULT_HISTORY_SIZE};
pub use types::LogLevel;
