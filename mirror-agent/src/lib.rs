//! Mirror Agent Library
//!
//! Daemon around the mirror engine: configuration, SQLite state, desktop
//! notifications, process detection and an HTTP/WebSocket status API.

pub mod api;
pub mod config;
pub mod daemon;
pub mod notify;
pub mod probe;
pub mod store;
pub mod utils;
pub mod ws;

// Re-export commonly used types
pub use config::Config;
pub use utils::errors::AgentError;
pub type Result<T> = std::result::Result<T, AgentError>;
