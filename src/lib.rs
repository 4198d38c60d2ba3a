// Core modules
pub mod config;
pub mod db;
pub mod evaluator;
pub mod execution;
pub mod market;
pub mod models;
pub mod monitor;
pub mod scheduler;
pub mod sync;

// Re-export commonly used types
pub use models::*;
pub use monitor::Monitor;

// Error handling
pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;
