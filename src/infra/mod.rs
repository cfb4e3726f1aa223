//! Infrastructure - configuration, metrics, and identity
//!
//! This module contains infrastructure concerns:
//! - `config` - Application configuration (TOML loading, defaults)
//! - `metrics` - Lock-free metrics collection
//! - `identity` - Stable per-install user identifier

pub mod config;
pub mod identity;
pub mod metrics;

// Re-export commonly used types
pub use config::Config;
pub use identity::load_or_create_user_id;
pub use metrics::Metrics;
