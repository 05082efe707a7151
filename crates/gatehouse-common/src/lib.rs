//! Gatehouse Common Library
//!
//! Shared error, configuration and TLS types for the Gatehouse server.

pub mod config;
pub mod error;
pub mod tls;

// Re-export commonly used types
pub use config::{DatabaseSettings, GatehouseConfig, ListenerSettings, TlsSettings};
pub use error::{GatehouseError, Result};
pub use tls::TlsConfig;
