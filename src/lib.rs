//! natprobe - UDP NAT behavior discovery
//!
//! This library classifies how a host's outbound UDP traffic is translated by
//! NAT devices or firewalls on the path to a dedicated discovery server. It
//! provides both halves of the probe protocol:
//! - A responder that listens on three UDP ports and replies from the same or
//!   a different port depending on the request
//! - A client that runs a fixed sequence of probes against the responder and
//!   folds the evidence into a [`NatClassification`]

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod discovery;
pub mod protocol;
pub mod responder;
pub mod transport;

pub use config::{ProbeConfig, ResponderConfig};
pub use discovery::{
    discover_nat_type, discover_with_deadline, DiscoveryReport, NatClassification, NatDiscovery,
};
pub use responder::{NatResponder, ResponderHandle};

/// Result type alias for natprobe operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for natprobe operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A required local socket could not be bound
    #[error("Bind error: {0}")]
    Bind(String),

    /// Invalid or unreadable configuration
    #[error("Config error: {0}")]
    Config(String),

    /// General I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),
}

/// Initialize the natprobe library with logging
pub fn init() {
    tracing_subscriber::fmt::init();
}

#[cfg(test)]
mod tests;
