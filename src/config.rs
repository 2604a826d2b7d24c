//! Probe and responder configuration
//!
//! Both sides share the well-known responder ports. The client additionally
//! owns the retry policy (`max_probe_attempts` x `probe_timeout_ms`) that every
//! discovery step uses. Configuration is stored as JSON and can be
//! loaded/saved from disk; a missing or empty file yields the defaults.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

/// Well-known primary listener port
pub const DEFAULT_PRIMARY_PORT: u16 = 3478;
/// Well-known secondary listener port
pub const DEFAULT_SECONDARY_PORT: u16 = 3479;
/// Well-known tertiary listener port
pub const DEFAULT_TERTIARY_PORT: u16 = 3480;
/// Attempts per probe batch
pub const DEFAULT_MAX_PROBE_ATTEMPTS: u32 = 3;
/// Per-attempt read deadline in milliseconds
pub const DEFAULT_PROBE_TIMEOUT_MS: u64 = 5000;
/// In-flight handlers allowed per responder listener
pub const DEFAULT_MAX_IN_FLIGHT: usize = 256;

/// Client-side discovery configuration
///
/// # Example
/// ```rust,no_run
/// use natprobe::ProbeConfig;
///
/// let mut config = ProbeConfig::load("natprobe.json").expect("Failed to load");
/// config.server_host = "stun.example.net".to_string();
/// config.save("natprobe.json").expect("Failed to save");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProbeConfig {
    /// Responder host name or IP
    pub server_host: String,
    /// Responder primary listener port
    pub primary_port: u16,
    /// Responder secondary listener port
    pub secondary_port: u16,
    /// Responder tertiary listener port
    pub tertiary_port: u16,
    /// Attempts per probe batch
    pub max_probe_attempts: u32,
    /// Per-attempt read deadline in milliseconds
    pub probe_timeout_ms: u64,
    /// Local port for the primary probe socket (0 = ephemeral)
    pub local_port: u16,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            server_host: "127.0.0.1".to_string(),
            primary_port: DEFAULT_PRIMARY_PORT,
            secondary_port: DEFAULT_SECONDARY_PORT,
            tertiary_port: DEFAULT_TERTIARY_PORT,
            max_probe_attempts: DEFAULT_MAX_PROBE_ATTEMPTS,
            probe_timeout_ms: DEFAULT_PROBE_TIMEOUT_MS,
            local_port: 0,
        }
    }
}

impl ProbeConfig {
    /// Create a configuration targeting `server_host` with default ports and policy
    pub fn for_server(server_host: impl Into<String>) -> Self {
        Self {
            server_host: server_host.into(),
            ..Self::default()
        }
    }

    /// Per-attempt read deadline
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// Worst-case duration of one probe batch
    pub fn batch_budget(&self) -> Duration {
        self.probe_timeout() * self.max_probe_attempts
    }

    /// Check the configuration for values that would make discovery meaningless
    pub fn validate(&self) -> Result<()> {
        if self.server_host.trim().is_empty() {
            return Err(Error::Config("server_host must not be empty".to_string()));
        }
        if self.max_probe_attempts == 0 {
            return Err(Error::Config(
                "max_probe_attempts must be at least 1".to_string(),
            ));
        }
        if self.probe_timeout_ms == 0 {
            return Err(Error::Config("probe_timeout_ms must be non-zero".to_string()));
        }
        check_distinct_ports(self.primary_port, self.secondary_port, self.tertiary_port)
    }

    /// Load configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        load_json(path.as_ref())
    }

    /// Save configuration to a JSON file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        save_json(self, path.as_ref())
    }
}

/// Responder (server-side) configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ResponderConfig {
    /// IP all three listeners bind to
    pub bind_ip: IpAddr,
    /// Primary listener port
    pub primary_port: u16,
    /// Secondary listener port
    pub secondary_port: u16,
    /// Tertiary listener port
    pub tertiary_port: u16,
    /// Cap on concurrently running handlers per listener
    pub max_in_flight_per_listener: usize,
}

impl Default for ResponderConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            primary_port: DEFAULT_PRIMARY_PORT,
            secondary_port: DEFAULT_SECONDARY_PORT,
            tertiary_port: DEFAULT_TERTIARY_PORT,
            max_in_flight_per_listener: DEFAULT_MAX_IN_FLIGHT,
        }
    }
}

impl ResponderConfig {
    /// Responder on loopback with OS-assigned ports (tests and local diagnostics)
    pub fn ephemeral_loopback() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            primary_port: 0,
            secondary_port: 0,
            tertiary_port: 0,
            ..Self::default()
        }
    }

    /// Check the configuration before binding
    pub fn validate(&self) -> Result<()> {
        if self.max_in_flight_per_listener == 0 {
            return Err(Error::Config(
                "max_in_flight_per_listener must be at least 1".to_string(),
            ));
        }
        check_distinct_ports(self.primary_port, self.secondary_port, self.tertiary_port)
    }

    /// Load configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        load_json(path.as_ref())
    }

    /// Save configuration to a JSON file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        save_json(self, path.as_ref())
    }
}

// Port 0 means "let the OS choose" and may repeat.
fn check_distinct_ports(primary: u16, secondary: u16, tertiary: u16) -> Result<()> {
    let fixed: Vec<u16> = [primary, secondary, tertiary]
        .into_iter()
        .filter(|port| *port != 0)
        .collect();
    for (i, port) in fixed.iter().enumerate() {
        if fixed[i + 1..].contains(port) {
            return Err(Error::Config(format!(
                "listener ports must be distinct, {} is used twice",
                port
            )));
        }
    }
    Ok(())
}

fn load_json<T>(path: &Path) -> Result<T>
where
    T: Default + for<'de> Deserialize<'de>,
{
    if !path.exists() {
        return Ok(T::default());
    }

    let data = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?;

    if data.trim().is_empty() {
        return Ok(T::default());
    }

    serde_json::from_str(&data)
        .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))
}

fn save_json<T: Serialize>(value: &T, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| Error::Config(format!("Failed to create config directory: {}", e)))?;
    }

    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(path, json)
        .map_err(|e| Error::Config(format!("Failed to write {}: {}", path.display(), e)))?;

    Ok(())
}
