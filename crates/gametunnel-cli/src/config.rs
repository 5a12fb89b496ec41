//! Configuration system for the GameTunnel CLI.

use crate::games::GameProfile;
use gametunnel_client::{ClientConfig, ProbeConfig};
use gametunnel_core::{CandidateEndpoint, Destination, MAX_ADDR_LEN, MAX_PAYLOAD_LEN};
use gametunnel_relay::RelayServerConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default relay port
pub const DEFAULT_RELAY_PORT: u16 = 8080;

/// GameTunnel configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Relay server configuration
    #[serde(default)]
    pub server: ServerSection,
    /// Client configuration
    #[serde(default)]
    pub client: ClientSection,
    /// Tunnel transform configuration
    #[serde(default)]
    pub tunnel: TunnelSection,
    /// Terminal dashboard configuration
    #[serde(default)]
    pub dashboard: DashboardSection,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingSection,
    /// Candidate relay endpoints
    #[serde(default)]
    pub servers: Vec<EndpointEntry>,
    /// Game profiles for process detection
    #[serde(default)]
    pub games: Vec<GameProfile>,
}

/// Relay server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    /// Bind host
    #[serde(default = "default_server_host")]
    pub host: String,
    /// Bind port
    #[serde(default = "default_relay_port")]
    pub port: u16,
    /// Region label
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// Maximum concurrent sessions
    #[serde(default = "default_max_sessions", alias = "max_connections")]
    pub max_sessions: usize,
    /// Read buffer size in bytes
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Idle session timeout (seconds)
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
    /// Idle sweep interval (seconds)
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval: u64,
    /// Statistics log interval (seconds)
    #[serde(default = "default_stats_interval")]
    pub stats_interval: u64,
    /// Destination reply timeout (seconds)
    #[serde(default = "default_reply_timeout")]
    pub reply_timeout: u64,
    /// Destination connect timeout (seconds)
    #[serde(default = "default_destination_connect_timeout")]
    pub connect_timeout: u64,
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSection {
    /// Local bind host
    #[serde(default = "default_bind_host")]
    pub bind_host: String,
    /// Local UDP port, 0 for ephemeral
    #[serde(default)]
    pub local_port: u16,
    /// True destination as `host:port`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    /// Probe attempts per endpoint
    #[serde(default = "default_probe_attempts")]
    pub probe_attempts: usize,
    /// Per-attempt probe timeout (seconds)
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout: u64,
    /// Keepalive interval (seconds)
    #[serde(default = "default_keepalive_interval", alias = "heartbeat_interval")]
    pub keepalive_interval: u64,
    /// Relay connect timeout (seconds)
    #[serde(default = "default_link_connect_timeout")]
    pub connect_timeout: u64,
    /// Reconnect attempts after link loss
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Pause between reconnect attempts (seconds)
    #[serde(default = "default_retry_delay")]
    pub retry_delay: u64,
    /// Datagram buffer size in bytes
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Seconds a forwarded datagram waits for its reply
    #[serde(default = "default_reply_window")]
    pub reply_window: u64,
}

/// Tunnel transforms; accepted and reported, not applied
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelSection {
    /// Payload encryption
    #[serde(default)]
    pub encryption: bool,
    /// Payload compression
    #[serde(default)]
    pub compression: bool,
    /// Path MTU hint
    #[serde(default = "default_mtu")]
    pub mtu: usize,
}

/// Terminal dashboard configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardSection {
    /// Seconds between probe rounds
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval: u64,
    /// Latency samples kept per endpoint
    #[serde(default = "default_history_size")]
    pub history_size: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log file path
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

/// One `[[servers]]` entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointEntry {
    /// Unique name
    pub name: String,
    /// Hostname or IP
    pub host: String,
    /// Relay port
    #[serde(default = "default_relay_port")]
    pub port: u16,
    /// Region label
    #[serde(default)]
    pub region: String,
    /// Location label
    #[serde(default)]
    pub location: String,
}

// Default values

fn default_server_host() -> String {
    "0.0.0.0".to_string()
}

fn default_relay_port() -> u16 {
    DEFAULT_RELAY_PORT
}

fn default_max_sessions() -> usize {
    1000
}

fn default_buffer_size() -> usize {
    gametunnel_core::DEFAULT_BUFFER_SIZE
}

fn default_idle_timeout() -> u64 {
    300
}

fn default_cleanup_interval() -> u64 {
    60
}

fn default_stats_interval() -> u64 {
    300
}

fn default_reply_timeout() -> u64 {
    5
}

fn default_destination_connect_timeout() -> u64 {
    5
}

fn default_bind_host() -> String {
    "127.0.0.1".to_string()
}

fn default_probe_attempts() -> usize {
    3
}

fn default_probe_timeout() -> u64 {
    5
}

fn default_keepalive_interval() -> u64 {
    30
}

fn default_link_connect_timeout() -> u64 {
    10
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    5
}

fn default_reply_window() -> u64 {
    10
}

fn default_mtu() -> usize {
    1400
}

fn default_refresh_interval() -> u64 {
    5
}

fn default_history_size() -> usize {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            port: default_relay_port(),
            region: None,
            max_sessions: default_max_sessions(),
            buffer_size: default_buffer_size(),
            idle_timeout: default_idle_timeout(),
            cleanup_interval: default_cleanup_interval(),
            stats_interval: default_stats_interval(),
            reply_timeout: default_reply_timeout(),
            connect_timeout: default_destination_connect_timeout(),
        }
    }
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            bind_host: default_bind_host(),
            local_port: 0,
            destination: None,
            probe_attempts: default_probe_attempts(),
            probe_timeout: default_probe_timeout(),
            keepalive_interval: default_keepalive_interval(),
            connect_timeout: default_link_connect_timeout(),
            retry_attempts: default_retry_attempts(),
            retry_delay: default_retry_delay(),
            buffer_size: default_buffer_size(),
            reply_window: default_reply_window(),
        }
    }
}

impl Default for TunnelSection {
    fn default() -> Self {
        Self {
            encryption: false,
            compression: false,
            mtu: default_mtu(),
        }
    }
}

impl Default for DashboardSection {
    fn default() -> Self {
        Self {
            refresh_interval: default_refresh_interval(),
            history_size: default_history_size(),
        }
    }
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

impl EndpointEntry {
    /// Candidate endpoint for probing and selection
    #[must_use]
    pub fn to_candidate(&self) -> CandidateEndpoint {
        CandidateEndpoint::new(self.name.clone(), self.host.clone(), self.port)
            .with_region(self.region.clone())
            .with_location(self.location.clone())
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("gametunnel/config.toml")
    }

    /// Load config from the default path, or defaults if it doesn't exist
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read or parsed.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = Self::default_path();

        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        if self.server.max_sessions == 0 {
            anyhow::bail!("server.max_sessions must be at least 1");
        }

        for (name, size) in [
            ("server.buffer_size", self.server.buffer_size),
            ("client.buffer_size", self.client.buffer_size),
        ] {
            if !(1024..=MAX_PAYLOAD_LEN).contains(&size) {
                anyhow::bail!("{} must be between 1KB and 1MB", name);
            }
        }

        for (name, secs) in [
            ("server.idle_timeout", self.server.idle_timeout),
            ("server.cleanup_interval", self.server.cleanup_interval),
            ("server.stats_interval", self.server.stats_interval),
            ("server.reply_timeout", self.server.reply_timeout),
            ("server.connect_timeout", self.server.connect_timeout),
            ("client.probe_timeout", self.client.probe_timeout),
            ("client.keepalive_interval", self.client.keepalive_interval),
            ("client.connect_timeout", self.client.connect_timeout),
            ("client.reply_window", self.client.reply_window),
            ("dashboard.refresh_interval", self.dashboard.refresh_interval),
        ] {
            if secs == 0 {
                anyhow::bail!("{} must be at least 1 second", name);
            }
        }

        if self.client.probe_attempts == 0 {
            anyhow::bail!("client.probe_attempts must be at least 1");
        }
        if self.client.retry_attempts == 0 {
            anyhow::bail!("client.retry_attempts must be at least 1");
        }

        if let Some(destination) = &self.client.destination {
            Self::validate_host_port(destination, "Client destination")?;
        }

        if !(576..=65535).contains(&self.tunnel.mtu) {
            anyhow::bail!("tunnel.mtu must be between 576 and 65535");
        }

        if self.dashboard.history_size == 0 {
            anyhow::bail!("dashboard.history_size must be at least 1");
        }

        let mut names = HashSet::new();
        for entry in &self.servers {
            if !names.insert(entry.name.as_str()) {
                anyhow::bail!("Duplicate relay endpoint name: {}", entry.name);
            }
            Self::validate_host_port(
                &format!("{}:{}", entry.host, entry.port),
                &format!("Relay endpoint '{}'", entry.name),
            )?;
        }

        Ok(())
    }

    /// Validate host:port format
    fn validate_host_port(addr: &str, name: &str) -> anyhow::Result<()> {
        if addr.len() > MAX_ADDR_LEN {
            anyhow::bail!("{} is longer than {} bytes", name, MAX_ADDR_LEN);
        }

        let destination: Destination = addr.parse().map_err(|e| {
            anyhow::anyhow!("{} '{}' is not a valid host:port: {}", name, addr, e)
        })?;

        if destination.port == 0 {
            anyhow::bail!("{} '{}' has invalid port: 0", name, addr);
        }

        let host = &destination.host;
        if host.contains("..") || host.contains('/') || host.contains('\\') {
            anyhow::bail!("{} '{}' contains invalid characters", name, addr);
        }

        Ok(())
    }

    /// Candidate endpoints from `[[servers]]`
    #[must_use]
    pub fn endpoints(&self) -> Vec<CandidateEndpoint> {
        self.servers.iter().map(EndpointEntry::to_candidate).collect()
    }

    /// Relay server settings
    #[must_use]
    pub fn relay_config(&self) -> RelayServerConfig {
        let server = &self.server;
        RelayServerConfig {
            host: server.host.clone(),
            port: server.port,
            region: server.region.clone(),
            max_sessions: server.max_sessions,
            buffer_size: server.buffer_size,
            idle_timeout: Duration::from_secs(server.idle_timeout),
            cleanup_interval: Duration::from_secs(server.cleanup_interval),
            stats_interval: Duration::from_secs(server.stats_interval),
            reply_timeout: Duration::from_secs(server.reply_timeout),
            connect_timeout: Duration::from_secs(server.connect_timeout),
        }
    }

    /// Probe settings shared by client and dashboard
    #[must_use]
    pub fn probe_config(&self) -> ProbeConfig {
        ProbeConfig {
            attempts: self.client.probe_attempts,
            timeout: Duration::from_secs(self.client.probe_timeout),
            ..ProbeConfig::default()
        }
    }

    /// Client settings
    ///
    /// # Errors
    ///
    /// Returns an error if `client.destination` is not a valid `host:port`.
    pub fn client_config(&self) -> anyhow::Result<ClientConfig> {
        let client = &self.client;
        let destination = client
            .destination
            .as_deref()
            .map(str::parse::<Destination>)
            .transpose()
            .map_err(|e| anyhow::anyhow!("Invalid client.destination: {}", e))?;

        Ok(ClientConfig {
            bind_host: client.bind_host.clone(),
            local_port: client.local_port,
            destination,
            probe: self.probe_config(),
            keepalive_interval: Duration::from_secs(client.keepalive_interval),
            connect_timeout: Duration::from_secs(client.connect_timeout),
            retry_attempts: client.retry_attempts,
            retry_delay: Duration::from_secs(client.retry_delay),
            buffer_size: client.buffer_size,
            reply_window: Duration::from_secs(client.reply_window),
            ..ClientConfig::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.max_sessions, 1000);
        assert_eq!(config.server.buffer_size, 65536);
        assert_eq!(config.client.retry_attempts, 3);
        assert_eq!(config.client.keepalive_interval, 30);
        assert_eq!(config.dashboard.history_size, 60);
        assert!(config.servers.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
        config.logging.level = "DEBUG".to_string();
        assert!(config.validate().is_ok());

        config.server.buffer_size = 16;
        assert!(config.validate().is_err());
        config.server.buffer_size = 65536;

        config.client.destination = Some("game.example.com".to_string());
        assert!(config.validate().is_err());
        config.client.destination = Some("game.example.com:27015".to_string());
        assert!(config.validate().is_ok());

        config.servers = vec![
            EndpointEntry {
                name: "fra".to_string(),
                host: "10.0.0.1".to_string(),
                port: 8080,
                region: String::new(),
                location: String::new(),
            };
            2
        ];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [server]
            port = 9000
            max_connections = 50

            [client]
            heartbeat_interval = 10
            destination = "203.0.113.7:27015"

            [[servers]]
            name = "fra-1"
            host = "relay-fra.example.com"
            region = "eu-central"
            location = "Frankfurt"
            "#,
        )
        .unwrap();

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.max_sessions, 50);
        assert_eq!(config.server.idle_timeout, 300);
        assert_eq!(config.client.keepalive_interval, 10);
        assert_eq!(config.servers[0].port, DEFAULT_RELAY_PORT);
        assert!(config.validate().is_ok());

        let client = config.client_config().unwrap();
        assert_eq!(client.keepalive_interval, Duration::from_secs(10));
        assert_eq!(
            client.destination,
            Some(Destination::new("203.0.113.7", 27015))
        );

        let endpoints = config.endpoints();
        assert_eq!(endpoints[0].location, "Frankfurt");
        assert!(!endpoints[0].is_reachable());

        let relay = config.relay_config();
        assert_eq!(relay.max_sessions, 50);
        assert_eq!(relay.cleanup_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.toml");

        let mut config = Config::default();
        config.server.region = Some("eu-central".to_string());
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.server.region.as_deref(), Some("eu-central"));
        assert_eq!(loaded.client.bind_host, "127.0.0.1");
    }

    #[test]
    fn test_validate_host_port() {
        assert!(Config::validate_host_port("relay.example.com:8080", "Relay").is_ok());
        assert!(Config::validate_host_port("relay.example.com:0", "Relay").is_err());
        assert!(Config::validate_host_port("../etc:80", "Relay").is_err());

        let long = format!("{}:80", "h".repeat(MAX_ADDR_LEN));
        assert!(Config::validate_host_port(&long, "Relay").is_err());
    }

    #[test]
    fn test_games_section() {
        let config: Config = toml::from_str(
            r#"
            [[games]]
            name = "Counter-Strike 2"
            executable = "cs2"
            ports = [27015, 27020]
            optimization = "low-latency"
            "#,
        )
        .unwrap();

        assert_eq!(config.games.len(), 1);
        assert_eq!(config.games[0].ports, vec![27015, 27020]);
        assert_eq!(config.games[0].protocol, "udp");
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Config::load(dir.path().join("absent.toml")).is_err());
    }
}
