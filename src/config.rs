//! Configuration file support
//!
//! Loads configuration from ~/.config/ndtc/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub client: ClientDefaults,

    #[serde(default)]
    pub timings: TimingOverrides,

    #[serde(default)]
    pub servers: Vec<ServerPreset>,
}

/// Default settings for the client
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ClientDefaults {
    /// Default server host
    pub host: Option<String>,

    /// Control port (defaults to 3001, or 3010 with TLS)
    pub port: Option<u16>,

    /// Enable TLS
    pub tls: Option<bool>,

    /// Skip TLS certificate verification
    pub tls_insecure: Option<bool>,

    /// Extra CA bundle for TLS servers
    pub tls_ca: Option<String>,

    /// Client certificate and key for TLS servers that ask for one
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,

    /// Address family preference (ipv4, ipv6, dual)
    pub address_family: Option<String>,

    /// Tests to request (e.g., "c2s,s2c,meta")
    pub tests: Option<String>,

    /// Application name reported in the META test
    pub application: Option<String>,

    /// User-agent string the META browser name is derived from
    pub user_agent: Option<String>,

    /// Default to JSON output
    pub json_output: Option<bool>,

    /// Log file path (e.g., "~/.config/ndtc/ndtc.log", null to disable)
    pub log_file: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    pub log_level: Option<String>,
}

/// `[timings]` table, all values in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TimingOverrides {
    pub connect_timeout_ms: Option<u64>,
    pub preamble_timeout_ms: Option<u64>,
    pub control_timeout_ms: Option<u64>,
    pub c2s_duration_ms: Option<u64>,
    pub s2c_max_elapsed_ms: Option<u64>,
    pub s2c_read_timeout_ms: Option<u64>,
    pub s2c_diagnostics_timeout_ms: Option<u64>,
    pub sample_interval_ms: Option<u64>,
}

/// Named server for quick selection (used with --server)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerPreset {
    pub name: String,
    pub host: String,
    pub port: Option<u16>,
    pub tls: Option<bool>,
}

/// Protocol timing constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    pub connect_timeout: Duration,
    /// Wait for the 13-byte preamble after login
    pub preamble_timeout: Duration,
    /// Every other control-channel read
    pub control_timeout: Duration,
    /// Upload watchdog
    pub c2s_duration: Duration,
    /// Download loop cap
    pub s2c_max_elapsed: Duration,
    /// Per-read timeout on the download data connection
    pub s2c_read_timeout: Duration,
    /// Reads of the post-download variable dumps
    pub s2c_diagnostics_timeout: Duration,
    /// Live throughput sample period
    pub sample_interval: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            preamble_timeout: Duration::from_secs(30),
            control_timeout: Duration::from_secs(60),
            c2s_duration: Duration::from_secs(10),
            s2c_max_elapsed: Duration::from_millis(14_500),
            s2c_read_timeout: Duration::from_secs(15),
            s2c_diagnostics_timeout: Duration::from_secs(5),
            sample_interval: Duration::from_millis(500),
        }
    }
}

impl Timings {
    /// Apply the `[timings]` table on top of these values.
    pub fn with_overrides(mut self, o: &TimingOverrides) -> Self {
        let apply = |slot: &mut Duration, ms: Option<u64>| {
            if let Some(ms) = ms {
                *slot = Duration::from_millis(ms);
            }
        };
        apply(&mut self.connect_timeout, o.connect_timeout_ms);
        apply(&mut self.preamble_timeout, o.preamble_timeout_ms);
        apply(&mut self.control_timeout, o.control_timeout_ms);
        apply(&mut self.c2s_duration, o.c2s_duration_ms);
        apply(&mut self.s2c_max_elapsed, o.s2c_max_elapsed_ms);
        apply(&mut self.s2c_read_timeout, o.s2c_read_timeout_ms);
        apply(&mut self.s2c_diagnostics_timeout, o.s2c_diagnostics_timeout_ms);
        apply(&mut self.sample_interval, o.sample_interval_ms);
        self
    }
}

impl Config {
    /// Load configuration from the default path.
    /// Returns default config if file doesn't exist.
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();
        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)?;
            Ok(toml::from_str(&contents)?)
        } else {
            Ok(Self::default())
        }
    }

    /// Get the default config file path
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("ndtc")
            .join("config.toml")
    }

    /// Get a server preset by name
    pub fn get_server(&self, name: &str) -> Option<&ServerPreset> {
        self.servers.iter().find(|p| p.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.servers.is_empty());
        assert!(config.client.host.is_none());
        assert_eq!(
            Timings::default().with_overrides(&config.timings),
            Timings::default()
        );
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[client]
host = "ndt.example.net"
tls = true
tests = "c2s,meta"

[timings]
c2s_duration_ms = 5000
sample_interval_ms = 250

[[servers]]
name = "lab"
host = "10.0.0.5"
port = 3001
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.client.host.as_deref(), Some("ndt.example.net"));
        assert_eq!(config.client.tls, Some(true));
        assert_eq!(config.client.tests.as_deref(), Some("c2s,meta"));

        let timings = Timings::default().with_overrides(&config.timings);
        assert_eq!(timings.c2s_duration, Duration::from_secs(5));
        assert_eq!(timings.sample_interval, Duration::from_millis(250));
        assert_eq!(timings.s2c_max_elapsed, Duration::from_millis(14_500));
    }

    #[test]
    fn test_get_server() {
        let toml = r#"
[[servers]]
name = "lab"
host = "10.0.0.5"

[[servers]]
name = "public"
host = "ndt.example.net"
tls = true
"#;
        let config: Config = toml::from_str(toml).unwrap();

        let lab = config.get_server("lab").unwrap();
        assert_eq!(lab.host, "10.0.0.5");
        assert!(lab.port.is_none());

        let public = config.get_server("public").unwrap();
        assert_eq!(public.tls, Some(true));

        assert!(config.get_server("nonexistent").is_none());
    }
}
