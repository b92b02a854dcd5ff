use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::{self, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};

use crate::forwarder::{parse_upstream, ForwardPolicy, ForwardStrategy, DEFAULT_TIMEOUT};

/// Looked up in the working directory when no `--config` is given
pub const DEFAULT_CONFIG_FILE: &str = "dns-server.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    FileRead(String, String),

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Configuration validation error: {0}")]
    Validation(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Listening socket and worker pool
    pub server: ServerConfig,

    /// Upstream resolvers for names outside the local zones
    pub forwarding: ForwardingConfig,

    pub zones: ZonesConfig,

    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_address: String,
    pub listen_port: u16,
    pub workers: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: "127.0.0.1".to_string(),
            listen_port: 5353,
            workers: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ForwardingConfig {
    /// `ip` or `ip:port`; a list, or one comma-separated string
    #[serde(deserialize_with = "deserialize_forwarders")]
    pub forwarders: Vec<String>,

    pub timeout_secs: u64,

    pub strategy: ForwardStrategy,
}

impl Default for ForwardingConfig {
    fn default() -> Self {
        Self {
            forwarders: vec!["8.8.8.8".to_string()],
            timeout_secs: DEFAULT_TIMEOUT.as_secs(),
            strategy: ForwardStrategy::Sequential,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ZonesConfig {
    pub directory: PathBuf,
}

impl Default for ZonesConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("zones"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Command-line overrides for configuration
#[derive(Debug, Default)]
pub struct CliOverrides {
    pub listen_address: Option<String>,
    pub listen_port: Option<u16>,
    pub forwarders: Option<String>,
    pub zones_dir: Option<PathBuf>,
    pub log_level: Option<String>,
}

/// Split a comma-separated forwarder list, dropping empty entries
pub fn split_forwarders(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
        .collect()
}

fn deserialize_forwarders<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    struct ForwardersVisitor;

    impl<'de> Visitor<'de> for ForwardersVisitor {
        type Value = Vec<String>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a list of addresses or a comma-separated string")
        }

        fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
            Ok(split_forwarders(value))
        }

        fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
            let mut forwarders = Vec::new();
            while let Some(entry) = seq.next_element::<String>()? {
                forwarders.extend(split_forwarders(&entry));
            }
            Ok(forwarders)
        }
    }

    deserializer.deserialize_any(ForwardersVisitor)
}

impl Config {
    /// Load configuration from file or use defaults
    ///
    /// Priority order:
    /// 1. Explicitly provided path
    /// 2. dns-server.toml in current directory
    /// 3. Default configuration
    ///
    /// CLI overrides are applied on top of whichever was used.
    pub fn load(path: Option<&Path>, cli_overrides: CliOverrides) -> Result<Self, ConfigError> {
        let mut config = if let Some(path) = path {
            Self::from_file(path)?
        } else if Path::new(DEFAULT_CONFIG_FILE).exists() {
            Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
        } else {
            Self::default()
        };

        config.apply_cli_overrides(cli_overrides);
        Ok(config)
    }

    /// Load configuration from a specific file
    fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileRead(path.display().to_string(), e.to_string()))?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    fn apply_cli_overrides(&mut self, overrides: CliOverrides) {
        if let Some(address) = overrides.listen_address {
            self.server.listen_address = address;
        }
        if let Some(port) = overrides.listen_port {
            self.server.listen_port = port;
        }
        if let Some(forwarders) = overrides.forwarders {
            self.forwarding.forwarders = split_forwarders(&forwarders);
        }
        if let Some(dir) = overrides.zones_dir {
            self.zones.directory = dir;
        }
        if let Some(level) = overrides.log_level {
            self.logging.level = level;
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.listen_port == 0 {
            return Err(ConfigError::Validation("Listen port cannot be 0".to_string()));
        }

        if self.server.workers == 0 {
            return Err(ConfigError::Validation(
                "At least one worker is required".to_string(),
            ));
        }

        if self.forwarding.timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "Forwarding timeout must be at least 1 second".to_string(),
            ));
        }

        if self.forwarding.forwarders.is_empty() {
            return Err(ConfigError::Validation(
                "No forwarders configured".to_string(),
            ));
        }

        self.listen_socket_addr()?;
        self.forward_policy()?;
        Ok(())
    }

    pub fn listen_socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self.server.listen_address.trim().parse().map_err(|_| {
            ConfigError::Validation(format!(
                "Invalid listen address '{}'",
                self.server.listen_address
            ))
        })?;
        Ok(SocketAddr::new(ip, self.server.listen_port))
    }

    pub fn forward_policy(&self) -> Result<ForwardPolicy, ConfigError> {
        let upstreams = self
            .forwarding
            .forwarders
            .iter()
            .map(|entry| parse_upstream(entry))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ConfigError::Validation(e.to_string()))?;

        Ok(ForwardPolicy {
            strategy: self.forwarding.strategy,
            ..ForwardPolicy::sequential(upstreams, Duration::from_secs(self.forwarding.timeout_secs))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();

        assert!(config.validate().is_ok());
        assert_eq!(
            config.listen_socket_addr().unwrap(),
            "127.0.0.1:5353".parse().unwrap()
        );
        assert_eq!(config.server.workers, 4);
        assert_eq!(config.zones.directory, PathBuf::from("zones"));
        assert_eq!(config.logging.level, "info");

        let policy = config.forward_policy().unwrap();
        assert_eq!(policy.upstreams, vec!["8.8.8.8:53".parse().unwrap()]);
        assert_eq!(policy.timeout, Duration::from_secs(5));
        assert_eq!(policy.strategy, ForwardStrategy::Sequential);
    }

    #[test]
    fn test_parse_full_file() {
        let config = Config::from_toml(
            r#"
            [server]
            listen_address = "0.0.0.0"
            listen_port = 5300
            workers = 8

            [forwarding]
            forwarders = ["1.1.1.1", "9.9.9.9:5353", "[2001:db8::1]:53"]
            timeout_secs = 2
            strategy = "parallel"

            [zones]
            directory = "/var/lib/dns/zones"

            [logging]
            level = "debug"
            "#,
        )
        .unwrap();

        assert!(config.validate().is_ok());
        assert_eq!(config.server.workers, 8);
        assert_eq!(config.zones.directory, PathBuf::from("/var/lib/dns/zones"));

        let policy = config.forward_policy().unwrap();
        assert_eq!(policy.upstreams.len(), 3);
        assert_eq!(policy.upstreams[1], "9.9.9.9:5353".parse().unwrap());
        assert_eq!(policy.strategy, ForwardStrategy::Parallel);
        assert_eq!(policy.timeout, Duration::from_secs(2));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = Config::from_toml("[forwarding]\nforwarders = \"1.1.1.1, 8.8.4.4\"\n").unwrap();

        assert_eq!(config.forwarding.forwarders, vec!["1.1.1.1", "8.8.4.4"]);
        assert_eq!(config.server, ServerConfig::default());
        assert_eq!(config.forwarding.timeout_secs, 5);
    }

    #[test]
    fn test_unknown_strategy_is_a_parse_error() {
        let result = Config::from_toml("[forwarding]\nstrategy = \"random\"\n");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_load_applies_cli_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nlisten_port = 5300\n\n[logging]\nlevel = \"warn\"").unwrap();

        let overrides = CliOverrides {
            listen_address: Some("::1".to_string()),
            forwarders: Some("192.0.2.53,192.0.2.54:5353".to_string()),
            zones_dir: Some(PathBuf::from("alt-zones")),
            log_level: Some("trace".to_string()),
            ..Default::default()
        };
        let config = Config::load(Some(file.path()), overrides).unwrap();

        assert_eq!(config.listen_socket_addr().unwrap(), "[::1]:5300".parse().unwrap());
        assert_eq!(config.forwarding.forwarders, vec!["192.0.2.53", "192.0.2.54:5353"]);
        assert_eq!(config.zones.directory, PathBuf::from("alt-zones"));
        assert_eq!(config.logging.level, "trace");
    }

    #[test]
    fn test_missing_file_is_a_read_error() {
        let result = Config::load(Some(Path::new("/nonexistent/dns-server.toml")), CliOverrides::default());
        assert!(matches!(result, Err(ConfigError::FileRead(..))));
    }

    fn invalid(edit: impl FnOnce(&mut Config)) -> bool {
        let mut config = Config::default();
        edit(&mut config);
        matches!(config.validate(), Err(ConfigError::Validation(_)))
    }

    #[test]
    fn test_validation() {
        assert!(invalid(|c| c.server.listen_port = 0));
        assert!(invalid(|c| c.server.workers = 0));
        assert!(invalid(|c| c.forwarding.timeout_secs = 0));
        assert!(invalid(|c| c.forwarding.forwarders.clear()));
        assert!(invalid(|c| c.forwarding.forwarders = vec!["dns.google".to_string()]));
        assert!(invalid(|c| c.server.listen_address = "localhost".to_string()));
    }
}
