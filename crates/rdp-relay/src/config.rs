//! Configuration management

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pool::PoolConfig;
use crate::session::DEFAULT_BUFFER_SIZE;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Backend row seeded into the pool at startup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendSeed {
    pub address: String,
    #[serde(default = "default_weight")]
    pub weight: i64,
}

fn default_weight() -> i64 {
    1
}

/// Static client -> backend assignment seeded at startup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticSeed {
    pub client: String,
    pub backend: String,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub status_addr: Option<SocketAddr>,
    pub http_addr: Option<SocketAddr>,
    pub database_path: PathBuf,
    pub backend_port: u16,
    pub buffer_size: usize,
    pub connect_timeout_secs: u64,
    pub cleanup_interval_secs: u64,
    pub grace_period_secs: u64,
    pub backends: Vec<BackendSeed>,
    pub static_assignments: Vec<StaticSeed>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 3389)),
            status_addr: Some(SocketAddr::from(([0, 0, 0, 0], 3391))),
            http_addr: Some(SocketAddr::from(([127, 0, 0, 1], 9389))),
            database_path: PathBuf::from("db.sqlite3"),
            backend_port: 3389,
            buffer_size: DEFAULT_BUFFER_SIZE,
            connect_timeout_secs: 10,
            cleanup_interval_secs: 3,
            grace_period_secs: 600, // 10 minutes
            backends: Vec::new(),
            static_assignments: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, command line, and TOML file
    pub fn load() -> Result<Self, ConfigError> {
        let args: Vec<String> = std::env::args().skip(1).collect();
        Self::load_from(&args)
    }

    /// Same as [`ServerConfig::load`] with explicit arguments (without argv[0]).
    pub fn load_from(args: &[String]) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        config.load_from_env()?;
        config.load_from_args(args)?;

        let config_path = config_path_arg(args).or_else(|| std::env::var("RDP_RELAY_CONFIG").ok());
        if let Some(path) = config_path {
            config.load_from_toml(&path)?;
        }

        config.validate()?;
        Ok(config)
    }

    fn load_from_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(addr) = std::env::var("RDP_RELAY_LISTEN_ADDR") {
            self.listen_addr = parse_addr("listen_addr", &addr)?;
        }

        if let Ok(addr) = std::env::var("RDP_RELAY_STATUS_ADDR") {
            self.status_addr = parse_optional_addr("status_addr", &addr)?;
        }

        if let Ok(addr) = std::env::var("RDP_RELAY_HTTP_ADDR") {
            self.http_addr = parse_optional_addr("http_addr", &addr)?;
        }

        if let Ok(path) = std::env::var("RDP_RELAY_DATABASE_PATH") {
            self.database_path = PathBuf::from(path);
        }

        if let Ok(port) = std::env::var("RDP_RELAY_BACKEND_PORT") {
            self.backend_port = port
                .parse()
                .map_err(|e| ConfigError::Invalid(format!("Invalid backend_port: {}", e)))?;
        }

        Ok(())
    }

    /// Load from command line arguments
    fn load_from_args(&mut self, args: &[String]) -> Result<(), ConfigError> {
        let mut i = 0;
        while i < args.len() {
            let flag = args[i].as_str();
            let takes_value = matches!(
                flag,
                "--listen-addr"
                    | "-l"
                    | "--status-addr"
                    | "--http-addr"
                    | "--database"
                    | "-d"
                    | "--backend-port"
                    | "-p"
                    | "--config"
                    | "-f"
            );
            if !takes_value {
                i += 1;
                continue;
            }

            let value = args
                .get(i + 1)
                .ok_or_else(|| ConfigError::Invalid(format!("{} requires a value", flag)))?;

            match flag {
                "--listen-addr" | "-l" => self.listen_addr = parse_addr("listen_addr", value)?,
                "--status-addr" => self.status_addr = parse_optional_addr("status_addr", value)?,
                "--http-addr" => self.http_addr = parse_optional_addr("http_addr", value)?,
                "--database" | "-d" => self.database_path = PathBuf::from(value),
                "--backend-port" | "-p" => {
                    self.backend_port = value
                        .parse()
                        .map_err(|e| ConfigError::Invalid(format!("Invalid backend_port: {}", e)))?;
                }
                // Config file path - loaded separately
                _ => {}
            }
            i += 2;
        }
        Ok(())
    }

    /// Load from TOML config file
    pub fn load_from_toml(&mut self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.merge_toml(&content)
    }

    fn merge_toml(&mut self, content: &str) -> Result<(), ConfigError> {
        let toml_config: toml::Value = toml::from_str(content)?;

        if let Some(addr) = toml_config.get("listen_addr").and_then(|v| v.as_str()) {
            self.listen_addr = parse_addr("listen_addr in TOML", addr)?;
        }

        if let Some(addr) = toml_config.get("status_addr").and_then(|v| v.as_str()) {
            self.status_addr = parse_optional_addr("status_addr in TOML", addr)?;
        }

        if let Some(addr) = toml_config.get("http_addr").and_then(|v| v.as_str()) {
            self.http_addr = parse_optional_addr("http_addr in TOML", addr)?;
        }

        if let Some(path) = toml_config.get("database_path").and_then(|v| v.as_str()) {
            self.database_path = PathBuf::from(path);
        }

        if let Some(port) = toml_config.get("backend_port").and_then(|v| v.as_integer()) {
            self.backend_port = u16::try_from(port)
                .map_err(|_| ConfigError::Invalid(format!("backend_port out of range: {}", port)))?;
        }

        if let Some(size) = toml_config.get("buffer_size").and_then(|v| v.as_integer()) {
            self.buffer_size = size.max(0) as usize;
        }

        if let Some(secs) = toml_config.get("connect_timeout_secs").and_then(|v| v.as_integer()) {
            self.connect_timeout_secs = secs.max(0) as u64;
        }

        if let Some(secs) = toml_config.get("cleanup_interval_secs").and_then(|v| v.as_integer()) {
            self.cleanup_interval_secs = secs.max(0) as u64;
        }

        if let Some(secs) = toml_config.get("grace_period_secs").and_then(|v| v.as_integer()) {
            self.grace_period_secs = secs.max(0) as u64;
        }

        if let Some(backends) = toml_config.get("backends") {
            self.backends = backends.clone().try_into()?;
        }

        if let Some(assignments) = toml_config.get("static_assignments") {
            self.static_assignments = assignments.clone().try_into()?;
        }

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_size == 0 {
            return Err(ConfigError::Invalid("buffer_size must be > 0".to_string()));
        }

        if self.cleanup_interval_secs == 0 {
            return Err(ConfigError::Invalid("cleanup_interval_secs must be > 0".to_string()));
        }

        if self.backend_port == 0 {
            return Err(ConfigError::Invalid("backend_port must be > 0".to_string()));
        }

        if self.connect_timeout_secs == 0 {
            return Err(ConfigError::Invalid("connect_timeout_secs must be > 0".to_string()));
        }

        if let Some(seed) = self.backends.iter().find(|b| b.address.trim().is_empty()) {
            return Err(ConfigError::Invalid(format!(
                "backend address must not be empty (weight {})",
                seed.weight
            )));
        }

        if let Some(seed) = self
            .static_assignments
            .iter()
            .find(|s| s.client.trim().is_empty() || s.backend.trim().is_empty())
        {
            return Err(ConfigError::Invalid(format!(
                "static assignment needs both client and backend: {:?}",
                seed
            )));
        }

        Ok(())
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            backend_port: self.backend_port,
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            grace_period: Duration::from_secs(self.grace_period_secs),
        }
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

fn config_path_arg(args: &[String]) -> Option<String> {
    args.iter()
        .position(|a| a == "--config" || a == "-f")
        .and_then(|i| args.get(i + 1).cloned())
}

fn parse_addr(what: &str, value: &str) -> Result<SocketAddr, ConfigError> {
    value
        .parse()
        .map_err(|e| ConfigError::Invalid(format!("Invalid {}: {}", what, e)))
}

/// `"off"` or an empty string disables an optional listener.
fn parse_optional_addr(what: &str, value: &str) -> Result<Option<SocketAddr>, ConfigError> {
    match value.trim() {
        "" | "off" | "none" => Ok(None),
        v => parse_addr(what, v).map(Some),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = ServerConfig::default();
        config.validate().unwrap();
        assert_eq!(config.listen_addr.port(), 3389);
        assert_eq!(config.status_addr.map(|a| a.port()), Some(3391));
        assert_eq!(config.pool_config().grace_period, Duration::from_secs(600));
        assert_eq!(config.cleanup_interval(), Duration::from_secs(3));
    }

    #[test]
    fn test_command_line_overrides() {
        let mut config = ServerConfig::default();
        config
            .load_from_args(&args(&[
                "-l",
                "127.0.0.1:13389",
                "--status-addr",
                "off",
                "--backend-port",
                "3390",
                "--database",
                "/tmp/pool.db",
                "--verbose",
            ]))
            .unwrap();

        assert_eq!(config.listen_addr, "127.0.0.1:13389".parse().unwrap());
        assert_eq!(config.status_addr, None);
        assert_eq!(config.backend_port, 3390);
        assert_eq!(config.database_path, PathBuf::from("/tmp/pool.db"));
    }

    #[test]
    fn test_missing_flag_value() {
        let mut config = ServerConfig::default();
        let err = config.load_from_args(&args(&["--listen-addr"])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_toml_file_with_seeds() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("relay.toml");
        std::fs::write(
            &path,
            r#"
            listen_addr = "0.0.0.0:13389"
            grace_period_secs = 30
            cleanup_interval_secs = 1
            http_addr = "off"

            [[backends]]
            address = "10.0.0.1"
            weight = 10

            [[backends]]
            address = "10.0.0.2"

            [[static_assignments]]
            client = "192.168.1.50"
            backend = "10.0.0.2"
            "#,
        )
        .unwrap();

        let config = ServerConfig::load_from(&args(&["--config", path.to_str().unwrap()])).unwrap();
        assert_eq!(config.listen_addr.port(), 13389);
        assert_eq!(config.grace_period_secs, 30);
        assert_eq!(config.http_addr, None);
        assert_eq!(
            config.backends,
            vec![
                BackendSeed { address: "10.0.0.1".to_string(), weight: 10 },
                BackendSeed { address: "10.0.0.2".to_string(), weight: 1 },
            ]
        );
        assert_eq!(config.static_assignments[0].client, "192.168.1.50");
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = ServerConfig::default();
        config.buffer_size = 0;
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.backends.push(BackendSeed { address: " ".to_string(), weight: 1 });
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        assert!(config.merge_toml("backend_port = 70000").is_err());
    }
}
