//! Configuration loading and cascade resolution
//!
//! Every setting resolves through the same priority order:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable (`GANTRY_*`)
//! 3. TOML config file
//! 4. Compiled default (fallback)

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info};

/// Environment variable naming the config file location
pub const CONFIG_ENV_VAR: &str = "GANTRY_CONFIG";

/// Execution mode selected at launch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// HTTP API, static files, and the realtime bridge
    Web,
    /// Scheduled task runner, no listener
    Cron,
    /// Bootstrap only; the embedding program drives the host
    Internal,
}

impl Default for Mode {
    fn default() -> Self {
        Mode::Web
    }
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Web => "web",
            Mode::Cron => "cron",
            Mode::Internal => "internal",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "web" => Ok(Mode::Web),
            "cron" => Ok(Mode::Cron),
            "internal" => Ok(Mode::Internal),
            other => Err(Error::InvalidInput(format!(
                "unknown mode '{}' (expected web, cron, or internal)",
                other
            ))),
        }
    }
}

/// Database settings; absence of the whole section means the host
/// runs without persistence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite database file path
    pub path: PathBuf,
    /// Connection pool size
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    10
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default level filter when RUST_LOG is unset
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: "info".to_string(),
        }
    }
}

/// Host configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Deployment environment label (development, test, production, ...)
    pub environment: String,
    /// Execution mode
    pub mode: Mode,
    /// Bind address for web mode
    pub host: String,
    /// Bind port for web mode; 0 asks the OS for a free port
    pub port: u16,
    /// Directory served at the web root
    pub public_dir: PathBuf,
    /// Logging settings
    pub log: LogConfig,
    /// Database settings; `None` disables persistence and data patches
    pub database: Option<DatabaseConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            environment: "development".to_string(),
            mode: Mode::default(),
            host: "127.0.0.1".to_string(),
            port: 5650,
            public_dir: PathBuf::from("public"),
            log: LogConfig::default(),
            database: None,
        }
    }
}

/// Values taken from the command line, applied over everything else
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// Explicit config file path
    pub config_path: Option<PathBuf>,
    pub environment: Option<String>,
    pub mode: Option<Mode>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub database_path: Option<PathBuf>,
}

impl Config {
    /// Load configuration through the full cascade.
    ///
    /// A config file is optional unless named explicitly (CLI argument or
    /// `GANTRY_CONFIG`); a named file that cannot be read is an error.
    pub async fn load(overrides: &ConfigOverrides) -> Result<Config> {
        let mut config = match resolve_config_file(overrides.config_path.as_deref()) {
            Some(path) => Config::from_file(&path).await?,
            None => {
                debug!("No config file found, using defaults");
                Config::default()
            }
        };

        config.apply_env()?;
        config.apply_overrides(overrides);
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML config file
    pub async fn from_file(path: &Path) -> Result<Config> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config: Config = toml::from_str(&raw)
            .map_err(|e| Error::Config(format!("cannot parse {}: {}", path.display(), e)))?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Apply `GANTRY_*` environment variables over file values
    fn apply_env(&mut self) -> Result<()> {
        if let Ok(v) = std::env::var("GANTRY_ENVIRONMENT") {
            self.environment = v;
        }
        if let Ok(v) = std::env::var("GANTRY_MODE") {
            self.mode = v.parse()?;
        }
        if let Ok(v) = std::env::var("GANTRY_HOST") {
            self.host = v;
        }
        if let Ok(v) = std::env::var("GANTRY_PORT") {
            self.port = v
                .parse()
                .map_err(|_| Error::Config(format!("GANTRY_PORT is not a port number: {}", v)))?;
        }
        if let Ok(v) = std::env::var("GANTRY_LOG_LEVEL") {
            self.log.level = v;
        }
        if let Ok(v) = std::env::var("GANTRY_DB_PATH") {
            self.set_database_path(PathBuf::from(v));
        }
        Ok(())
    }

    /// Apply command-line values over everything else
    fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(v) = &overrides.environment {
            self.environment = v.clone();
        }
        if let Some(v) = overrides.mode {
            self.mode = v;
        }
        if let Some(v) = &overrides.host {
            self.host = v.clone();
        }
        if let Some(v) = overrides.port {
            self.port = v;
        }
        if let Some(v) = &overrides.database_path {
            self.set_database_path(v.clone());
        }
    }

    fn set_database_path(&mut self, path: PathBuf) {
        match &mut self.database {
            Some(db) => db.path = path,
            None => {
                self.database = Some(DatabaseConfig {
                    path,
                    max_connections: default_max_connections(),
                })
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if self.environment.is_empty() {
            return Err(Error::Config("environment must not be empty".to_string()));
        }
        if let Some(db) = &self.database {
            if db.path.as_os_str().is_empty() {
                return Err(Error::Config("database.path must not be empty".to_string()));
            }
            if db.max_connections == 0 {
                return Err(Error::Config(
                    "database.max_connections must be at least 1".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Locate the config file following the cascade priority order
fn resolve_config_file(cli_path: Option<&Path>) -> Option<PathBuf> {
    // Priority 1: Command-line argument
    if let Some(path) = cli_path {
        return Some(path.to_path_buf());
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        return Some(PathBuf::from(path));
    }

    // Priority 3: gantry.toml in the working directory
    let local = PathBuf::from("gantry.toml");
    if local.exists() {
        return Some(local);
    }

    // Priority 4: per-user config directory
    if let Some(dir) = dirs::config_dir() {
        let path = dir.join("gantry").join("gantry.toml");
        if path.exists() {
            return Some(path);
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_gantry_env() {
        for var in [
            "GANTRY_CONFIG",
            "GANTRY_ENVIRONMENT",
            "GANTRY_MODE",
            "GANTRY_HOST",
            "GANTRY_PORT",
            "GANTRY_LOG_LEVEL",
            "GANTRY_DB_PATH",
        ] {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.environment, "development");
        assert_eq!(config.mode, Mode::Web);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 5650);
        assert_eq!(config.log.level, "info");
        assert!(config.database.is_none());
    }

    #[test]
    fn mode_from_str() {
        assert_eq!("web".parse::<Mode>().unwrap(), Mode::Web);
        assert_eq!("CRON".parse::<Mode>().unwrap(), Mode::Cron);
        assert_eq!("internal".parse::<Mode>().unwrap(), Mode::Internal);
        assert!("webs".parse::<Mode>().is_err());
    }

    #[test]
    fn parse_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            port = 8080

            [database]
            path = "data/app.db"
            "#,
        )
        .unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.host, "127.0.0.1");
        let db = config.database.unwrap();
        assert_eq!(db.path, PathBuf::from("data/app.db"));
        assert_eq!(db.max_connections, 10);
    }

    #[test]
    fn parse_full_toml() {
        let config: Config = toml::from_str(
            r#"
            environment = "production"
            mode = "cron"
            host = "0.0.0.0"
            port = 80
            public_dir = "static"

            [log]
            level = "debug"

            [database]
            path = "/var/lib/gantry/app.db"
            max_connections = 4
            "#,
        )
        .unwrap();
        assert_eq!(config.environment, "production");
        assert_eq!(config.mode, Mode::Cron);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 80);
        assert_eq!(config.public_dir, PathBuf::from("static"));
        assert_eq!(config.log.level, "debug");
        assert_eq!(config.database.unwrap().max_connections, 4);
    }

    #[tokio::test]
    #[serial]
    async fn env_overrides_defaults() {
        clear_gantry_env();
        std::env::set_var("GANTRY_MODE", "cron");
        std::env::set_var("GANTRY_PORT", "9000");

        let config = Config::load(&ConfigOverrides::default()).await.unwrap();
        assert_eq!(config.mode, Mode::Cron);
        assert_eq!(config.port, 9000);

        clear_gantry_env();
    }

    #[tokio::test]
    #[serial]
    async fn cli_overrides_env() {
        clear_gantry_env();
        std::env::set_var("GANTRY_PORT", "9000");
        std::env::set_var("GANTRY_DB_PATH", "/tmp/env.db");

        let overrides = ConfigOverrides {
            port: Some(7000),
            database_path: Some(PathBuf::from("/tmp/cli.db")),
            ..Default::default()
        };
        let config = Config::load(&overrides).await.unwrap();
        assert_eq!(config.port, 7000);
        assert_eq!(config.database.unwrap().path, PathBuf::from("/tmp/cli.db"));

        clear_gantry_env();
    }

    #[tokio::test]
    #[serial]
    async fn bad_env_port_is_rejected() {
        clear_gantry_env();
        std::env::set_var("GANTRY_PORT", "not-a-port");

        let result = Config::load(&ConfigOverrides::default()).await;
        assert!(matches!(result, Err(Error::Config(_))));

        clear_gantry_env();
    }

    #[tokio::test]
    #[serial]
    async fn explicit_missing_file_is_an_error() {
        clear_gantry_env();
        let overrides = ConfigOverrides {
            config_path: Some(PathBuf::from("/nonexistent/gantry.toml")),
            ..Default::default()
        };
        let result = Config::load(&overrides).await;
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
