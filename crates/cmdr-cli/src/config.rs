//! Configuration loading and types

use std::path::{Path, PathBuf};

use cmdr_exec::{ConnectionInfo, ExecConfig};
use serde::{Deserialize, Serialize};

/// Top-level configuration for the cmdr CLI
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Logging settings
    #[serde(default)]
    pub log: LogConfig,
    /// Timeout and framing defaults
    #[serde(default)]
    pub exec: ExecConfig,
    /// Default remote host
    pub remote: Option<ConnectionInfo>,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON log lines
    #[serde(default)]
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "warn".to_string()
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    /// Returns error if file cannot be read or parsed
    pub fn load(path: &Path) -> eyre::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load from an explicit path, default paths, or use defaults
    ///
    /// # Errors
    /// Returns error if a config file exists but cannot be parsed
    pub fn load_default(explicit: Option<&Path>) -> eyre::Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        // Check environment variable
        if let Ok(path) = std::env::var("CMDR_CONFIG") {
            return Self::load(&PathBuf::from(path));
        }

        // Try common paths
        let mut paths = vec![
            PathBuf::from("cmdr.toml"),
            PathBuf::from("/etc/cmdr/cmdr.toml"),
        ];
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join("cmdr/cmdr.toml"));
        }

        for path in paths {
            if path.exists() {
                return Self::load(&path);
            }
        }

        Ok(Config::default())
    }
}

#[cfg(test)]
mod tests {
    use cmdr_exec::Framing;

    use super::*;

    #[test]
    fn test_parse_full_config() {
        let config: Config = toml::from_str(
            r#"
            [log]
            level = "debug"

            [exec]
            timeout_secs = 30

            [exec.stdout]
            max_bytes = 512

            [exec.stderr]
            delimiter = ";"

            [remote]
            host = "build.example.org"
            user = "ci"
            ssh_key = "/home/ci/.ssh/id_ed25519"
            "#,
        )
        .unwrap();

        assert_eq!(config.log.level, "debug");
        let options = config.exec.options().unwrap();
        assert_eq!(options.timeout.as_secs(), 30);
        assert_eq!(options.stdout, Framing::Fixed(512));
        assert_eq!(options.stderr, Framing::Delimited(b';'));

        let remote = config.remote.unwrap();
        assert_eq!(remote.port, 22);
        assert_eq!(remote.address(), "build.example.org:22");
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();

        assert_eq!(config.log.level, "warn");
        assert!(!config.log.json);
        assert_eq!(config.exec, ExecConfig::default());
        assert!(config.remote.is_none());
    }
}
