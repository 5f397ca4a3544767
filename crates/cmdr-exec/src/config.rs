//! Serializable execution and connection settings

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::credential::Credential;
use crate::error::ExecError;
use crate::executor::ExecOptions;
use crate::keys::KeySource;
use crate::stream::Framing;

/// Execution settings shared by both executors
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecConfig {
    /// Timeout in seconds; 0 disables it
    #[serde(default)]
    pub timeout_secs: u64,
    /// Framing of stdout items
    #[serde(default)]
    pub stdout: StreamConfig,
    /// Framing of stderr items
    #[serde(default)]
    pub stderr: StreamConfig,
}

impl ExecConfig {
    /// Convert into runtime options
    ///
    /// # Errors
    /// Returns `ExecError::Config` if a delimiter is not a single ASCII
    /// character
    pub fn options(&self) -> Result<ExecOptions, ExecError> {
        Ok(ExecOptions {
            timeout: Duration::from_secs(self.timeout_secs),
            stdout: self.stdout.framing()?,
            stderr: self.stderr.framing()?,
        })
    }
}

/// Framing settings for one output stream
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Fixed chunk size in bytes; 0 selects delimiter framing
    #[serde(default)]
    pub max_bytes: usize,
    /// Record delimiter (defaults to newline)
    pub delimiter: Option<char>,
}

impl StreamConfig {
    /// Resolve into a [`Framing`]
    ///
    /// # Errors
    /// Returns `ExecError::Config` if the delimiter is not ASCII
    pub fn framing(&self) -> Result<Framing, ExecError> {
        let delimiter = match self.delimiter {
            None => 0,
            Some(c) if c.is_ascii() => c as u8,
            Some(c) => {
                return Err(ExecError::Config(format!(
                    "delimiter {c:?} is not a single-byte ASCII character"
                )));
            }
        };
        Ok(Framing::from_parts(self.max_bytes, delimiter))
    }
}

/// Connection information for SSH
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Host address
    pub host: String,
    /// Port (default 22)
    #[serde(default = "default_port")]
    pub port: u16,
    /// Username
    pub user: String,
    /// Password for password or keyboard-interactive auth
    pub password: Option<String>,
    /// Optional SSH key path
    pub ssh_key: Option<PathBuf>,
    /// Environment variable holding a base64 encoded private key
    pub ssh_key_env: Option<String>,
}

fn default_port() -> u16 {
    22
}

impl ConnectionInfo {
    /// Create new connection info
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            user: user.into(),
            password: None,
            ssh_key: None,
            ssh_key_env: None,
        }
    }

    /// Set password
    #[must_use]
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Set SSH key path
    #[must_use]
    pub fn with_ssh_key(mut self, path: impl Into<PathBuf>) -> Self {
        self.ssh_key = Some(path.into());
        self
    }

    /// Set custom port
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// `host:port` address to dial
    #[must_use]
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            // bare IPv6 literal
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Where the private key comes from, if any
    #[must_use]
    pub fn key_source(&self) -> Option<KeySource> {
        self.ssh_key
            .clone()
            .map(KeySource::Path)
            .or_else(|| self.ssh_key_env.clone().map(KeySource::Env))
    }

    /// Build the credential described by this connection
    ///
    /// # Errors
    /// See [`Credential::new`]
    pub fn credential(&self) -> Result<Credential, ExecError> {
        Credential::new(
            &self.user,
            self.password.as_deref(),
            self.key_source().as_ref(),
        )
    }
}
