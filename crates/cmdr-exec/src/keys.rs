//! SSH key loading

use std::env;
use std::path::{Path, PathBuf};

use russh::keys::{PrivateKey, decode_secret_key, load_secret_key};
use tracing::debug;

/// Where a private key comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySource {
    /// Explicit path to key file
    Path(PathBuf),
    /// Base64-encoded key from environment
    Env(String),
}

impl KeySource {
    /// Read and parse the private key
    ///
    /// # Errors
    /// Returns `KeyError` if the key cannot be read, decoded or parsed
    pub fn load(&self) -> Result<PrivateKey, KeyError> {
        match self {
            KeySource::Path(path) => {
                validate_key_permissions(path)?;
                let key = load_secret_key(path, None)
                    .map_err(|e| KeyError::Parse(format!("{}: {e}", path.display())))?;
                debug!(path = %path.display(), "loaded SSH key");
                Ok(key)
            }
            KeySource::Env(var_name) => {
                let base64_key =
                    env::var(var_name).map_err(|_| KeyError::EnvNotSet(var_name.clone()))?;
                let key_data = base64_decode(&base64_key).map_err(|_| KeyError::InvalidBase64)?;
                let pem = String::from_utf8(key_data).map_err(|_| KeyError::InvalidBase64)?;
                let key = decode_secret_key(&pem, None)
                    .map_err(|e| KeyError::Parse(format!("${var_name}: {e}")))?;
                debug!(var = %var_name, "loaded SSH key from environment");
                Ok(key)
            }
        }
    }
}

/// Key loading errors
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("environment variable {0} not set")]
    EnvNotSet(String),

    #[error("invalid base64 encoding")]
    InvalidBase64,

    #[error("key file permissions too open: {0} (should be 600)")]
    BadPermissions(String),

    #[error("key file not found: {0}")]
    NotFound(String),

    #[error("invalid private key {0}")]
    Parse(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn base64_decode(input: &str) -> Result<Vec<u8>, base64::DecodeError> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.decode(input.trim())
}

fn validate_key_permissions(path: &Path) -> Result<(), KeyError> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = std::fs::metadata(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => KeyError::NotFound(path.display().to_string()),
        _ => KeyError::Io(e),
    })?;

    // group and other bits must be clear
    if metadata.permissions().mode() & 0o77 != 0 {
        return Err(KeyError::BadPermissions(path.display().to_string()));
    }

    Ok(())
}
