//! Authentication material for remote execution

use std::fmt;
use std::sync::Arc;

use russh::keys::PrivateKey;

use crate::error::ExecError;
use crate::keys::KeySource;

/// Validated credential used to dial a remote host
#[derive(Clone)]
pub struct Credential {
    user: String,
    auth: Auth,
}

#[derive(Clone)]
pub(crate) enum Auth {
    /// Keyboard-interactive, falling back to plain password auth
    Password(String),
    /// Public key auth
    Key(Arc<PrivateKey>),
}

impl Credential {
    /// Build a credential from a username plus a password or a key
    ///
    /// A password wins when both are given.
    ///
    /// # Errors
    /// Returns `ExecError::InvalidArgument` if the username is empty or
    /// neither secret is given, and `ExecError::KeyLoad` if the key cannot
    /// be read or parsed
    pub fn new(
        user: &str,
        password: Option<&str>,
        key: Option<&KeySource>,
    ) -> Result<Self, ExecError> {
        if user.is_empty() {
            return Err(missing_arguments());
        }

        let auth = match (password.filter(|p| !p.is_empty()), key) {
            (Some(password), _) => Auth::Password(password.to_string()),
            (None, Some(source)) => {
                let key = source
                    .load()
                    .map_err(|e| ExecError::KeyLoad(e.to_string()))?;
                Auth::Key(Arc::new(key))
            }
            (None, None) => return Err(missing_arguments()),
        };

        Ok(Self {
            user: user.to_string(),
            auth,
        })
    }

    /// Password credential
    ///
    /// # Errors
    /// Returns `ExecError::InvalidArgument` if either argument is empty
    pub fn password(user: &str, password: &str) -> Result<Self, ExecError> {
        if password.is_empty() {
            return Err(missing_arguments());
        }
        Self::new(user, Some(password), None)
    }

    /// Key credential
    ///
    /// # Errors
    /// Returns `ExecError::KeyLoad` if the key cannot be loaded
    pub fn key(user: &str, source: &KeySource) -> Result<Self, ExecError> {
        Self::new(user, None, Some(source))
    }

    /// Username to authenticate as
    #[must_use]
    pub fn user(&self) -> &str {
        &self.user
    }

    pub(crate) fn auth(&self) -> &Auth {
        &self.auth
    }
}

fn missing_arguments() -> ExecError {
    ExecError::InvalidArgument(
        "must pass a (username and password) or (username and key)".to_string(),
    )
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let method = match self.auth {
            Auth::Password(_) => "password",
            Auth::Key(_) => "publickey",
        };
        f.debug_struct("Credential")
            .field("user", &self.user)
            .field("method", &method)
            .finish_non_exhaustive()
    }
}
