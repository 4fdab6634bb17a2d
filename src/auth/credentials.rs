//! Password lookup for SASL authentication.

use std::fmt;

/// Source of passwords for SCRAM authentication.
pub trait CredentialSource: Send + Sync {
    /// Returns the password for `username`, or `None` if the user is unknown.
    fn password_for(&self, username: &str) -> Option<String>;
}

/// A single fixed identity.
///
/// This is the only identity the bridge authenticates. Lookups for any other
/// username fail.
#[derive(Clone)]
pub struct StaticCredentials {
    username: String,
    password: String,
}

impl StaticCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }
}

impl Default for StaticCredentials {
    fn default() -> Self {
        Self::new("Administrator", "password")
    }
}

// Keep the password out of logs.
impl fmt::Debug for StaticCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl CredentialSource for StaticCredentials {
    fn password_for(&self, username: &str) -> Option<String> {
        (username == self.username).then(|| self.password.clone())
    }
}
