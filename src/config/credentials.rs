//! Credentials for Loxone authentication

use crate::error::{LoxoneError, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;

/// Loxone credentials
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoxoneCredentials {
    /// Username for Loxone authentication
    pub username: String,

    /// Password for Loxone authentication
    pub password: String,

    /// Visualization password used for secured commands
    #[serde(default)]
    pub visual_password: Option<String>,
}

impl LoxoneCredentials {
    const USERNAME_KEYS: [&'static str; 2] = ["LOXONE_USER", "LOXONE_USERNAME"];
    const PASSWORD_KEYS: [&'static str; 2] = ["LOXONE_PASS", "LOXONE_PASSWORD"];
    const VISUAL_PASSWORD_KEY: &'static str = "LOXONE_VISU_PASS";

    /// Create credentials from username and password
    pub fn new<U: Into<String>, P: Into<String>>(username: U, password: P) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            visual_password: None,
        }
    }

    /// Attach a visualization password for secured commands
    pub fn with_visual_password<S: Into<String>>(mut self, visual_password: S) -> Self {
        self.visual_password = Some(visual_password.into());
        self
    }

    /// Load credentials from environment variables
    pub fn from_env() -> Result<Self> {
        let username = Self::first_var(&Self::USERNAME_KEYS).ok_or_else(|| {
            LoxoneError::config("LOXONE_USER or LOXONE_USERNAME must be set")
        })?;
        let password = Self::first_var(&Self::PASSWORD_KEYS).ok_or_else(|| {
            LoxoneError::config("LOXONE_PASS or LOXONE_PASSWORD must be set")
        })?;

        let credentials = Self {
            username,
            password,
            visual_password: env::var(Self::VISUAL_PASSWORD_KEY).ok(),
        };
        credentials.validate()?;
        Ok(credentials)
    }

    /// Validate credentials
    pub fn validate(&self) -> Result<()> {
        if self.username.is_empty() {
            return Err(LoxoneError::config("Username cannot be empty"));
        }
        // The username is embedded in command paths
        if self.username.contains('/') {
            return Err(LoxoneError::config("Username must not contain '/'"));
        }
        Ok(())
    }

    fn first_var(keys: &[&str]) -> Option<String> {
        keys.iter().find_map(|key| env::var(key).ok())
    }
}

impl fmt::Debug for LoxoneCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoxoneCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field(
                "visual_password",
                &self.visual_password.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}
