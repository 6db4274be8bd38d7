//! Authentication token and its persisted form

use crate::crypto::HashAlg;
use crate::error::{LoxoneError, Result};
use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unix timestamp of the Loxone epoch, 2009-01-01T00:00:00Z
pub const LOXONE_EPOCH_UNIX: i64 = 1_230_768_000;

/// The Loxone epoch as a timestamp
pub fn loxone_epoch() -> DateTime<Utc> {
    Utc.timestamp_opt(LOXONE_EPOCH_UNIX, 0)
        .single()
        .unwrap_or_default()
}

/// `valid_until - (now - LOXONE_EPOCH)` in seconds
pub fn seconds_to_expire_at(valid_until: u64, now: DateTime<Utc>) -> Result<i64> {
    if valid_until == 0 {
        return Err(LoxoneError::invalid_input("Token validUntil must not be 0"));
    }
    let elapsed = now.timestamp() - LOXONE_EPOCH_UNIX;
    let valid_until = i64::try_from(valid_until).unwrap_or(i64::MAX);
    Ok(valid_until.saturating_sub(elapsed))
}

/// A token issued by the Miniserver.
///
/// Refreshing replaces the token string and `valid_until` but keeps the key.
#[derive(Clone, PartialEq, Eq)]
pub struct Token {
    token: String,
    valid_until: u64,
    hash_alg: HashAlg,
    key: String,
}

impl Token {
    pub fn new(
        token: impl Into<String>,
        valid_until: u64,
        hash_alg: HashAlg,
        key: impl Into<String>,
    ) -> Result<Self> {
        let token = token.into();
        if token.is_empty() {
            return Err(LoxoneError::invalid_input("Token string is empty"));
        }
        if valid_until == 0 {
            return Err(LoxoneError::invalid_input("Token validUntil must not be 0"));
        }
        Ok(Self {
            token,
            valid_until,
            hash_alg,
            key: key.into(),
        })
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Seconds since the Loxone epoch
    pub fn valid_until(&self) -> u64 {
        self.valid_until
    }

    pub fn hash_alg(&self) -> HashAlg {
        self.hash_alg
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Expiry as a timestamp, saturating for out-of-range values
    pub fn expires_at(&self) -> DateTime<Utc> {
        i64::try_from(self.valid_until)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .and_then(|validity| loxone_epoch().checked_add_signed(validity))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn seconds_to_expire(&self) -> Result<i64> {
        seconds_to_expire_at(self.valid_until, Utc::now())
    }

    /// Apply a refresh: new token string (when sent) and new validity
    pub fn refreshed(&self, token: Option<&str>, valid_until: u64) -> Result<Self> {
        Self::new(
            token.unwrap_or(&self.token),
            valid_until,
            self.hash_alg,
            self.key.clone(),
        )
    }

    pub(crate) fn with_hash_alg(mut self, hash_alg: HashAlg) -> Self {
        self.hash_alg = hash_alg;
        self
    }

    pub(crate) fn with_valid_until(mut self, valid_until: u64) -> Self {
        if valid_until != 0 {
            self.valid_until = valid_until;
        }
        self
    }

    /// Serializable record for the host application to persist
    pub fn to_record(&self) -> PersistedToken {
        PersistedToken {
            token: self.token.clone(),
            valid_until: self.valid_until,
            hash_alg: self.hash_alg,
            key: self.key.clone(),
        }
    }

    /// Restore a persisted token; a zero `valid_until` means no token
    pub fn from_record(record: PersistedToken) -> Result<Self> {
        Self::new(record.token, record.valid_until, record.hash_alg, record.key)
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("token", &"<redacted>")
            .field("valid_until", &self.valid_until)
            .field("hash_alg", &self.hash_alg)
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Token as stored between sessions
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedToken {
    pub token: String,
    pub valid_until: u64,
    #[serde(default)]
    pub hash_alg: HashAlg,
    pub key: String,
}

impl PersistedToken {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

impl fmt::Debug for PersistedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistedToken")
            .field("valid_until", &self.valid_until)
            .field("hash_alg", &self.hash_alg)
            .finish_non_exhaustive()
    }
}
