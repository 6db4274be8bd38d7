//! Rotating salt prefixed to every encrypted command

use crate::config::ProtocolConfig;
use rand::{thread_rng, RngCore};
use std::fmt;
use std::time::{Duration, Instant};

/// A random hex salt with its age and use counter
#[derive(Debug, Clone)]
pub struct Salt {
    value: String,
    created_at: Instant,
    use_count: u32,
}

impl Salt {
    /// Generate a fresh salt of `bytes` random bytes
    pub fn generate(bytes: usize) -> Self {
        Self::generate_at(bytes, Instant::now())
    }

    /// Generate a fresh salt stamped with `now`
    pub fn generate_at(bytes: usize, now: Instant) -> Self {
        let mut raw = vec![0u8; bytes];
        thread_rng().fill_bytes(&mut raw);
        Self {
            value: hex::encode(raw),
            created_at: now,
            use_count: 0,
        }
    }

    /// Hex value
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Number of encrypted commands that carried this salt
    pub fn use_count(&self) -> u32 {
        self.use_count
    }

    /// Creation timestamp
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    fn is_exhausted(&self, now: Instant, max_use_count: u32, max_age: Duration) -> bool {
        self.use_count > max_use_count || now.saturating_duration_since(self.created_at) > max_age
    }
}

/// Salt section of the plaintext envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaltPrefix {
    /// `salt/<salt>/`
    Current(String),
    /// `nextSalt/<old>/<new>/`, announces the rotation to the server
    Next { old: String, new: String },
}

impl fmt::Display for SaltPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SaltPrefix::Current(salt) => write!(f, "salt/{salt}/"),
            SaltPrefix::Next { old, new } => write!(f, "nextSalt/{old}/{new}/"),
        }
    }
}

/// Owns the current salt and decides when it rotates.
///
/// Exactly one use is consumed per call to [`SaltRotation::next_prefix`].
#[derive(Debug)]
pub struct SaltRotation {
    current: Salt,
    salt_bytes: usize,
    max_use_count: u32,
    max_age: Duration,
}

impl SaltRotation {
    /// Start with a fresh salt
    pub fn new(config: &ProtocolConfig) -> Self {
        Self {
            current: Salt::generate(config.salt_bytes),
            salt_bytes: config.salt_bytes,
            max_use_count: config.salt_max_use_count,
            max_age: config.salt_max_age,
        }
    }

    /// The salt the next command will use unless it rotates
    pub fn current(&self) -> &Salt {
        &self.current
    }

    /// Prefix for the next encrypted command
    pub fn next_prefix(&mut self) -> SaltPrefix {
        self.next_prefix_at(Instant::now())
    }

    /// Prefix for the next encrypted command, evaluated at `now`
    pub fn next_prefix_at(&mut self, now: Instant) -> SaltPrefix {
        let prefix = if self
            .current
            .is_exhausted(now, self.max_use_count, self.max_age)
        {
            let old = std::mem::replace(&mut self.current, Salt::generate_at(self.salt_bytes, now));
            SaltPrefix::Next {
                old: old.value,
                new: self.current.value.clone(),
            }
        } else {
            SaltPrefix::Current(self.current.value.clone())
        };

        self.current.use_count += 1;
        prefix
    }
}
