//! Per-session key material and the encrypted command envelope

use super::{aes, rsa, salt::SaltRotation};
use crate::config::ProtocolConfig;
use crate::error::{LoxoneError, Result};
use crate::protocol::commands;
use base64::{engine::general_purpose, Engine as _};
use openssl::pkey::Public;
use openssl::rsa::Rsa;
use rand::{thread_rng, RngCore};
use std::fmt;
use std::sync::Arc;

/// Random AES key and IV generated once per connect attempt.
///
/// Immutable after creation, so it is shared between the drain loop (encrypt)
/// and the receive loop (decrypt) behind an `Arc`.
pub struct SessionKeys {
    key: [u8; 32],
    iv: [u8; 16],
}

impl SessionKeys {
    /// Generate a fresh AES-256 key and IV
    pub fn generate() -> Self {
        let mut key = [0u8; 32];
        let mut iv = [0u8; 16];
        let mut rng = thread_rng();
        rng.fill_bytes(&mut key);
        rng.fill_bytes(&mut iv);
        Self { key, iv }
    }

    /// Build from known key material
    pub fn from_parts(key: [u8; 32], iv: [u8; 16]) -> Self {
        Self { key, iv }
    }

    /// Parse the `"<key_hex>:<iv_hex>"` form sent during key exchange
    pub fn from_exchange_payload(payload: &str) -> Result<Self> {
        let (key_hex, iv_hex) = payload
            .split_once(':')
            .ok_or_else(|| LoxoneError::crypto("Key exchange payload lacks ':'"))?;
        let key: [u8; 32] = hex::decode(key_hex)
            .ok()
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or_else(|| LoxoneError::crypto("Session key must be 32 hex encoded bytes"))?;
        let iv: [u8; 16] = hex::decode(iv_hex)
            .ok()
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or_else(|| LoxoneError::crypto("Session IV must be 16 hex encoded bytes"))?;
        Ok(Self { key, iv })
    }

    /// `"<aes_key_hex>:<iv_hex>"`, the plaintext of the key exchange
    pub fn exchange_payload(&self) -> String {
        format!("{}:{}", hex::encode(self.key), hex::encode(self.iv))
    }

    /// RSA-encrypted, base64 encoded session key
    pub fn encrypted_session_key(&self, public_key: &Rsa<Public>) -> Result<String> {
        rsa::encrypt_pkcs1_base64(public_key, self.exchange_payload().as_bytes())
    }

    /// `jdev/sys/keyexchange/<session key>`
    pub fn key_exchange_command(&self, public_key: &Rsa<Public>) -> Result<String> {
        Ok(commands::key_exchange(&self.encrypted_session_key(public_key)?))
    }

    /// Wrap an already salted plaintext in the `jdev/sys/enc/` envelope
    pub fn seal(&self, plaintext: &str) -> Result<String> {
        let ciphertext = aes::encrypt_aes_cbc(&self.key, &self.iv, plaintext.as_bytes())?;
        let encoded = general_purpose::STANDARD.encode(ciphertext);
        Ok(commands::encrypted(&urlencoding::encode(&encoded)))
    }

    /// Reverse [`SessionKeys::seal`] for a server-echoed `jdev/sys/enc/...` control
    pub fn open(&self, envelope: &str) -> Result<String> {
        let payload = envelope
            .trim_start_matches('/')
            .strip_prefix(commands::ENCRYPTED_PREFIX)
            .unwrap_or(envelope);

        // Echoes are usually not percent encoded even if the command was
        let payload = if payload.contains('%') {
            urlencoding::decode(payload)
                .map_err(|e| LoxoneError::protocol(format!("Invalid percent encoding: {e}")))?
                .into_owned()
        } else {
            payload.to_string()
        };

        let ciphertext = general_purpose::STANDARD
            .decode(payload.as_bytes())
            .map_err(|e| LoxoneError::protocol(format!("Invalid base64 envelope: {e}")))?;
        let mut plaintext = aes::decrypt_aes_cbc(&self.key, &self.iv, &ciphertext)?;

        while plaintext.last() == Some(&0) {
            plaintext.pop();
        }

        String::from_utf8(plaintext)
            .map_err(|e| LoxoneError::protocol(format!("Decrypted envelope is not UTF-8: {e}")))
    }
}

impl fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKeys")
            .field("key", &"<redacted>")
            .field("iv", &"<redacted>")
            .finish()
    }
}

/// Envelope builder owned by the drain loop.
///
/// Holding the salt rotation here keeps use-count accounting on a single task.
#[derive(Debug)]
pub struct CommandCipher {
    keys: Arc<SessionKeys>,
    salt: SaltRotation,
}

impl CommandCipher {
    /// Create a cipher with a fresh salt
    pub fn new(keys: Arc<SessionKeys>, config: &ProtocolConfig) -> Self {
        Self {
            keys,
            salt: SaltRotation::new(config),
        }
    }

    /// Salt state, for inspection
    pub fn salt(&self) -> &SaltRotation {
        &self.salt
    }

    /// Encrypt `command`, consuming one salt use
    pub fn encrypt_command(&mut self, command: &str) -> Result<String> {
        let prefix = self.salt.next_prefix();
        self.keys.seal(&format!("{prefix}{command}\0"))
    }
}
