//! Credential and token hashing (SHA-1/SHA-256 and HMAC via OpenSSL)

use crate::error::{LoxoneError, Result};
use openssl::hash::{hash, MessageDigest};
use openssl::pkey::PKey;
use openssl::sign::Signer;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Hash algorithm declared by the Miniserver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum HashAlg {
    /// Firmware before 10.4 only knows SHA-1
    #[default]
    #[serde(rename = "SHA1")]
    Sha1,
    #[serde(rename = "SHA256")]
    Sha256,
}

impl HashAlg {
    fn digest(self) -> MessageDigest {
        match self {
            HashAlg::Sha1 => MessageDigest::sha1(),
            HashAlg::Sha256 => MessageDigest::sha256(),
        }
    }

    /// Parse the optional `hashAlg` field; a missing field means SHA-1
    pub fn from_field(value: Option<&str>) -> Result<Self> {
        value.map_or(Ok(HashAlg::Sha1), str::parse)
    }
}

impl FromStr for HashAlg {
    type Err = LoxoneError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "SHA1" => Ok(HashAlg::Sha1),
            "SHA256" => Ok(HashAlg::Sha256),
            other => Err(LoxoneError::protocol(format!(
                "Unsupported hash algorithm: {other}"
            ))),
        }
    }
}

impl fmt::Display for HashAlg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HashAlg::Sha1 => write!(f, "SHA1"),
            HashAlg::Sha256 => write!(f, "SHA256"),
        }
    }
}

/// `UPPER(hex(SHA(secret:salt)))`
pub fn salted_password_hash(alg: HashAlg, secret: &str, salt: &str) -> Result<String> {
    let digest = hash(alg.digest(), format!("{secret}:{salt}").as_bytes())
        .map_err(|e| LoxoneError::crypto(format!("Failed to hash password: {e}")))?;
    Ok(hex::encode(digest).to_uppercase())
}

/// HMAC `data` with the hex encoded one-time key handed out by the server
pub fn hmac_hex(alg: HashAlg, key_hex: &str, data: &str) -> Result<String> {
    let key_bytes = hex::decode(key_hex)
        .map_err(|e| LoxoneError::protocol(format!("Server key is not hex: {e}")))?;

    let pkey = PKey::hmac(&key_bytes)
        .map_err(|e| LoxoneError::crypto(format!("Failed to create HMAC key: {e}")))?;
    let mut signer = Signer::new(alg.digest(), &pkey)
        .map_err(|e| LoxoneError::crypto(format!("Failed to create signer: {e}")))?;
    signer
        .update(data.as_bytes())
        .map_err(|e| LoxoneError::crypto(format!("Failed to update signer: {e}")))?;
    let mac = signer
        .sign_to_vec()
        .map_err(|e| LoxoneError::crypto(format!("Failed to sign: {e}")))?;

    Ok(hex::encode(mac))
}

/// Hash used to request a token: `HMAC(key, "user:UPPER(SHA(pwd:salt))")`
pub fn credential_hash(
    alg: HashAlg,
    key_hex: &str,
    username: &str,
    password: &str,
    salt: &str,
) -> Result<String> {
    let password_hash = salted_password_hash(alg, password, salt)?;
    hmac_hex(alg, key_hex, &format!("{username}:{password_hash}"))
}

/// Hash proving possession of a token: `HMAC(key, token)`
pub fn token_hash(alg: HashAlg, key_hex: &str, token: &str) -> Result<String> {
    hmac_hex(alg, key_hex, token)
}

/// Hash for secured commands: `HMAC(key, UPPER(SHA(visu_pwd:salt)))`
pub fn visual_hash(alg: HashAlg, key_hex: &str, visual_password: &str, salt: &str) -> Result<String> {
    let password_hash = salted_password_hash(alg, visual_password, salt)?;
    hmac_hex(alg, key_hex, &password_hash)
}
