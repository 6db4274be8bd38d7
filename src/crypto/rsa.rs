//! RSA public key handling for the key exchange
//!
//! `jdev/sys/getPublicKey` returns the key wrapped in
//! `-----BEGIN CERTIFICATE-----` markers although the body is a plain
//! SubjectPublicKeyInfo, on a single line. It has to be re-wrapped as a PEM
//! public key before OpenSSL accepts it.

use crate::error::{LoxoneError, Result};
use base64::{engine::general_purpose, Engine as _};
use openssl::pkey::Public;
use openssl::rsa::{Padding, Rsa};
use tracing::debug;
use x509_parser::parse_x509_certificate;

const PEM_MARKERS: [&str; 6] = [
    "-----BEGIN CERTIFICATE-----",
    "-----END CERTIFICATE-----",
    "-----BEGIN PUBLIC KEY-----",
    "-----END PUBLIC KEY-----",
    "-----BEGIN RSA PUBLIC KEY-----",
    "-----END RSA PUBLIC KEY-----",
];

/// Extract the base64 body of a PEM-ish key, dropping markers and whitespace
fn pem_body(raw: &str) -> String {
    let mut body = raw.to_string();
    for marker in PEM_MARKERS {
        body = body.replace(marker, "");
    }
    body.chars().filter(|c| !c.is_whitespace()).collect()
}

/// Re-wrap the server's "certificate" as a `PUBLIC KEY` PEM block
pub fn certificate_to_public_key_pem(raw: &str) -> Result<String> {
    let body = pem_body(raw);
    if body.is_empty() {
        return Err(LoxoneError::crypto("Public key is empty"));
    }

    let mut pem = String::from("-----BEGIN PUBLIC KEY-----\n");
    for line in body.as_bytes().chunks(64) {
        // body is ASCII after whitespace removal, chunking cannot split a char
        pem.push_str(&String::from_utf8_lossy(line));
        pem.push('\n');
    }
    pem.push_str("-----END PUBLIC KEY-----\n");
    Ok(pem)
}

/// Import the Miniserver's RSA public key
pub fn parse_public_key(raw: &str) -> Result<Rsa<Public>> {
    let pem = certificate_to_public_key_pem(raw)?;
    if let Ok(key) = Rsa::public_key_from_pem(pem.as_bytes()) {
        return Ok(key);
    }

    debug!("Public key is not a SubjectPublicKeyInfo, trying other encodings");

    let der = general_purpose::STANDARD
        .decode(pem_body(raw))
        .map_err(|e| LoxoneError::crypto(format!("Failed to decode base64 key: {e}")))?;

    // A real X.509 certificate
    if let Ok((_, cert)) = parse_x509_certificate(&der) {
        let spki = cert.public_key();
        return Rsa::public_key_from_der_pkcs1(&spki.subject_public_key.data).map_err(|e| {
            LoxoneError::crypto(format!("Failed to parse RSA key from certificate: {e}"))
        });
    }

    // Last resort: raw RSA public key in PKCS#1 format
    Rsa::public_key_from_der_pkcs1(&der)
        .map_err(|e| LoxoneError::crypto(format!("Failed to parse RSA public key: {e}")))
}

/// RSA/PKCS#1 v1.5-encrypt `payload` and return it base64 encoded
pub fn encrypt_pkcs1_base64(key: &Rsa<Public>, payload: &[u8]) -> Result<String> {
    let mut encrypted = vec![0u8; key.size() as usize];
    let encrypted_len = key
        .public_encrypt(payload, &mut encrypted, Padding::PKCS1)
        .map_err(|e| LoxoneError::crypto(format!("RSA encryption failed: {e}")))?;

    encrypted.truncate(encrypted_len);
    Ok(general_purpose::STANDARD.encode(&encrypted))
}
