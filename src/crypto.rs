//! Cryptographic building blocks of the Miniserver session
//!
//! - [`rsa`]: public key import and PKCS#1 v1.5 encryption (OpenSSL)
//! - [`aes`]: AES-256-CBC with PKCS#7 padding
//! - [`hash`]: SHA/HMAC helpers for credential and token hashes
//! - [`salt`]: rotating salt bookkeeping
//! - [`session`]: per-session key material and the encrypted command envelope

pub mod aes;
pub mod hash;
pub mod rsa;
pub mod salt;
pub mod session;

pub use hash::HashAlg;
pub use salt::{Salt, SaltPrefix, SaltRotation};
pub use session::{CommandCipher, SessionKeys};
