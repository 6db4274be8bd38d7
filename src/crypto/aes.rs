//! AES-256-CBC used for the encrypted command envelope

use crate::error::{LoxoneError, Result};
use openssl::symm::{Cipher, Crypter, Mode};

const BLOCK_SIZE: usize = 16;

/// Strip PKCS#7 padding.
///
/// Server payloads are sometimes zero padded instead, so a buffer without a
/// valid PKCS#7 trailer is returned unchanged.
pub fn pkcs7_unpad(mut data: Vec<u8>) -> Vec<u8> {
    if let Some(&last) = data.last() {
        let padding_len = last as usize;
        if (1..=BLOCK_SIZE).contains(&padding_len)
            && padding_len <= data.len()
            && data[data.len() - padding_len..].iter().all(|&b| b == last)
        {
            data.truncate(data.len() - padding_len);
        }
    }
    data
}

/// PKCS#7-pad and encrypt `plaintext`
pub fn encrypt_aes_cbc(key: &[u8; 32], iv: &[u8; 16], plaintext: &[u8]) -> Result<Vec<u8>> {
    openssl::symm::encrypt(Cipher::aes_256_cbc(), key, Some(iv), plaintext)
        .map_err(|e| LoxoneError::crypto(format!("AES encryption failed: {e}")))
}

/// Decrypt `ciphertext` and strip its padding
pub fn decrypt_aes_cbc(key: &[u8; 32], iv: &[u8; 16], ciphertext: &[u8]) -> Result<Vec<u8>> {
    if ciphertext.is_empty() || ciphertext.len() % BLOCK_SIZE != 0 {
        return Err(LoxoneError::crypto(format!(
            "Ciphertext length {} is not a positive multiple of {BLOCK_SIZE}",
            ciphertext.len()
        )));
    }

    let cipher = Cipher::aes_256_cbc();
    let mut crypter = Crypter::new(cipher, Mode::Decrypt, key, Some(iv))?;
    // padding is checked leniently by pkcs7_unpad
    crypter.pad(false);

    let mut plaintext = vec![0u8; ciphertext.len() + cipher.block_size()];
    let mut written = crypter.update(ciphertext, &mut plaintext)?;
    written += crypter.finalize(&mut plaintext[written..])?;
    plaintext.truncate(written);

    Ok(pkcs7_unpad(plaintext))
}
