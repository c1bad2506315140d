//! Hybrid transport encryption for metric payloads.
//!
//! Payloads that fit inside one RSA-OAEP block are encrypted directly.
//! Larger payloads are sealed with a fresh AES-256-GCM key, and that key is
//! RSA-OAEP-wrapped and prepended with a 4-byte big-endian length so the
//! receiver can split the frame:
//!
//! `[4-byte key length][wrapped AES key][12-byte nonce ++ GCM ciphertext]`

use std::fs;
use std::path::Path;

use aes_gcm::aead::{Aead, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, KeyInit, Nonce};
use anyhow::Context;
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;
use thiserror::Error;

/// Upper bound on an encrypted request body.
pub const MAX_ENCRYPTED_BODY: usize = 10 * 1024 * 1024;

/// OAEP padding overhead for the chosen digest; a payload of at most
/// `keySize - OAEP_OVERHEAD` bytes takes the direct RSA path.
const OAEP_OVERHEAD: usize = 42;
const KEY_LEN_PREFIX: usize = 4;
const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("rsa operation failed")]
    Rsa(#[from] rsa::Error),
    #[error("aead operation failed")]
    Aead,
    #[error("ciphertext too short")]
    Truncated,
}

pub fn load_public_key(path: impl AsRef<Path>) -> anyhow::Result<RsaPublicKey> {
    use rsa::pkcs8::DecodePublicKey;

    let path = path.as_ref();
    let pem = fs::read_to_string(path)
        .with_context(|| format!("failed to read public key file {}", path.display()))?;
    RsaPublicKey::from_public_key_pem(&pem)
        .with_context(|| format!("failed to parse public key {}", path.display()))
}

/// Loads a PKCS#8 PEM private key, falling back to the legacy PKCS#1 form.
pub fn load_private_key(path: impl AsRef<Path>) -> anyhow::Result<RsaPrivateKey> {
    use rsa::pkcs1::DecodeRsaPrivateKey;
    use rsa::pkcs8::DecodePrivateKey;

    let path = path.as_ref();
    let pem = fs::read_to_string(path)
        .with_context(|| format!("failed to read private key file {}", path.display()))?;
    if let Ok(key) = RsaPrivateKey::from_pkcs8_pem(&pem) {
        return Ok(key);
    }
    RsaPrivateKey::from_pkcs1_pem(&pem)
        .with_context(|| format!("failed to parse private key {}", path.display()))
}

pub fn encrypt(data: &[u8], public_key: &RsaPublicKey) -> Result<Vec<u8>, CryptoError> {
    let key_size = public_key.size();
    if data.len() + OAEP_OVERHEAD <= key_size {
        return Ok(public_key.encrypt(&mut rand::thread_rng(), Oaep::new::<Sha1>(), data)?);
    }

    let aes_key = Aes256Gcm::generate_key(&mut OsRng);
    let cipher = Aes256Gcm::new(&aes_key);
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let mut sealed = nonce.to_vec();
    sealed.extend(cipher.encrypt(&nonce, data).map_err(|_| CryptoError::Aead)?);

    let wrapped =
        public_key.encrypt(&mut rand::thread_rng(), Oaep::new::<Sha1>(), aes_key.as_slice())?;

    let mut out = Vec::with_capacity(KEY_LEN_PREFIX + wrapped.len() + sealed.len());
    out.extend_from_slice(&(wrapped.len() as u32).to_be_bytes());
    out.extend_from_slice(&wrapped);
    out.extend_from_slice(&sealed);
    Ok(out)
}

pub fn decrypt(data: &[u8], private_key: &RsaPrivateKey) -> Result<Vec<u8>, CryptoError> {
    let key_size = private_key.size();

    // A plausible length prefix marks the hybrid frame; anything else is a
    // direct RSA block.  The wrapped key is a full RSA block, so its
    // length equals the key size exactly.
    if data.len() > KEY_LEN_PREFIX {
        let key_len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if key_len > 0 && key_len <= key_size && data.len() > KEY_LEN_PREFIX + key_len {
            let wrapped = &data[KEY_LEN_PREFIX..KEY_LEN_PREFIX + key_len];
            let payload = &data[KEY_LEN_PREFIX + key_len..];

            let aes_key = private_key.decrypt(Oaep::new::<Sha1>(), wrapped)?;
            if payload.len() < NONCE_LEN {
                return Err(CryptoError::Truncated);
            }
            let (nonce, ciphertext) = payload.split_at(NONCE_LEN);
            let cipher = Aes256Gcm::new_from_slice(&aes_key).map_err(|_| CryptoError::Aead)?;
            return cipher
                .decrypt(Nonce::from_slice(nonce), ciphertext)
                .map_err(|_| CryptoError::Aead);
        }
    }

    Ok(private_key.decrypt(Oaep::new::<Sha1>(), data)?)
}
