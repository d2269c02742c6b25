//! Symmetric inventory encryption
//!
//! Argon2id derives a 32-byte key from the master password; the payload is
//! sealed with XChaCha20-Poly1305.
//!
//! Ciphertext layout (before base64): `salt (16) || nonce (24) || ct + tag`.

use argon2::{Argon2, Params, Version};
use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    XChaCha20Poly1305, XNonce,
};
use thiserror::Error;
use zeroize::Zeroizing;

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 24;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("ciphertext is too short to contain salt and nonce")]
    Truncated,

    #[error("decryption failed, the password is wrong or the data is corrupted")]
    Decrypt,

    #[error("encryption failed")]
    Encrypt,
}

/// Argon2id parameters tuned for interactive use.
fn argon2_params() -> Result<Params, CryptoError> {
    Params::new(
        64 * 1024, // m_cost: 64 MiB
        3,         // t_cost
        1,         // p_cost
        Some(32),
    )
    .map_err(|e| CryptoError::KeyDerivation(e.to_string()))
}

fn derive_key(password: &[u8], salt: &[u8]) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    let argon2 = Argon2::new(argon2::Algorithm::Argon2id, Version::V0x13, argon2_params()?);
    let mut key = Zeroizing::new([0u8; 32]);
    argon2
        .hash_password_into(password, salt, key.as_mut())
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(key)
}

/// Encrypt `plaintext` under `password`, prepending a fresh salt and nonce.
pub fn seal(password: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let salt: [u8; SALT_LEN] = {
        use rand::RngCore;
        let mut salt = [0u8; SALT_LEN];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        salt
    };
    let key = derive_key(password, &salt)?;

    let cipher =
        XChaCha20Poly1305::new_from_slice(key.as_ref()).map_err(|_| CryptoError::Encrypt)?;
    let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| CryptoError::Encrypt)?;

    let mut out = Vec::with_capacity(SALT_LEN + NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&salt);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt wire-format bytes. Authentication failure is not distinguishable
/// from a wrong password; both report [`CryptoError::Decrypt`].
pub fn open(password: &[u8], data: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if data.len() < SALT_LEN + NONCE_LEN {
        return Err(CryptoError::Truncated);
    }
    let (salt, rest) = data.split_at(SALT_LEN);
    let (nonce_bytes, ciphertext) = rest.split_at(NONCE_LEN);

    let key = derive_key(password, salt)?;
    let cipher =
        XChaCha20Poly1305::new_from_slice(key.as_ref()).map_err(|_| CryptoError::Decrypt)?;
    let nonce = XNonce::from_slice(nonce_bytes);

    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CryptoError::Decrypt)?;
    Ok(Zeroizing::new(plaintext))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let sealed = seal(b"secret", b"hello inventory").unwrap();
        let opened = open(b"secret", &sealed).unwrap();
        assert_eq!(opened.as_slice(), b"hello inventory");
    }

    #[test]
    fn wrong_password_fails() {
        let sealed = seal(b"secret", b"hello").unwrap();
        assert!(matches!(open(b"wrong", &sealed), Err(CryptoError::Decrypt)));
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let mut sealed = seal(b"secret", b"hello").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(matches!(open(b"secret", &sealed), Err(CryptoError::Decrypt)));
    }

    #[test]
    fn truncated_input_fails() {
        assert!(matches!(
            open(b"secret", &[0u8; 10]),
            Err(CryptoError::Truncated)
        ));
    }

    #[test]
    fn fresh_salt_and_nonce_each_time() {
        let a = seal(b"secret", b"hello").unwrap();
        let b = seal(b"secret", b"hello").unwrap();
        assert_ne!(a, b);
    }
}
