//! Authenticated encryption using XChaCha20-Poly1305.
//!
//! XChaCha20-Poly1305 provides both confidentiality and authenticity,
//! with a 24-byte nonce that is safe for random generation.

use chacha20poly1305::{
    aead::{generic_array::GenericArray, Aead, AeadCore, KeyInit, OsRng, Payload},
    XChaCha20Poly1305,
};
use zeroize::Zeroizing;

use crate::keys::FileKey;
use mirrorfs_common::{Error, Result};

/// Nonce size for XChaCha20-Poly1305 (24 bytes).
pub const NONCE_SIZE: usize = 24;

/// Authentication tag size (16 bytes).
pub const TAG_SIZE: usize = 16;

/// Generate a fresh random nonce.
pub fn generate_nonce() -> [u8; NONCE_SIZE] {
    let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
    let mut out = [0u8; NONCE_SIZE];
    out.copy_from_slice(&nonce);
    out
}

/// Encrypt `plaintext`, authenticating `aad` alongside it.
///
/// # Postconditions
/// - Returns ciphertext || tag
/// - The ciphertext length is plaintext length + TAG_SIZE
///
/// # Security
/// - Caller is responsible for nonce uniqueness per key
pub fn seal(
    key: &FileKey,
    nonce: &[u8; NONCE_SIZE],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(GenericArray::from_slice(key.as_bytes()));

    cipher
        .encrypt(
            GenericArray::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| Error::Crypto(format!("Encryption failed: {}", e)))
}

/// Decrypt ciphertext || tag, verifying `aad`.
///
/// The tag is checked in constant time before any plaintext is released.
///
/// # Errors
/// - `Format` if the input is shorter than a tag
/// - `Integrity` if authentication fails (tampered data or wrong key)
pub fn open(
    key: &FileKey,
    nonce: &[u8; NONCE_SIZE],
    aad: &[u8],
    sealed: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    if sealed.len() < TAG_SIZE {
        return Err(Error::Format("Ciphertext too short".to_string()));
    }

    let cipher = XChaCha20Poly1305::new(GenericArray::from_slice(key.as_bytes()));

    cipher
        .decrypt(
            GenericArray::from_slice(nonce),
            Payload { msg: sealed, aad },
        )
        .map(Zeroizing::new)
        .map_err(|_| Error::Integrity("authentication tag mismatch".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KEY_LENGTH;

    #[test]
    fn test_seal_open_roundtrip() {
        let key = FileKey::from_bytes([42u8; KEY_LENGTH]);
        let nonce = generate_nonce();

        let sealed = seal(&key, &nonce, b"header", b"Hello, World!").unwrap();
        let opened = open(&key, &nonce, b"header", &sealed).unwrap();

        assert_eq!(opened.as_slice(), b"Hello, World!");
        assert_eq!(sealed.len(), 13 + TAG_SIZE);
    }

    #[test]
    fn test_different_nonce_each_time() {
        assert_ne!(generate_nonce(), generate_nonce());
    }

    #[test]
    fn test_wrong_aad_fails() {
        let key = FileKey::from_bytes([42u8; KEY_LENGTH]);
        let nonce = generate_nonce();

        let sealed = seal(&key, &nonce, b"header-a", b"data").unwrap();
        assert!(matches!(
            open(&key, &nonce, b"header-b", &sealed),
            Err(Error::Integrity(_))
        ));
    }

    #[test]
    fn test_wrong_key_fails() {
        let nonce = generate_nonce();
        let sealed = seal(&FileKey::from_bytes([1u8; KEY_LENGTH]), &nonce, b"", b"x").unwrap();

        assert!(matches!(
            open(&FileKey::from_bytes([2u8; KEY_LENGTH]), &nonce, b"", &sealed),
            Err(Error::Integrity(_))
        ));
    }

    #[test]
    fn test_short_input_is_format_error() {
        let key = FileKey::from_bytes([42u8; KEY_LENGTH]);
        assert!(matches!(
            open(&key, &[0u8; NONCE_SIZE], b"", &[0u8; 4]),
            Err(Error::Format(_))
        ));
    }
}
