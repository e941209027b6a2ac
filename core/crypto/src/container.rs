//! On-disk container format.
//!
//! Every regular file in the mirror is either empty or a container:
//!
//! ```text
//! [magic 4][version 1][salt 16][nonce 24][ciphertext n][tag 16]
//! ```
//!
//! The header (magic through nonce) is authenticated as associated data, so
//! flipping any byte of the container makes decoding fail.

use zeroize::Zeroizing;

use crate::aead::{self, NONCE_SIZE, TAG_SIZE};
use crate::keys::{KeyMaterial, Salt, SALT_LENGTH};
use mirrorfs_common::{Error, Result};

/// Container magic bytes.
pub const MAGIC: [u8; 4] = *b"MRFS";

/// Current container format version.
pub const FORMAT_VERSION: u8 = 1;

const MAGIC_END: usize = MAGIC.len();
const VERSION_END: usize = MAGIC_END + 1;
const SALT_END: usize = VERSION_END + SALT_LENGTH;

/// Header size: magic + version + salt + nonce.
pub const HEADER_SIZE: usize = SALT_END + NONCE_SIZE;

/// Bytes a container adds on top of its plaintext.
pub const CONTAINER_OVERHEAD: usize = HEADER_SIZE + TAG_SIZE;

/// Parsed container header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub salt: Salt,
    pub nonce: [u8; NONCE_SIZE],
}

impl Header {
    fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[..MAGIC_END].copy_from_slice(&MAGIC);
        out[MAGIC_END] = self.version;
        out[VERSION_END..SALT_END].copy_from_slice(self.salt.as_bytes());
        out[SALT_END..].copy_from_slice(&self.nonce);
        out
    }

    /// Parse the header at the start of a container.
    ///
    /// # Errors
    /// - `Format` on truncation, bad magic or unsupported version
    pub fn parse(container: &[u8]) -> Result<Self> {
        if container.len() < HEADER_SIZE {
            return Err(Error::Format(format!(
                "truncated header: {} bytes, need {}",
                container.len(),
                HEADER_SIZE
            )));
        }
        if container[..MAGIC_END] != MAGIC {
            return Err(Error::Format("bad magic".to_string()));
        }
        let version = container[MAGIC_END];
        if version != FORMAT_VERSION {
            return Err(Error::Format(format!(
                "unsupported container version: {}",
                version
            )));
        }

        let mut salt = [0u8; SALT_LENGTH];
        salt.copy_from_slice(&container[VERSION_END..SALT_END]);
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&container[SALT_END..HEADER_SIZE]);

        Ok(Self {
            version,
            salt: Salt::from_bytes(salt),
            nonce,
        })
    }
}

/// Encrypt `plaintext` into a fresh container.
///
/// A new salt and nonce are drawn for every call, so encoding the same
/// plaintext twice yields unrelated containers.
pub fn encode(plaintext: &[u8], keys: &KeyMaterial) -> Result<Vec<u8>> {
    let header = Header {
        version: FORMAT_VERSION,
        salt: Salt::generate(),
        nonce: aead::generate_nonce(),
    };
    let header_bytes = header.to_bytes();
    let file_key = keys.file_key(&header.salt);

    let sealed = aead::seal(&file_key, &header.nonce, &header_bytes, plaintext)?;

    let mut out = Vec::with_capacity(HEADER_SIZE + sealed.len());
    out.extend_from_slice(&header_bytes);
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Decrypt a container.
///
/// A zero-length container is a freshly created file and decodes to empty
/// plaintext without touching the cipher.
///
/// # Errors
/// - `Format` if the header is malformed or the body is shorter than a tag
/// - `Integrity` if the tag does not verify (tampering or wrong key)
pub fn decode(container: &[u8], keys: &KeyMaterial) -> Result<Zeroizing<Vec<u8>>> {
    if container.is_empty() {
        return Ok(Zeroizing::new(Vec::new()));
    }

    let header = Header::parse(container)?;
    let body = &container[HEADER_SIZE..];
    if body.len() < TAG_SIZE {
        return Err(Error::Format(format!(
            "truncated body: {} bytes, need at least {}",
            body.len(),
            TAG_SIZE
        )));
    }

    let file_key = keys.file_key(&header.salt);
    aead::open(&file_key, &header.nonce, &container[..HEADER_SIZE], body)
}

/// Plaintext length of a container of `container_len` bytes.
///
/// Returns `None` for lengths no well-formed container can have.
pub fn plaintext_len(container_len: u64) -> Option<u64> {
    if container_len == 0 {
        Some(0)
    } else {
        container_len.checked_sub(CONTAINER_OVERHEAD as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{MasterKey, KEY_LENGTH};
    use proptest::prelude::*;

    fn keys(seed: u8) -> KeyMaterial {
        KeyMaterial::new(MasterKey::from_bytes([seed; KEY_LENGTH]))
    }

    #[test]
    fn test_container_layout() {
        let container = encode(b"hello", &keys(1)).unwrap();

        assert_eq!(&container[..4], b"MRFS");
        assert_eq!(container[4], FORMAT_VERSION);
        assert_eq!(container.len(), 5 + CONTAINER_OVERHEAD);
        assert_eq!(plaintext_len(container.len() as u64), Some(5));
    }

    #[test]
    fn test_empty_container_decodes_to_empty() {
        let plaintext = decode(&[], &keys(1)).unwrap();
        assert!(plaintext.is_empty());
        assert_eq!(plaintext_len(0), Some(0));
    }

    #[test]
    fn test_encoded_empty_plaintext_roundtrips() {
        let container = encode(b"", &keys(1)).unwrap();
        assert_eq!(container.len(), CONTAINER_OVERHEAD);
        assert!(decode(&container, &keys(1)).unwrap().is_empty());
    }

    #[test]
    fn test_same_plaintext_different_containers() {
        let a = encode(b"same", &keys(1)).unwrap();
        let b = encode(b"same", &keys(1)).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_truncated_header_is_format_error() {
        let container = encode(b"hello", &keys(1)).unwrap();
        assert!(matches!(
            decode(&container[..HEADER_SIZE - 1], &keys(1)),
            Err(Error::Format(_))
        ));
        assert!(matches!(
            decode(&container[..HEADER_SIZE + 3], &keys(1)),
            Err(Error::Format(_))
        ));
    }

    #[test]
    fn test_bad_magic_and_version() {
        let mut container = encode(b"hello", &keys(1)).unwrap();
        container[0] = b'X';
        assert!(matches!(decode(&container, &keys(1)), Err(Error::Format(_))));

        let mut container = encode(b"hello", &keys(1)).unwrap();
        container[4] = FORMAT_VERSION + 1;
        assert!(matches!(decode(&container, &keys(1)), Err(Error::Format(_))));
    }

    #[test]
    fn test_plaintext_len_rejects_short_lengths() {
        assert_eq!(plaintext_len(10), None);
        assert_eq!(plaintext_len(CONTAINER_OVERHEAD as u64), Some(0));
    }

    proptest! {
        #[test]
        fn prop_roundtrip(plaintext in proptest::collection::vec(any::<u8>(), 0..2048), seed in any::<u8>()) {
            let container = encode(&plaintext, &keys(seed)).unwrap();
            let decoded = decode(&container, &keys(seed)).unwrap();
            prop_assert_eq!(decoded.as_slice(), plaintext.as_slice());
        }

        #[test]
        fn prop_wrong_key_rejected(plaintext in proptest::collection::vec(any::<u8>(), 0..512), a in any::<u8>(), b in any::<u8>()) {
            prop_assume!(a != b);
            let container = encode(&plaintext, &keys(a)).unwrap();
            prop_assert!(matches!(decode(&container, &keys(b)), Err(Error::Integrity(_))));
        }

        #[test]
        fn prop_single_byte_flip_detected(
            plaintext in proptest::collection::vec(any::<u8>(), 1..256),
            index in any::<proptest::sample::Index>(),
            flip in 1u8..=255,
        ) {
            let mut container = encode(&plaintext, &keys(3)).unwrap();
            let i = index.index(container.len());
            container[i] ^= flip;
            prop_assert!(matches!(
                decode(&container, &keys(3)),
                Err(Error::Integrity(_)) | Err(Error::Format(_))
            ));
        }
    }
}
