//! Container codec seam used by the staging manager.

use zeroize::Zeroizing;

use mirrorfs_common::Result;
use mirrorfs_crypto::{KdfParams, KeyMaterial};

/// Turns plaintext into an on-disk container and back.
///
/// Implementations are pure transforms with no filesystem knowledge.
pub trait ContainerCodec: Send + Sync {
    /// Encrypt plaintext into a complete container.
    fn encode(&self, plaintext: &[u8]) -> Result<Vec<u8>>;

    /// Decrypt a complete container.
    ///
    /// # Errors
    /// - `Format` for a malformed header
    /// - `Integrity` for a tag mismatch
    fn decode(&self, container: &[u8]) -> Result<Zeroizing<Vec<u8>>>;
}

/// Codec bound to the mount's key material.
pub struct KeyedCodec {
    keys: KeyMaterial,
}

impl KeyedCodec {
    /// Create a codec from already derived key material.
    pub fn new(keys: KeyMaterial) -> Self {
        Self { keys }
    }

    /// Derive key material from a passphrase and wrap it.
    pub fn from_passphrase(passphrase: &[u8], params: &KdfParams) -> Result<Self> {
        Ok(Self::new(mirrorfs_crypto::derive(passphrase, params)?))
    }

    /// The key material this codec encrypts with.
    pub fn keys(&self) -> &KeyMaterial {
        &self.keys
    }
}

impl ContainerCodec for KeyedCodec {
    fn encode(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        mirrorfs_crypto::encode(plaintext, &self.keys)
    }

    fn decode(&self, container: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        mirrorfs_crypto::decode(container, &self.keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirrorfs_common::Error;

    #[test]
    fn test_keyed_codec_roundtrip() {
        let codec = KeyedCodec::from_passphrase(b"pw", &KdfParams::insecure_fast()).unwrap();

        let container = codec.encode(b"hello").unwrap();
        assert_ne!(container.as_slice(), b"hello");
        assert_eq!(codec.decode(&container).unwrap().as_slice(), b"hello");
    }

    #[test]
    fn test_other_passphrase_cannot_decode() {
        let params = KdfParams::insecure_fast();
        let a = KeyedCodec::from_passphrase(b"first", &params).unwrap();
        let b = KeyedCodec::from_passphrase(b"second", &params).unwrap();

        let container = a.encode(b"secret").unwrap();
        assert!(matches!(b.decode(&container), Err(Error::Integrity(_))));
        assert!(!a.keys().matches(b.keys()));
    }
}
