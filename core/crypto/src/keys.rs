//! Key types with secure memory handling.
//!
//! All key types automatically zeroize their memory on drop to prevent
//! sensitive data from persisting in memory.

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use std::fmt;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of encryption keys in bytes (256-bit).
pub const KEY_LENGTH: usize = 32;

/// Length of the per-container salt in bytes.
pub const SALT_LENGTH: usize = 16;

/// Length of the key-check value in bytes.
pub const CHECK_LENGTH: usize = 8;

/// Master key stretched from the mount passphrase.
///
/// Never used to encrypt data directly; every container gets its own
/// file key derived from this key and the container salt.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    key: [u8; KEY_LENGTH],
}

impl MasterKey {
    /// Create a master key from raw bytes.
    pub fn from_bytes(key: [u8; KEY_LENGTH]) -> Self {
        Self { key }
    }

    /// Get the key bytes.
    ///
    /// # Security
    /// The returned slice should be used immediately and not stored.
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.key
    }

    /// Derive the file key for one container from its salt.
    ///
    /// Uses blake2b for secure key derivation.
    pub fn derive_file_key(&self, salt: &Salt) -> FileKey {
        let mut hasher = Blake2b::<U32>::new();
        hasher.update(self.key);
        hasher.update(salt.as_bytes());
        hasher.update(b"filekey");

        let result = hasher.finalize();
        let mut derived = [0u8; KEY_LENGTH];
        derived.copy_from_slice(&result);
        FileKey::from_bytes(derived)
    }

    /// Short hash identifying this key without revealing it.
    fn check_value(&self) -> [u8; CHECK_LENGTH] {
        let mut hasher = Blake2b::<U32>::new();
        hasher.update(self.key);
        hasher.update(b"keycheck");

        let result = hasher.finalize();
        let mut check = [0u8; CHECK_LENGTH];
        check.copy_from_slice(&result[..CHECK_LENGTH]);
        check
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MasterKey([REDACTED])")
    }
}

/// Key for encrypting the contents of a single container.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct FileKey {
    key: [u8; KEY_LENGTH],
}

impl FileKey {
    /// Create a file key from raw bytes.
    pub fn from_bytes(key: [u8; KEY_LENGTH]) -> Self {
        Self { key }
    }

    /// Get the key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.key
    }
}

impl fmt::Debug for FileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileKey([REDACTED])")
    }
}

/// Per-container salt mixed into file key derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Salt([u8; SALT_LENGTH]);

impl Salt {
    /// Generate a random salt.
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut salt = [0u8; SALT_LENGTH];
        rand::thread_rng().fill_bytes(&mut salt);
        Self(salt)
    }

    /// Create from bytes.
    pub fn from_bytes(bytes: [u8; SALT_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Get the salt bytes.
    pub fn as_bytes(&self) -> &[u8; SALT_LENGTH] {
        &self.0
    }
}

/// Key material held for the lifetime of a mount.
///
/// Created once from the passphrase, immutable afterwards, never persisted.
#[derive(Clone)]
pub struct KeyMaterial {
    master: MasterKey,
    check: [u8; CHECK_LENGTH],
}

impl KeyMaterial {
    /// Wrap a master key, computing its check value.
    pub fn new(master: MasterKey) -> Self {
        let check = master.check_value();
        Self { master, check }
    }

    /// Derive the file key for a container salt.
    pub fn file_key(&self, salt: &Salt) -> FileKey {
        self.master.derive_file_key(salt)
    }

    /// The key-check value.
    pub fn check_value(&self) -> &[u8; CHECK_LENGTH] {
        &self.check
    }

    /// Compare two key materials by check value in constant time.
    pub fn matches(&self, other: &KeyMaterial) -> bool {
        self.check[..].ct_eq(&other.check[..]).into()
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyMaterial([REDACTED])")
    }
}
