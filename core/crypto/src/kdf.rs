//! Key derivation using Argon2id.
//!
//! Argon2id is a memory-hard password hashing function that provides
//! resistance to both GPU and time-memory trade-off attacks. The passphrase
//! is stretched once per mount; per-file keys come from
//! [`MasterKey::derive_file_key`].

use argon2::{Algorithm, Argon2, Params, Version};
use serde::{Deserialize, Serialize};

use crate::keys::{KeyMaterial, MasterKey, KEY_LENGTH};
use mirrorfs_common::{Error, Result};

/// Argon2id salt for the mount-level stretch.
///
/// The mirror carries no metadata file, so the stretch salt is a fixed
/// domain separator. Per-file uniqueness comes from the container salt.
const MOUNT_SALT: &[u8] = b"mirrorfs/argon2id/mount/v1";

/// Parameters for Argon2id key derivation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Memory cost in KiB (e.g., 65536 = 64 MiB).
    pub memory_cost: u32,
    /// Number of iterations.
    pub time_cost: u32,
    /// Degree of parallelism.
    pub parallelism: u32,
}

impl KdfParams {
    /// Create parameters suitable for interactive use.
    pub fn interactive() -> Self {
        Self {
            memory_cost: 65536, // 64 MiB
            time_cost: 3,
            parallelism: 4,
        }
    }

    /// Create parameters suitable for sensitive data.
    ///
    /// Higher security parameters that may take several seconds.
    pub fn sensitive() -> Self {
        Self {
            memory_cost: 262144, // 256 MiB
            time_cost: 4,
            parallelism: 4,
        }
    }

    /// Create moderate parameters for constrained machines.
    pub fn moderate() -> Self {
        Self {
            memory_cost: 32768, // 32 MiB
            time_cost: 3,
            parallelism: 2,
        }
    }

    /// Parameters every mirror is encrypted under.
    ///
    /// Changing these changes the derived key, so existing containers would
    /// fail their integrity check.
    pub fn mirror_default() -> Self {
        Self::interactive()
    }

    /// Cheap parameters for tests. Never use for real data.
    pub fn insecure_fast() -> Self {
        Self {
            memory_cost: 256,
            time_cost: 1,
            parallelism: 1,
        }
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        Self::mirror_default()
    }
}

/// Derive a master key from a password and salt using Argon2id.
///
/// # Preconditions
/// - `password` must not be empty
/// - `params` must have valid Argon2id parameters
///
/// # Postconditions
/// - The derived key is deterministic given the same inputs
///
/// # Errors
/// - `InvalidInput` if password is empty
/// - `Crypto` if Argon2id parameters are invalid
pub fn derive_key(password: &[u8], salt: &[u8], params: &KdfParams) -> Result<MasterKey> {
    if password.is_empty() {
        return Err(Error::InvalidInput("Passphrase cannot be empty".to_string()));
    }

    let argon2_params = Params::new(
        params.memory_cost,
        params.time_cost,
        params.parallelism,
        Some(KEY_LENGTH),
    )
    .map_err(|e| Error::Crypto(format!("Invalid KDF parameters: {}", e)))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params);

    let mut key_bytes = [0u8; KEY_LENGTH];
    argon2
        .hash_password_into(password, salt, &mut key_bytes)
        .map_err(|e| Error::Crypto(format!("Key derivation failed: {}", e)))?;

    Ok(MasterKey::from_bytes(key_bytes))
}

/// Derive the mount's key material from a passphrase.
///
/// A wrong passphrase is not detected here; it surfaces as an integrity
/// failure the first time a container is decoded.
pub fn derive(passphrase: &[u8], params: &KdfParams) -> Result<KeyMaterial> {
    let master = derive_key(passphrase, MOUNT_SALT, params)?;
    Ok(KeyMaterial::new(master))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_deterministic() {
        let params = KdfParams::insecure_fast();

        let keys1 = derive(b"test-passphrase", &params).unwrap();
        let keys2 = derive(b"test-passphrase", &params).unwrap();

        assert!(keys1.matches(&keys2));
    }

    #[test]
    fn test_derive_different_passphrase() {
        let params = KdfParams::insecure_fast();

        let keys1 = derive(b"passphrase1", &params).unwrap();
        let keys2 = derive(b"passphrase2", &params).unwrap();

        assert!(!keys1.matches(&keys2));
    }

    #[test]
    fn test_derive_key_different_salt() {
        let params = KdfParams::insecure_fast();

        let key1 = derive_key(b"password", &[1u8; 16], &params).unwrap();
        let key2 = derive_key(b"password", &[2u8; 16], &params).unwrap();

        assert_ne!(key1.as_bytes(), key2.as_bytes());
    }

    #[test]
    fn test_derive_empty_passphrase_fails() {
        let params = KdfParams::insecure_fast();

        assert!(matches!(
            derive(b"", &params),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_invalid_params_fail() {
        let params = KdfParams {
            memory_cost: 1,
            time_cost: 0,
            parallelism: 0,
        };

        assert!(matches!(derive(b"pw", &params), Err(Error::Crypto(_))));
    }
}
