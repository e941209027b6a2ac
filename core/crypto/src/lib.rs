//! Cryptographic primitives for mirrorfs.
//!
//! This module provides:
//! - Passphrase stretching using Argon2id
//! - Per-file key derivation from a per-container salt
//! - Authenticated encryption using XChaCha20-Poly1305
//! - The on-disk container format wrapping every mirrored file
//!
//! # Security Guarantees
//! - All key material is automatically zeroized on drop
//! - No plaintext or key material is ever logged
//! - Integrity tags and key-check values are compared in constant time

pub mod aead;
pub mod container;
pub mod kdf;
pub mod keys;

pub use container::{decode, encode, plaintext_len, CONTAINER_OVERHEAD, HEADER_SIZE};
pub use kdf::{derive, derive_key, KdfParams};
pub use keys::{FileKey, KeyMaterial, MasterKey, Salt};
