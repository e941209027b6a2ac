//! Common utilities and types shared across mirrorfs crates.
//!
//! This crate provides the error taxonomy used at every layer and the
//! virtual path type the mediation layer resolves against the mirror.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{SensitiveBytes, VirtualPath, DEFAULT_MAX_PATH_LEN, MAX_NAME_LEN, RESERVED_PREFIX};
