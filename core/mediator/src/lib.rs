//! Transparent encryption mediation layer.
//!
//! Sits between a filesystem-operation shim and the mirror directory:
//! callers see plaintext, the mirror only ever holds containers.
//!
//! # Architecture
//! - [`PathResolver`] maps virtual paths onto the mirror
//! - [`ContainerCodec`] turns plaintext into containers and back
//! - [`StagingManager`] owns open-file handles, their staging areas and
//!   reference counts
//! - [`Dispatcher`] is the surface the shim calls for content operations
//!
//! All crypto work runs synchronously inside open, fsync, the last release
//! and truncate. There are no background threads.

pub mod buffer;
pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod handle;
pub mod replace;
pub mod resolver;
pub mod staging;

#[cfg(test)]
pub(crate) mod testing;

pub use buffer::{StagingBuffer, StagingStore};
pub use codec::{ContainerCodec, KeyedCodec};
pub use config::{MirrorConfig, StagingMode};
pub use dispatcher::Dispatcher;
pub use handle::{HandleId, HandleInfo, HandleState};
pub use resolver::PathResolver;
pub use staging::StagingManager;
