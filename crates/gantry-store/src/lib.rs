//! Storage backends for Gantry.
//!
//! Implements the `ArtifactCache` and `SecretResolver` traits from
//! `gantry-core` with in-memory and filesystem backends.

pub mod cache;
pub mod secret;

pub use cache::{FsCache, MemoryCache};
pub use secret::MemorySecretStore;
