//! Two-tier content-addressable cache.
//!
//! Both tiers key entries by the same [`Fingerprint`](crate::domain::fingerprint::Fingerprint)
//! and shard them the same way (`<shard>/<fingerprint>.<ext>`), so a hit in
//! either tier always refers to identical bytes.
//!
//! - **Local**: filesystem directory with mtime-based expiry.
//! - **Remote**: durable object store reached through [`RemoteStoreGateway`].

pub mod local;
pub mod remote;

pub use local::{CacheEntry, LocalCacheStore, SweepReport};
pub use remote::{
    ObjectStore, ObjectStoreError, RemoteConfig, RemoteLookup, RemoteStoreGateway, ResolvedUrl,
    UploadError, UploadReceipt, UrlOptions, Visibility,
};
