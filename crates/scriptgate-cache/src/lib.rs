//! scriptgate Result Cache
//!
//! Fingerprint-keyed store of generated-and-scanned scripts, with the
//! guarantee that concurrent requests for one fingerprint run the
//! generation pipeline at most once.
//!
//! # Architecture
//!
//! ```text
//! get_or_create(fp, factory)
//!     │ hit ─────────────────────────────► moka (LRU + per-entry TTL)
//!     │ miss
//!     ▼
//! DashMap<fp, Shared<flight>> ── first caller spawns, others await ──► factory()
//!                                                                        │ PASSED only
//!                                                          moka.insert + CacheStore::put
//! ```

#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod cache;
pub mod entry;
pub mod error;
pub mod store;

pub use cache::{CacheConfig, CacheStats, Lookup, ResultCache};
pub use entry::{CacheDraft, CacheEntry, CacheSummary, Origin};
pub use error::{CacheError, StoreError};
pub use store::{CacheStore, FileCacheStore, MemoryCacheStore};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
