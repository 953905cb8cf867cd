//! Image cache.
//!
//! - [`ImageCache`]: byte-budgeted store of retrieved payloads, evicting the
//!   least recently accessed entry first
//! - [`CacheStats`]: occupancy snapshot returned by `stats()`

mod image_cache;

pub use image_cache::{CacheEntry, CacheStats, ImageCache, DEFAULT_CACHE_CAPACITY};
