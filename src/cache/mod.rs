//! # Cache Module
//!
//! Bounded, TTL-aware cache for resolver results.
//!
//! Resolving a query through `yt-dlp` costs a process spawn and one or more
//! network round-trips, so repeated requests for the same query (a popular
//! song, a playlist queued twice) are answered from memory. Only metadata and
//! the lazy stream handles are cached; no network handle is ever opened or
//! kept alive by the cache, so stream URLs can never go stale in here.
//!
//! ## Configuration
//!
//! ```env
//! CACHE_SIZE=100    # Maximum number of cached queries
//! CACHE_TTL=1h      # Time-to-live of each entry
//! ```

pub mod lru_cache;

use lru_cache::LRUCache;
use std::time::Duration;
use tracing::info;

use crate::sources::TrackDescriptor;

/// Caché de resoluciones: consulta -> tracks resueltos.
///
/// Cached descriptors must be rebound with
/// [`TrackDescriptor::for_requester`] before they are queued, so every
/// queued entry gets its own identity.
pub type ResolveCache = LRUCache<String, Vec<TrackDescriptor>>;

impl ResolveCache {
    pub fn new_resolve_cache(capacity: usize, ttl: Duration) -> Self {
        Self::with_ttl(capacity, Some(ttl))
    }

    /// Limpia entradas expiradas; pensado para la tarea de mantenimiento.
    pub fn cleanup_old_entries(&self) {
        let removed = self.cleanup_expired();
        if removed > 0 {
            info!("🧹 Cache cleanup: removed {} expired entries", removed);
        }
    }
}
