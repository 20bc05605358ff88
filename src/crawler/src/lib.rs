//! Background item crawler for an in-memory cache.
//!
//! A single worker thread cooperatively walks the cache's per-class LRU
//! queues (or its hash index) to reclaim expired entries or stream
//! point-in-time dumps to a client, interleaving with the foreground request
//! path under the cache's own locks. The cache plugs in through the traits
//! in [`host`]; the crawler owns only the scheduling, pacing and buffering.

mod client;
mod config;
mod control;
mod cursor;
mod host;
mod policy;
#[cfg(test)]
mod testutil;
mod worker;

pub use client::MIN_BUFSPACE;
pub use config::CrawlerConfig;
pub use control::{
    CrawlStatus, Crawler, PauseGuard, Selector, StartError, StopError, SubmitError, CAP_REMAINING,
    COLD_LRU, HOT_LRU, MAX_SLAB_CLASSES, POWER_LARGEST, POWER_SMALLEST, TEMP_LRU, WARM_LRU,
};
pub use host::{CacheHost, CrawlItem, ExtHeader, HashStep, ItemFlags, ScanConn};
pub use policy::{ClassExpireStats, ExpireData, PolicyKind, TTL_HISTO_BUCKETS};
