use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use serde::{Deserialize, Serialize};

/// Pacing knobs for the crawler worker.
#[derive(PartialEq, Eq, Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlerConfig {
    /// Microseconds slept between pacing intervals. `0` disables sleeping;
    /// the worker still cycles its lock so control calls can interleave.
    pub sleep_us: u32,
    /// Entries evaluated per pacing interval.
    pub crawls_persleep: i32,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            sleep_us: 100,
            crawls_persleep: 1000,
        }
    }
}

/// Runtime-adjustable view of [`CrawlerConfig`]. The worker rereads these on
/// every pacing tick, so changes apply to a scan already in flight.
pub(crate) struct Tunables {
    sleep_us: AtomicU32,
    crawls_persleep: AtomicI32,
}

impl Tunables {
    pub fn new(config: CrawlerConfig) -> Self {
        Self {
            sleep_us: AtomicU32::new(config.sleep_us),
            crawls_persleep: AtomicI32::new(config.crawls_persleep),
        }
    }

    pub fn sleep_us(&self) -> u32 {
        self.sleep_us.load(Ordering::Relaxed)
    }

    pub fn set_sleep_us(&self, us: u32) {
        self.sleep_us.store(us, Ordering::Relaxed);
    }

    pub fn crawls_persleep(&self) -> i32 {
        self.crawls_persleep.load(Ordering::Relaxed)
    }

    pub fn set_crawls_persleep(&self, n: i32) {
        self.crawls_persleep.store(n, Ordering::Relaxed);
    }
}
