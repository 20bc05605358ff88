use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::cursor::Cursor;
use crate::host::{CacheHost, CrawlItem, ItemFlags};

/// TTL histogram buckets: one per remaining minute below an hour, plus a
/// spill slot.
pub const TTL_HISTO_BUCKETS: usize = 61;

/// Per-class tallies of one expiry sweep.
#[derive(Debug, Clone)]
pub struct ClassExpireStats {
    pub start_time: u32,
    pub end_time: u32,
    pub run_complete: bool,
    /// Live entries inspected and left in place.
    pub seen: u64,
    pub reclaimed: u64,
    /// Survivors with no expiry set.
    pub noexp: u64,
    /// Survivors with more than an hour of TTL left.
    pub ttl_hourplus: u64,
    /// Survivors bucketed by remaining TTL minutes.
    pub histo: [u64; TTL_HISTO_BUCKETS],
}

impl Default for ClassExpireStats {
    fn default() -> Self {
        Self {
            start_time: 0,
            end_time: 0,
            run_complete: false,
            seen: 0,
            reclaimed: 0,
            noexp: 0,
            ttl_hourplus: 0,
            histo: [0; TTL_HISTO_BUCKETS],
        }
    }
}

/// Whole-crawl expiry statistics. Callers that want to read results after the
/// scan pass their own handle at submission; otherwise the module allocates
/// one that dies with the scan.
#[derive(Debug, Default)]
pub struct ExpireData {
    pub classes: Vec<ClassExpireStats>,
    pub start_time: u32,
    pub end_time: u32,
    pub crawl_complete: bool,
}

pub(crate) struct ExpireModule {
    data: Arc<Mutex<ExpireData>>,
}

impl ExpireModule {
    pub fn init(data: Option<Arc<Mutex<ExpireData>>>, class_count: usize, now: u32) -> Self {
        let data = data.unwrap_or_else(|| {
            Arc::new(Mutex::new(ExpireData {
                start_time: now,
                ..ExpireData::default()
            }))
        });
        {
            let mut d = data.lock();
            d.classes.clear();
            d.classes.resize_with(class_count, ClassExpireStats::default);
            for s in d.classes.iter_mut() {
                s.start_time = now;
            }
        }
        Self { data }
    }

    pub fn eval<H: CacheHost>(
        &self,
        host: &H,
        item: &H::Item,
        hv: u32,
        class_id: usize,
        guard: &mut H::ClassGuard<'_>,
        cursor: &mut Cursor,
    ) {
        let mut d = self.data.lock();
        let now = host.current_time();
        let flags = item.flags();
        let is_flushed = host.item_is_flushed(item);
        let is_valid = if flags.contains(ItemFlags::HDR) {
            host.storage_validate_item(item)
        } else {
            true
        };
        let exptime = item.exptime();

        if (exptime != 0 && exptime < now) || is_flushed || !is_valid {
            cursor.reclaimed += 1;
            d.classes[class_id].reclaimed += 1;
            debug!(
                class = item.class_id(),
                flags = flags.bits(),
                "found an expired entry"
            );
            if !flags.contains(ItemFlags::FETCHED) && !is_flushed {
                cursor.unfetched += 1;
            }
            host.storage_delete(item);
            host.unlink_item_nolock(guard, item, hv);
            host.remove_item(item);
        } else {
            let s = &mut d.classes[class_id];
            s.seen += 1;
            host.refcount_decr(item);
            if exptime == 0 {
                s.noexp += 1;
            } else if exptime - now > 3599 {
                s.ttl_hourplus += 1;
            } else {
                let bucket = ((exptime - now) / 60) as usize;
                if bucket < TTL_HISTO_BUCKETS {
                    s.histo[bucket] += 1;
                }
            }
        }
    }

    pub fn doneclass(&self, class_id: usize, now: u32) {
        let mut d = self.data.lock();
        d.classes[class_id].end_time = now;
        d.classes[class_id].run_complete = true;
    }

    pub fn finalize(&self, now: u32) {
        let mut d = self.data.lock();
        d.end_time = now;
        d.crawl_complete = true;
    }
}
