//! Interfaces the crawler consumes from the embedding cache.
//!
//! The crawler owns no entries, no queues and no index; everything it touches
//! belongs to the host and is reached through [`CacheHost`]. Guard types are
//! host-defined so the host keeps its own locking layout; the crawler only
//! fixes the acquisition order (scheduler, class queue, item hash lock,
//! policy-private state).

use std::io;

use bitflags::bitflags;

bitflags! {
    /// Entry flag bits the crawler inspects. The host maps its own flag word
    /// onto these when handing out items.
    #[derive(Debug, Copy, Clone, Hash, Eq, PartialEq)]
    pub struct ItemFlags: u32 {
        /// The entry has been read at least once since it was stored.
        const FETCHED = 1 << 0;
        /// The key is raw binary and must be base64-armored when dumped.
        const KEY_BINARY = 1 << 1;
        /// The payload lives in external storage; only a header remains here.
        const HDR = 1 << 2;
    }
}

/// Location of an externally stored payload.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ExtHeader {
    pub page_id: u32,
    pub offset: u32,
}

/// Read-only view of a cache entry.
///
/// `exptime` and `last_access` are in the host's relative clock (seconds
/// since process start, `0` meaning "never expires"); dump policies add
/// [`CacheHost::process_started`] to recover wall-clock values.
pub trait CrawlItem {
    fn key(&self) -> &[u8];
    fn flags(&self) -> ItemFlags;
    fn class_id(&self) -> u32;
    fn exptime(&self) -> u32;
    fn last_access(&self) -> u32;
    fn cas(&self) -> u64;
    fn total_size(&self) -> u64;
    fn client_flags(&self) -> u64;
    /// Present iff [`ItemFlags::HDR`] is set.
    fn ext_header(&self) -> Option<ExtHeader>;
}

/// One step of a hash-index walk.
pub enum HashStep<I> {
    /// An entry, returned with its bucket lock held by the iterator.
    Item(I),
    /// The iterator is between buckets; no locks are held. Safe point for
    /// client flushes and pacing.
    BucketEnd,
    /// The table is exhausted.
    Done,
}

/// A connection hijacked from the frontend for the duration of a dump scan.
///
/// `read`/`write` are non-blocking and report `WouldBlock` instead of
/// stalling. Exactly one of `close` or `redispatch` consumes the connection:
/// `close` tears it down from the crawler thread, `redispatch` hands it back
/// to the worker fleet.
pub trait ScanConn: Send {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;
    fn close(self: Box<Self>);
    fn redispatch(self: Box<Self>);
}

/// Everything the crawler needs from the cache it scans.
///
/// # Refcount contract
///
/// `refcount_incr`/`refcount_decr` return the post-operation value. An entry
/// sitting in a queue holds one reference; after the crawler's increment a
/// value of exactly 2 means the entry is quiescent and safe to inspect.
/// Anything else means the entry is being freed or published concurrently and
/// must be skipped (undo the increment, move on). The hash walk relaxes this
/// to "at least 2" because the bucket lock already pins the entry.
///
/// # Cursor sentinel
///
/// The host owns one queue sentinel per class. `link_cursor` splices it at
/// the tail, `crawl_step` swaps it with its predecessor and returns the entry
/// stepped over (`None` at the head), `unlink_cursor` removes it. All three
/// take the class guard, so the sentinel is only ever touched under the class
/// lock.
pub trait CacheHost: Send + Sync + 'static {
    /// Cheap, cloneable handle to an entry (the handle itself carries no
    /// ownership; lifetime is governed by the refcount contract above).
    type Item: CrawlItem + Clone + Send;
    /// Held while a per-class queue is locked.
    type ClassGuard<'a>
    where
        Self: 'a;
    /// Held while an entry's hash bucket lock is taken.
    type ItemGuard<'a>
    where
        Self: 'a;
    /// Hash-index iterator. Dropping it must release whatever blocks table
    /// expansion, even when the walk aborts early.
    type HashIter<'a>
    where
        Self: 'a;

    /// Number of per-class queues, including sublist slots.
    fn class_count(&self) -> usize;
    fn lock_class(&self, class_id: usize) -> Self::ClassGuard<'_>;
    fn queue_size(&self, guard: &Self::ClassGuard<'_>) -> u32;
    fn link_cursor(&self, guard: &mut Self::ClassGuard<'_>);
    fn unlink_cursor(&self, guard: &mut Self::ClassGuard<'_>);
    fn crawl_step(&self, guard: &mut Self::ClassGuard<'_>) -> Option<Self::Item>;

    /// Non-blocking; `None` means another thread holds the bucket lock and
    /// the entry is skipped this pass.
    fn try_lock_item(&self, hv: u32) -> Option<Self::ItemGuard<'_>>;
    fn refcount_incr(&self, item: &Self::Item) -> u32;
    fn refcount_decr(&self, item: &Self::Item) -> u32;
    /// Unlink from hash and queue, dropping the reference the queue itself
    /// held. Caller holds the class guard and the entry's hash lock.
    fn unlink_item_nolock(&self, guard: &mut Self::ClassGuard<'_>, item: &Self::Item, hv: u32);
    /// Drop the reference obtained by the queue walk, freeing the entry when
    /// it was the last one.
    fn remove_item(&self, item: &Self::Item);

    /// `None` while the index is mid-expansion; the scan reports a lock error
    /// to its client instead of waiting.
    fn hash_iterator(&self) -> Option<Self::HashIter<'_>>;
    fn hash_iterate<'a>(&'a self, iter: &mut Self::HashIter<'a>) -> HashStep<Self::Item>;

    /// True when a cache-wide flush has invalidated this entry.
    fn item_is_flushed(&self, item: &Self::Item) -> bool;
    /// Validity check for externally stored payloads. Hosts without external
    /// storage keep the default.
    fn storage_validate_item(&self, item: &Self::Item) -> bool {
        let _ = item;
        true
    }
    /// Delete notification for external storage; called for every reclaimed
    /// entry.
    fn storage_delete(&self, item: &Self::Item) {
        let _ = item;
    }

    fn hash_key(&self, key: &[u8]) -> u32;
    /// Monotonic seconds since process start.
    fn current_time(&self) -> u32;
    /// Epoch seconds at process start.
    fn process_started(&self) -> i64;

    /// Per-class crawl accounting, reported once when a class finishes.
    fn add_crawl_stats(&self, class_id: usize, reclaimed: u64, unfetched: u64, checked: u64);
    fn crawler_running(&self) -> bool;
    fn set_crawler_running(&self, running: bool);
}
