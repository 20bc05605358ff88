//! In-memory cache host and socketpair-backed connections for tests.

use std::io::{Read, Write};
use std::net::Shutdown;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use std::{fmt, io};

use parking_lot::{Mutex, MutexGuard};

use crate::host::{CacheHost, CrawlItem, ExtHeader, HashStep, ItemFlags, ScanConn};

const ITEM_LOCKS: usize = 8;
const HASH_BUCKETS: usize = 4;

pub(crate) struct TestItem {
    pub key: Vec<u8>,
    pub flags: ItemFlags,
    pub exptime: AtomicU32,
    pub time: u32,
    pub cas: u64,
    pub size: u64,
    pub client_flags: u64,
    pub ext: Option<ExtHeader>,
    pub refcount: AtomicU32,
    pub linked: AtomicBool,
    pub class: u32,
}

impl TestItem {
    pub fn new(key: &[u8]) -> Self {
        Self {
            key: key.to_vec(),
            flags: ItemFlags::empty(),
            exptime: AtomicU32::new(0),
            time: 0,
            cas: 0,
            size: 64,
            client_flags: 0,
            ext: None,
            refcount: AtomicU32::new(1),
            linked: AtomicBool::new(false),
            class: 0,
        }
    }
}

impl fmt::Debug for TestItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestItem")
            .field("key", &String::from_utf8_lossy(&self.key))
            .finish_non_exhaustive()
    }
}

impl CrawlItem for Arc<TestItem> {
    fn key(&self) -> &[u8] {
        &self.key
    }
    fn flags(&self) -> ItemFlags {
        self.flags
    }
    fn class_id(&self) -> u32 {
        self.class
    }
    fn exptime(&self) -> u32 {
        self.exptime.load(Ordering::Relaxed)
    }
    fn last_access(&self) -> u32 {
        self.time
    }
    fn cas(&self) -> u64 {
        self.cas
    }
    fn total_size(&self) -> u64 {
        self.size
    }
    fn client_flags(&self) -> u64 {
        self.client_flags
    }
    fn ext_header(&self) -> Option<ExtHeader> {
        self.ext
    }
}

#[derive(Default)]
struct ClassQueue {
    /// Head first, tail last. The cursor counts how many entries are still
    /// ahead of the sentinel (toward the head).
    items: Vec<Arc<TestItem>>,
    cursor: Option<usize>,
}

pub(crate) struct TestClassGuard<'a> {
    q: MutexGuard<'a, ClassQueue>,
}

pub(crate) struct TestHashIter {
    buckets: Vec<Vec<Arc<TestItem>>>,
    bucket: usize,
    idx: usize,
}

pub(crate) struct TestCache {
    classes: Box<[Mutex<ClassQueue>]>,
    item_locks: Box<[Mutex<()>]>,
    now: AtomicU32,
    started: i64,
    /// Entries last touched before this epoch count as flushed; 0 disables.
    flush_epoch: AtomicU32,
    running: AtomicBool,
    hash_frozen: AtomicBool,
    storage_deletes: AtomicUsize,
    ext_invalid: AtomicBool,
    crawl_stats: Mutex<Vec<(usize, u64, u64, u64)>>,
}

impl TestCache {
    pub fn new(classes: usize) -> Arc<Self> {
        Arc::new(Self {
            classes: (0..classes).map(|_| Mutex::new(ClassQueue::default())).collect(),
            item_locks: (0..ITEM_LOCKS).map(|_| Mutex::new(())).collect(),
            now: AtomicU32::new(1000),
            started: 1_700_000_000,
            flush_epoch: AtomicU32::new(0),
            running: AtomicBool::new(false),
            hash_frozen: AtomicBool::new(false),
            storage_deletes: AtomicUsize::new(0),
            ext_invalid: AtomicBool::new(false),
            crawl_stats: Mutex::new(Vec::new()),
        })
    }

    pub fn insert(&self, class: usize, mut item: TestItem) -> Arc<TestItem> {
        item.class = class as u32;
        let item = Arc::new(item);
        item.linked.store(true, Ordering::Release);
        self.classes[class].lock().items.push(item.clone());
        item
    }

    pub fn now(&self) -> u32 {
        self.now.load(Ordering::Relaxed)
    }

    pub fn advance(&self, secs: u32) {
        self.now.fetch_add(secs, Ordering::Relaxed);
    }

    pub fn freeze_hash(&self, frozen: bool) {
        self.hash_frozen.store(frozen, Ordering::Relaxed);
    }

    pub fn invalidate_ext(&self) {
        self.ext_invalid.store(true, Ordering::Relaxed);
    }

    pub fn storage_deletes(&self) -> usize {
        self.storage_deletes.load(Ordering::Relaxed)
    }

    pub fn queue_len(&self, class: usize) -> usize {
        self.classes[class].lock().items.len()
    }

    pub fn crawl_stats(&self) -> Vec<(usize, u64, u64, u64)> {
        self.crawl_stats.lock().clone()
    }
}

impl CacheHost for TestCache {
    type Item = Arc<TestItem>;
    type ClassGuard<'a>
        = TestClassGuard<'a>
    where
        Self: 'a;
    type ItemGuard<'a>
        = MutexGuard<'a, ()>
    where
        Self: 'a;
    type HashIter<'a>
        = TestHashIter
    where
        Self: 'a;

    fn class_count(&self) -> usize {
        self.classes.len()
    }

    fn lock_class(&self, class_id: usize) -> TestClassGuard<'_> {
        TestClassGuard {
            q: self.classes[class_id].lock(),
        }
    }

    fn queue_size(&self, guard: &TestClassGuard<'_>) -> u32 {
        guard.q.items.len() as u32
    }

    fn link_cursor(&self, guard: &mut TestClassGuard<'_>) {
        let len = guard.q.items.len();
        guard.q.cursor = Some(len);
    }

    fn unlink_cursor(&self, guard: &mut TestClassGuard<'_>) {
        guard.q.cursor = None;
    }

    fn crawl_step(&self, guard: &mut TestClassGuard<'_>) -> Option<Arc<TestItem>> {
        let q = &mut *guard.q;
        let pos = q.cursor.as_mut()?;
        if *pos == 0 {
            return None;
        }
        *pos -= 1;
        Some(q.items[*pos].clone())
    }

    fn try_lock_item(&self, hv: u32) -> Option<MutexGuard<'_, ()>> {
        self.item_locks[hv as usize % ITEM_LOCKS].try_lock()
    }

    fn refcount_incr(&self, item: &Arc<TestItem>) -> u32 {
        item.refcount.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn refcount_decr(&self, item: &Arc<TestItem>) -> u32 {
        item.refcount.fetch_sub(1, Ordering::AcqRel) - 1
    }

    fn unlink_item_nolock(&self, guard: &mut TestClassGuard<'_>, item: &Arc<TestItem>, _hv: u32) {
        let q = &mut *guard.q;
        if let Some(idx) = q.items.iter().position(|it| Arc::ptr_eq(it, item)) {
            q.items.remove(idx);
            if let Some(pos) = q.cursor.as_mut() {
                if idx < *pos {
                    *pos -= 1;
                }
            }
        }
        item.linked.store(false, Ordering::Release);
        self.refcount_decr(item);
    }

    fn remove_item(&self, item: &Arc<TestItem>) {
        self.refcount_decr(item);
    }

    fn hash_iterator(&self) -> Option<TestHashIter> {
        if self.hash_frozen.load(Ordering::Relaxed) {
            return None;
        }
        let mut buckets = vec![Vec::new(); HASH_BUCKETS];
        for class in self.classes.iter() {
            for item in class.lock().items.iter() {
                let b = self.hash_key(&item.key) as usize % HASH_BUCKETS;
                buckets[b].push(item.clone());
            }
        }
        Some(TestHashIter {
            buckets,
            bucket: 0,
            idx: 0,
        })
    }

    fn hash_iterate<'a>(&'a self, iter: &mut TestHashIter) -> HashStep<Arc<TestItem>> {
        if iter.bucket >= iter.buckets.len() {
            return HashStep::Done;
        }
        if iter.idx < iter.buckets[iter.bucket].len() {
            let item = iter.buckets[iter.bucket][iter.idx].clone();
            iter.idx += 1;
            return HashStep::Item(item);
        }
        iter.bucket += 1;
        iter.idx = 0;
        HashStep::BucketEnd
    }

    fn item_is_flushed(&self, item: &Arc<TestItem>) -> bool {
        let epoch = self.flush_epoch.load(Ordering::Relaxed);
        epoch != 0 && item.time < epoch
    }

    fn storage_validate_item(&self, item: &Arc<TestItem>) -> bool {
        !(item.flags.contains(ItemFlags::HDR) && self.ext_invalid.load(Ordering::Relaxed))
    }

    fn storage_delete(&self, _item: &Arc<TestItem>) {
        self.storage_deletes.fetch_add(1, Ordering::Relaxed);
    }

    fn hash_key(&self, key: &[u8]) -> u32 {
        key.iter()
            .fold(2166136261u32, |h, b| (h ^ u32::from(*b)).wrapping_mul(16777619))
    }

    fn current_time(&self) -> u32 {
        self.now.load(Ordering::Relaxed)
    }

    fn process_started(&self) -> i64 {
        self.started
    }

    fn add_crawl_stats(&self, class_id: usize, reclaimed: u64, unfetched: u64, checked: u64) {
        self.crawl_stats
            .lock()
            .push((class_id, reclaimed, unfetched, checked));
    }

    fn crawler_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn set_crawler_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }
}

#[derive(Default)]
pub(crate) struct ConnHooks {
    closed: AtomicUsize,
    redispatched: AtomicUsize,
}

impl ConnHooks {
    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::Acquire)
    }

    pub fn redispatched(&self) -> usize {
        self.redispatched.load(Ordering::Acquire)
    }
}

/// `ScanConn` over one end of a non-blocking socketpair, with hook counters
/// standing in for the frontend's close/redispatch handlers.
pub(crate) struct TestConn {
    stream: UnixStream,
    hooks: Arc<ConnHooks>,
}

impl TestConn {
    pub fn pair() -> (TestConn, PeerEnd) {
        let (a, b) = UnixStream::pair().expect("socketpair");
        a.set_nonblocking(true).expect("nonblocking");
        b.set_nonblocking(true).expect("nonblocking");
        (
            TestConn {
                stream: a,
                hooks: Arc::new(ConnHooks::default()),
            },
            PeerEnd { stream: b },
        )
    }

    pub fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    pub fn hooks(&self) -> Arc<ConnHooks> {
        self.hooks.clone()
    }
}

impl ScanConn for TestConn {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn close(self: Box<Self>) {
        self.hooks.closed.fetch_add(1, Ordering::AcqRel);
    }

    fn redispatch(self: Box<Self>) {
        self.hooks.redispatched.fetch_add(1, Ordering::AcqRel);
    }
}

pub(crate) struct PeerEnd {
    stream: UnixStream,
}

impl PeerEnd {
    /// Read whatever is currently buffered.
    pub fn drain(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(_) => break,
            }
        }
        out
    }

    /// Keep reading until `needle` shows up or a couple of seconds pass.
    pub fn read_until(&mut self, needle: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        for _ in 0..2000 {
            match self.stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    out.extend_from_slice(&buf[..n]);
                    if out.windows(needle.len()).any(|w| w == needle) {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(1));
                }
                Err(_) => break,
            }
        }
        out
    }

    pub fn hang_up(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// Poll `cond` for up to ~2 seconds.
pub(crate) fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..2000 {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    false
}

/// Cache plus started crawler, with pacing sleeps disabled so tests run at
/// full speed through the lock-cycle path.
pub(crate) fn setup(classes: usize) -> (Arc<TestCache>, Arc<crate::Crawler<TestCache>>) {
    let cache = TestCache::new(classes);
    let crawler = crate::Crawler::new(
        cache.clone(),
        crate::CrawlerConfig {
            sleep_us: 0,
            crawls_persleep: 1000,
        },
    );
    crawler.start().expect("start worker");
    (cache, crawler)
}

pub(crate) fn class_sel(len: usize, ids: &[usize]) -> Vec<bool> {
    let mut v = vec![false; len];
    for &i in ids {
        v[i] = true;
    }
    v
}
