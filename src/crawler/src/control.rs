use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, warn};

use crate::client::ScanClient;
use crate::config::{CrawlerConfig, Tunables};
use crate::cursor::Cursor;
use crate::host::{CacheHost, ScanConn};
use crate::policy::{ActiveScan, ExpireData, PolicyKind, ScanModule};

/// Smallest valid class id; id 0 is reserved by the slab allocator.
pub const POWER_SMALLEST: usize = 1;
/// Exclusive upper bound for user-supplied class ids.
pub const MAX_SLAB_CLASSES: usize = 63;
/// Size of the class-id space once sublist tags are OR'd in.
pub const POWER_LARGEST: usize = 256;

/// Sublist tags, OR'd onto a class id to address one of its queues.
pub const HOT_LRU: usize = 0;
pub const WARM_LRU: usize = 64;
pub const COLD_LRU: usize = 128;
pub const TEMP_LRU: usize = 192;

/// Budget sentinel: cap the walk to the queue's length at start time, so the
/// scan terminates even while the foreground keeps pushing.
pub const CAP_REMAINING: u32 = u32::MAX;

/// Seconds during which autoexpire submissions are refused after one was
/// turned away busy.
const AUTOEXPIRE_BACKOFF: u32 = 60;

/// Which queues a scan request covers.
#[derive(Debug, Clone, Copy)]
pub enum Selector<'a> {
    /// Walk the hash index bucket-by-bucket instead of the class queues.
    /// Only dump policies are accepted here.
    Hash,
    /// Per-class-id enable bits, indexed by class id.
    Classes(&'a [bool]),
}

/// Result of the high-level [`Crawler::crawl`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrawlStatus {
    Ok,
    Running,
    BadClass,
    Error,
    NotStarted,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("another crawl is already running")]
    Busy,
    #[error("crawler worker is not running")]
    WorkerDown,
    #[error("policy cannot drive a hash walk")]
    BadPolicy,
    #[error("policy streams records but no usable client was supplied")]
    MissingClient,
    #[error("could not allocate the client buffer")]
    ClientBuffer,
}

#[derive(Debug, Error)]
pub enum StartError {
    #[error("crawler worker already started")]
    AlreadyRunning,
    #[error("failed to spawn crawler thread: {0}")]
    Spawn(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum StopError {
    #[error("crawler thread panicked")]
    Join,
}

/// State owned by the scheduler mutex.
pub(crate) struct SchedState {
    /// Worker run flag; checked on every condvar wake.
    pub run: bool,
    /// Enabled cursors, or `-1` to request one hash walk.
    pub crawler_count: i32,
    /// The single active scan slot.
    pub active: Option<ActiveScan>,
    /// Autoexpire submissions are refused until this relative time.
    pub block_ae_until: u32,
}

/// While held, the worker cannot wake up or take another pacing step. Other
/// subsystems use this for brief stop-the-world windows around the crawler.
#[must_use]
pub struct PauseGuard<'a>(#[allow(dead_code)] MutexGuard<'a, SchedState>);

/// The background item crawler: one worker thread, one scan at a time.
pub struct Crawler<H: CacheHost> {
    pub(crate) host: Arc<H>,
    pub(crate) tunables: Tunables,
    pub(crate) sched: Mutex<SchedState>,
    pub(crate) cond: Condvar,
    /// One per class, indexed by class id. Lock order: scheduler, class
    /// queue, cursor.
    pub(crate) cursors: Box<[Mutex<Cursor>]>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

fn reject(conn: Option<Box<dyn ScanConn>>, err: SubmitError) -> SubmitError {
    warn!("refusing crawl submission: {err}");
    if let Some(c) = conn {
        c.redispatch();
    }
    err
}

impl<H: CacheHost> Crawler<H> {
    pub fn new(host: Arc<H>, config: CrawlerConfig) -> Arc<Self> {
        let cursors = (0..host.class_count())
            .map(|_| Mutex::new(Cursor::default()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Arc::new(Self {
            host,
            tunables: Tunables::new(config),
            sched: Mutex::new(SchedState {
                run: false,
                crawler_count: 0,
                active: None,
                block_ae_until: 0,
            }),
            cond: Condvar::new(),
            cursors,
            worker: Mutex::new(None),
        })
    }

    /// Spawn the worker thread. Does not return until the worker is parked
    /// on the scheduler condvar, so a submission immediately after is safe.
    pub fn start(self: &Arc<Self>) -> Result<(), StartError> {
        let mut sched = self.sched.lock();
        if sched.run {
            return Err(StartError::AlreadyRunning);
        }
        sched.run = true;
        let this = Arc::clone(self);
        let handle = match thread::Builder::new()
            .name("item crawler".to_string())
            .spawn(move || this.work())
        {
            Ok(h) => h,
            Err(e) => {
                sched.run = false;
                return Err(StartError::Spawn(e));
            }
        };
        *self.worker.lock() = Some(handle);
        // The worker signals once it holds the scheduler mutex, then parks;
        // waking here therefore means it is blocked on the condvar.
        self.cond.wait(&mut sched);
        Ok(())
    }

    /// Ask the worker to exit. A scan in flight finishes first; the flag is
    /// only checked between scans.
    pub fn stop(&self, wait: bool) -> Result<(), StopError> {
        {
            let mut sched = self.sched.lock();
            if !sched.run {
                return Ok(());
            }
            sched.run = false;
            self.cond.notify_one();
        }
        if wait {
            let handle = self.worker.lock().take();
            if let Some(h) = handle {
                h.join().map_err(|_| StopError::Join)?;
            }
        }
        Ok(())
    }

    /// Hold the scheduler mutex. The worker releases it on every pacing tick
    /// and never keeps it across blocking I/O, so this converges quickly.
    pub fn pause(&self) -> PauseGuard<'_> {
        PauseGuard(self.sched.lock())
    }

    pub fn set_sleep_us(&self, us: u32) {
        self.tunables.set_sleep_us(us);
    }

    pub fn set_crawls_persleep(&self, n: i32) {
        self.tunables.set_crawls_persleep(n);
    }

    /// Low-level submission. Returns how many class walks started (a hash
    /// walk counts as one). A refused submission redispatches the supplied
    /// connection so the frontend can answer the caller.
    pub fn submit(
        &self,
        selector: Selector<'_>,
        remaining: u32,
        policy: PolicyKind,
        data: Option<Arc<Mutex<ExpireData>>>,
        mut conn: Option<Box<dyn ScanConn>>,
        fd: RawFd,
    ) -> Result<u32, SubmitError> {
        let mut sched = self.sched.lock();
        let now = self.host.current_time();
        let is_running = self.host.crawler_running();

        if !sched.run {
            return Err(reject(conn, SubmitError::WorkerDown));
        }

        if is_running {
            // Only a second autoexpire may join a running autoexpire scan:
            // it restarts cursors for classes that already finished, without
            // rebinding the module.
            let merging = policy == PolicyKind::Autoexpire
                && sched.active.as_ref().map(|s| s.policy) == Some(PolicyKind::Autoexpire);
            if !merging {
                sched.block_ae_until = now + AUTOEXPIRE_BACKOFF;
                return Err(reject(conn, SubmitError::Busy));
            }
        }
        if policy == PolicyKind::Autoexpire && sched.block_ae_until > now {
            return Err(reject(conn, SubmitError::Busy));
        }

        if matches!(selector, Selector::Hash)
            && !matches!(policy, PolicyKind::Metadump | PolicyKind::Mgdump)
        {
            return Err(reject(conn, SubmitError::BadPolicy));
        }

        if !is_running {
            let module = ScanModule::bind(policy, data, self.cursors.len(), now);
            let client = if module.needs_client() {
                let Some(c) = conn.take() else {
                    warn!("dump crawl submitted without a client");
                    return Err(SubmitError::MissingClient);
                };
                if fd == 0 {
                    warn!("dump crawl submitted with an unusable client fd");
                    c.redispatch();
                    return Err(SubmitError::MissingClient);
                }
                match ScanClient::open(c, fd) {
                    Ok(client) => Some(client),
                    Err(e) => {
                        warn!("could not allocate the crawl client buffer: {e}");
                        return Err(SubmitError::ClientBuffer);
                    }
                }
            } else {
                None
            };
            sched.active = Some(ActiveScan::new(policy, module, client));
        }
        if let Some(c) = conn.take() {
            c.redispatch();
        }

        let starts = match selector {
            Selector::Hash => {
                sched.crawler_count = -1;
                1
            }
            Selector::Classes(ids) => {
                let mut starts = 0;
                for sid in POWER_SMALLEST..self.cursors.len() {
                    if ids.get(sid).copied().unwrap_or(false) {
                        starts += self.start_class(&mut sched, sid, remaining);
                    }
                }
                starts
            }
        };

        if starts > 0 {
            self.host.set_crawler_running(true);
            debug!(starts, "crawl started");
            self.cond.notify_one();
        }
        Ok(starts)
    }

    /// High-level entry point: `slabs` is `"all"`, `"hash"`, or a
    /// comma-separated class list. Each explicit class covers all four of
    /// its sublist queues.
    pub fn crawl(
        &self,
        slabs: &str,
        policy: PolicyKind,
        conn: Option<Box<dyn ScanConn>>,
        fd: RawFd,
        remaining: u32,
    ) -> CrawlStatus {
        let mut tocrawl = vec![false; self.cursors.len()];
        let mut hash_crawl = false;
        if slabs == "all" {
            tocrawl.fill(true);
        } else if slabs == "hash" {
            hash_crawl = true;
        } else {
            // empty fields from doubled or trailing commas are skipped, not
            // treated as bad classes
            for tok in slabs.split(',').filter(|t| !t.is_empty()) {
                let Ok(sid) = tok.parse::<usize>() else {
                    if let Some(c) = conn {
                        c.redispatch();
                    }
                    return CrawlStatus::BadClass;
                };
                if !(POWER_SMALLEST..MAX_SLAB_CLASSES).contains(&sid) {
                    if let Some(c) = conn {
                        c.redispatch();
                    }
                    return CrawlStatus::BadClass;
                }
                for tag in [TEMP_LRU, HOT_LRU, WARM_LRU, COLD_LRU] {
                    if let Some(slot) = tocrawl.get_mut(sid | tag) {
                        *slot = true;
                    }
                }
            }
        }

        let selector = if hash_crawl {
            Selector::Hash
        } else {
            Selector::Classes(&tocrawl)
        };
        match self.submit(selector, remaining, policy, None, conn, fd) {
            Ok(0) => CrawlStatus::NotStarted,
            Ok(_) => CrawlStatus::Ok,
            Err(SubmitError::Busy) => CrawlStatus::Running,
            Err(_) => CrawlStatus::Error,
        }
    }

    /// Arm and link one class cursor. No-op (zero starts) while the class is
    /// already being crawled.
    fn start_class(&self, sched: &mut SchedState, class_id: usize, mut remaining: u32) -> u32 {
        let mut guard = self.host.lock_class(class_id);
        let mut cursor = self.cursors[class_id].lock();
        if cursor.enabled {
            return 0;
        }
        debug!(class = class_id, remaining, "kicking crawler off");
        if remaining == CAP_REMAINING {
            remaining = self.host.queue_size(&guard);
        }
        // Stored pre-incremented: the step that drops it to zero ends the
        // walk without visiting its entry, so callers get exactly the count
        // they asked for.
        if remaining != 0 {
            remaining += 1;
        }
        cursor.arm(class_id, remaining);
        self.host.link_cursor(&mut guard);
        sched.crawler_count += 1;
        1
    }
}
