//! The crawler worker thread: parks on the scheduler condvar, pumps class
//! cursors round-robin (or drives one hash walk), then finalizes the scan.
//!
//! Locking discipline: the scheduler mutex is held throughout except during
//! pacing sleeps, lock-cycle ticks and client flushes, so `pause` and
//! submissions always get a timely window and no socket I/O ever happens
//! under a cache lock.

use std::thread;
use std::time::Duration;

use parking_lot::MutexGuard;
use tracing::{debug, error, warn};

use crate::client::MIN_BUFSPACE;
use crate::control::{Crawler, SchedState, POWER_SMALLEST};
use crate::host::{CacheHost, CrawlItem, HashStep};

/// Batch records between flushes during a hash walk to cut down on
/// poll/write syscalls.
const MIN_ITEMS_PER_WRITE: u32 = 16;

enum Pre {
    Proceed,
    NeedFlush,
    EndClass,
    NoScan,
}

impl<H: CacheHost> Crawler<H> {
    pub(crate) fn work(self: std::sync::Arc<Self>) {
        let mut sched = self.sched.lock();
        // unblocks start(): we hold the mutex, so the signal cannot be
        // consumed before the caller is in its wait
        self.cond.notify_one();
        debug!("starting item crawler thread");
        let mut persleep = self.tunables.crawls_persleep();

        while sched.run {
            self.cond.wait(&mut sched);

            if sched.crawler_count == -1 {
                self.crawl_hash(&mut sched);
                sched.crawler_count = 0;
            } else {
                while sched.crawler_count > 0 {
                    for class_id in POWER_SMALLEST..self.cursors.len() {
                        if self.pump_class(&mut sched, class_id) {
                            let trigger = persleep <= 0;
                            persleep -= 1;
                            self.sleep_cycle(&mut sched, trigger, &mut persleep);
                        }
                    }
                }
            }

            self.finish_scan(&mut sched);
            debug!("item crawler thread sleeping");
            self.host.set_crawler_running(false);
        }

        drop(sched);
        debug!("item crawler thread stopping");
    }

    /// One pass over `class_id`: advance its cursor a single step and hand
    /// the entry to the policy. Returns true when an entry was evaluated
    /// (pacing applies only then).
    fn pump_class(&self, g: &mut MutexGuard<'_, SchedState>, class_id: usize) -> bool {
        if !self.cursors[class_id].lock().enabled {
            return false;
        }

        // Make room in the client buffer before taking any cache lock; the
        // flush may sit in poll for up to a second.
        let pre = {
            let sched: &mut SchedState = &mut **g;
            match sched.active.as_mut() {
                None => Pre::NoScan,
                Some(scan) => match (&scan.client, scan.module.needs_client()) {
                    (Some(c), _) if c.space() < MIN_BUFSPACE => Pre::NeedFlush,
                    (Some(_), _) => Pre::Proceed,
                    (None, true) => Pre::EndClass,
                    (None, false) => Pre::Proceed,
                },
            }
        };
        match pre {
            Pre::NoScan => return false,
            Pre::Proceed => {}
            Pre::EndClass => {
                let guard = self.host.lock_class(class_id);
                self.class_done(g, class_id, guard);
                return false;
            }
            Pre::NeedFlush => {
                if !self.flush_client(g) {
                    let guard = self.host.lock_class(class_id);
                    self.class_done(g, class_id, guard);
                    return false;
                }
            }
        }

        let mut class_lock = Some(self.host.lock_class(class_id));
        let step = self.host.crawl_step(class_lock.as_mut().unwrap());
        let item = match step {
            Some(item) if !self.budget_spent(class_id) => item,
            _ => {
                debug!(class = class_id, "nothing left to crawl");
                self.class_done(g, class_id, class_lock.take().unwrap());
                return false;
            }
        };

        let hv = self.host.hash_key(item.key());
        // With the bucket locked, nobody else can touch the refcount; any
        // value other than 2 after our increment means the entry is in a
        // transitional state and gets skipped.
        let Some(item_lock) = self.host.try_lock_item(hv) else {
            return false;
        };
        if self.host.refcount_incr(&item) != 2 {
            self.host.refcount_decr(&item);
            return false;
        }

        let sched: &mut SchedState = &mut **g;
        let Some(scan) = sched.active.as_mut() else {
            self.host.refcount_decr(&item);
            return false;
        };
        let mut cursor = self.cursors[class_id].lock();
        cursor.checked += 1;
        let needs_lock = scan.module.needs_lock();
        if !needs_lock {
            class_lock = None;
        }
        // The policy either reclaims the entry or drops our reference.
        scan.eval(
            &*self.host,
            &item,
            hv,
            class_id,
            class_lock.as_mut(),
            Some(&mut *cursor),
        );
        drop(item_lock);
        drop(class_lock);
        true
    }

    /// Decrement a nonzero per-class budget; true when it just ran out (the
    /// current entry is abandoned unvisited).
    fn budget_spent(&self, class_id: usize) -> bool {
        let mut cursor = self.cursors[class_id].lock();
        cursor.remaining != 0 && {
            cursor.remaining -= 1;
            cursor.remaining < 1
        }
    }

    /// Retire a class: disable and unlink its cursor, report its counters,
    /// release the class lock, then give the policy its per-class hook.
    fn class_done(
        &self,
        g: &mut MutexGuard<'_, SchedState>,
        class_id: usize,
        mut guard: H::ClassGuard<'_>,
    ) {
        let (class, reclaimed, unfetched, checked) = {
            let mut cursor = self.cursors[class_id].lock();
            cursor.enabled = false;
            (
                cursor.class_id,
                cursor.reclaimed,
                cursor.unfetched,
                cursor.checked,
            )
        };
        g.crawler_count -= 1;
        self.host.unlink_cursor(&mut guard);
        self.host.add_crawl_stats(class, reclaimed, unfetched, checked);
        drop(guard);
        if let Some(scan) = g.active.as_mut() {
            scan.doneclass(class_id, self.host.current_time());
        }
    }

    /// Flush with the scheduler mutex released, lifting the client out of
    /// the scan slot for the duration. Returns false when the client died;
    /// the dead client is dropped so later checks see "no client attached".
    fn flush_client(&self, g: &mut MutexGuard<'_, SchedState>) -> bool {
        let Some(mut client) = g.active.as_mut().and_then(|s| s.client.take()) else {
            return false;
        };
        let ok = MutexGuard::unlocked(g, || client.flush().is_ok());
        if ok {
            if let Some(scan) = g.active.as_mut() {
                scan.client = Some(client);
            }
        } else {
            warn!("crawl client died mid-scan; dump output ends here");
        }
        ok
    }

    /// Walk the hash index instead of the class queues. Entries arrive with
    /// their bucket lock held, so the client buffer may only grow here;
    /// flushing waits for the between-buckets safe points.
    fn crawl_hash(&self, g: &mut MutexGuard<'_, SchedState>) {
        let Some(mut iter) = self.host.hash_iterator() else {
            // index is mid-expansion; finalize reports the lock error
            if let Some(scan) = g.active.as_mut() {
                scan.status = 1;
            }
            return;
        };
        let mut persleep = self.tunables.crawls_persleep();
        let mut items = 0u32;

        loop {
            match self.host.hash_iterate(&mut iter) {
                HashStep::Done => break,
                HashStep::BucketEnd => {
                    let (has_client, needs_client) = match g.active.as_ref() {
                        Some(scan) => (scan.client.is_some(), scan.module.needs_client()),
                        None => break,
                    };
                    if has_client {
                        if items > MIN_ITEMS_PER_WRITE {
                            items = 0;
                            if !self.flush_client(g) {
                                break;
                            }
                        }
                    } else if needs_client {
                        break;
                    }
                    self.sleep_cycle(g, persleep <= 0, &mut persleep);
                }
                HashStep::Item(item) => {
                    if self.host.refcount_incr(&item) < 2 {
                        self.host.refcount_decr(&item);
                        continue;
                    }
                    let sched: &mut SchedState = &mut **g;
                    let Some(scan) = sched.active.as_mut() else {
                        self.host.refcount_decr(&item);
                        break;
                    };
                    if let Some(c) = scan.client.as_mut() {
                        if c.space() < MIN_BUFSPACE && c.grow().is_err() {
                            error!("failed to grow client buffer, aborting hash walk");
                            self.host.refcount_decr(&item);
                            break;
                        }
                    }
                    scan.eval(&*self.host, &item, 0, 0, None, None);
                    persleep -= 1;
                    items += 1;
                }
            }
        }
        // dropping the iterator unblocks hash expansion
    }

    /// Tear down the finished scan: policy finalize, drain the client
    /// buffer, hand the connection back. Runs with the scheduler mutex
    /// released; submissions in that window still see the running flag.
    fn finish_scan(&self, g: &mut MutexGuard<'_, SchedState>) {
        let Some(mut scan) = g.active.take() else {
            return;
        };
        let now = self.host.current_time();
        MutexGuard::unlocked(g, || {
            scan.finalize(now);
            loop {
                let Some(client) = scan.client.as_mut() else {
                    break;
                };
                if client.is_empty() {
                    break;
                }
                if client.flush().is_err() {
                    scan.client = None;
                }
            }
            // the client may have died during the drain polls
            if let Some(client) = scan.client.as_mut() {
                client.release();
            }
        });
    }

    /// Pacing: sleep (mutex released) once per `crawls_persleep` entries, or
    /// just cycle the mutex when sleeping is disabled. This is the window
    /// pause and submissions rely on.
    fn sleep_cycle(
        &self,
        g: &mut MutexGuard<'_, SchedState>,
        trigger: bool,
        persleep: &mut i32,
    ) {
        let sleep_us = self.tunables.sleep_us();
        if trigger && sleep_us != 0 {
            MutexGuard::unlocked(g, || {
                thread::sleep(Duration::from_micros(u64::from(sleep_us)));
            });
            *persleep = self.tunables.crawls_persleep();
        } else if sleep_us == 0 {
            MutexGuard::unlocked(g, || {});
        }
    }
}
