//! Scan policies. A closed set: `expire` (and its `autoexpire` alias used by
//! the background maintainer), `metadump` and `mgdump`. Dispatch is bound
//! once per scan, not per entry.

mod expire;
mod metadump;
mod mgdump;

use std::sync::Arc;

use parking_lot::Mutex;

use crate::client::ScanClient;
use crate::cursor::Cursor;
use crate::host::CacheHost;

pub use expire::{ClassExpireStats, ExpireData, TTL_HISTO_BUCKETS};
pub(crate) use expire::ExpireModule;

/// Which policy a scan runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyKind {
    Expire,
    /// Same behavior as [`PolicyKind::Expire`]; submissions under this tag
    /// may merge into a running autoexpire scan and are throttled after a
    /// busy refusal.
    Autoexpire,
    Metadump,
    Mgdump,
}

pub(crate) enum ScanModule {
    Expire(ExpireModule),
    Metadump,
    Mgdump,
}

impl ScanModule {
    pub fn bind(
        policy: PolicyKind,
        data: Option<Arc<Mutex<ExpireData>>>,
        class_count: usize,
        now: u32,
    ) -> Self {
        match policy {
            PolicyKind::Expire | PolicyKind::Autoexpire => {
                ScanModule::Expire(ExpireModule::init(data, class_count, now))
            }
            PolicyKind::Metadump => ScanModule::Metadump,
            PolicyKind::Mgdump => ScanModule::Mgdump,
        }
    }

    /// Whether `eval` runs with the class queue lock still held.
    pub fn needs_lock(&self) -> bool {
        matches!(self, ScanModule::Expire(_))
    }

    /// Whether the scan streams records and therefore needs a client.
    pub fn needs_client(&self) -> bool {
        !matches!(self, ScanModule::Expire(_))
    }
}

/// The single active scan. At most one exists between submission acceptance
/// and finalize completion; it lives in the scheduler state and is torn down
/// by the worker.
pub(crate) struct ActiveScan {
    pub policy: PolicyKind,
    pub module: ScanModule,
    pub client: Option<ScanClient>,
    /// Nonzero when the scan could not run (hash iterator unavailable);
    /// dump finalizers report it to the client.
    pub status: i32,
}

impl ActiveScan {
    pub fn new(policy: PolicyKind, module: ScanModule, client: Option<ScanClient>) -> Self {
        Self {
            policy,
            module,
            client,
            status: 0,
        }
    }

    /// Run the policy on one visited entry. The entry arrives refcounted by
    /// the worker; every path either reclaims it or drops the reference.
    pub fn eval<H: CacheHost>(
        &mut self,
        host: &H,
        item: &H::Item,
        hv: u32,
        class_id: usize,
        class_guard: Option<&mut H::ClassGuard<'_>>,
        cursor: Option<&mut Cursor>,
    ) {
        match &mut self.module {
            ScanModule::Expire(m) => {
                if let (Some(guard), Some(cursor)) = (class_guard, cursor) {
                    m.eval(host, item, hv, class_id, guard, cursor);
                } else {
                    host.refcount_decr(item);
                }
            }
            ScanModule::Metadump => match self.client.as_mut() {
                Some(c) => metadump::eval(c, host, item),
                None => {
                    host.refcount_decr(item);
                }
            },
            ScanModule::Mgdump => match self.client.as_mut() {
                Some(c) => mgdump::eval(c, host, item),
                None => {
                    host.refcount_decr(item);
                }
            },
        }
    }

    pub fn doneclass(&mut self, class_id: usize, now: u32) {
        if let ScanModule::Expire(m) = &self.module {
            m.doneclass(class_id, now);
        }
    }

    /// Stamp completion (expire) or flush and append the terminal line
    /// (dumps). The worker drains whatever this leaves buffered.
    pub fn finalize(&mut self, now: u32) {
        match &self.module {
            ScanModule::Expire(m) => m.finalize(now),
            ScanModule::Metadump => dump_finalize(self.client.as_mut(), self.status, b"END\r\n"),
            ScanModule::Mgdump => dump_finalize(self.client.as_mut(), self.status, b"EN\r\n"),
        }
    }
}

fn dump_finalize(client: Option<&mut ScanClient>, status: i32, end: &[u8]) {
    let Some(c) = client else { return };
    if !c.is_attached() {
        return;
    }
    if c.flush().is_ok() {
        if status != 0 {
            c.append(b"ERROR locked try again later\r\n");
        } else {
            c.append(end);
        }
    }
}
