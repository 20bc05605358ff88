use std::collections::TryReserveError;
use std::io;
use std::os::fd::{BorrowedFd, RawFd};

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::warn;

use crate::host::ScanConn;

/// Minimum free space a policy may assume before appending one record.
pub const MIN_BUFSPACE: usize = 8192;

const INITIAL_BUF: usize = MIN_BUFSPACE * 16;
const FLUSH_POLL_MS: u16 = 1000;

/// The connection died (or was already gone); the client has been torn down.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct ClientGone;

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum FlushStatus {
    /// Buffer fully drained.
    Drained,
    /// The socket stayed unwritable for the whole poll window; the unsent
    /// tail is kept for a later retry.
    Pending,
}

/// Buffered writer over the hijacked connection of a dump scan.
///
/// Writes never block while queue or entry locks are held: policies append to
/// the buffer and the worker flushes it only from safe points. The buffer
/// grows by doubling and `len` falls back to zero only on a full drain.
pub(crate) struct ScanClient {
    conn: Option<Box<dyn ScanConn>>,
    fd: RawFd,
    buf: Vec<u8>,
}

enum Outcome {
    Drained,
    Pending(usize),
    Dead,
}

impl ScanClient {
    pub fn open(conn: Box<dyn ScanConn>, fd: RawFd) -> Result<Self, TryReserveError> {
        let mut buf = Vec::new();
        if let Err(e) = buf.try_reserve_exact(INITIAL_BUF) {
            conn.close();
            return Err(e);
        }
        Ok(Self {
            conn: Some(conn),
            fd,
            buf,
        })
    }

    pub fn is_attached(&self) -> bool {
        self.conn.is_some()
    }

    pub fn space(&self) -> usize {
        self.buf.capacity() - self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Double the buffer. Fails without touching the connection; the caller
    /// decides whether the scan aborts.
    pub fn grow(&mut self) -> Result<(), TryReserveError> {
        // try_reserve_exact counts from len, so aim for twice the capacity
        let additional = self.buf.capacity() * 2 - self.buf.len();
        self.buf.try_reserve_exact(additional)
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Record-assembly access for policies building lines in place.
    pub fn buf_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }

    pub fn buf_len(&self) -> usize {
        self.buf.len()
    }

    /// Push the whole buffer out, polling up to a second for writability per
    /// round. A readable peer is a close signal, not data: the frontend owes
    /// us nothing while the connection is hijacked.
    pub fn flush(&mut self) -> Result<FlushStatus, ClientGone> {
        let outcome = {
            let Some(conn) = self.conn.as_mut() else {
                return Err(ClientGone);
            };
            if self.buf.is_empty() {
                return Ok(FlushStatus::Drained);
            }
            let mut sent = 0;
            loop {
                if sent >= self.buf.len() {
                    break Outcome::Drained;
                }
                let fd = unsafe { BorrowedFd::borrow_raw(self.fd) };
                let mut pfds = [PollFd::new(fd, PollFlags::POLLOUT)];
                let ready = match poll(&mut pfds, PollTimeout::from(FLUSH_POLL_MS)) {
                    Ok(n) => n,
                    Err(_) => break Outcome::Dead,
                };
                if ready == 0 {
                    break Outcome::Pending(sent);
                }
                let revents = pfds[0].revents().unwrap_or(PollFlags::empty());

                if revents.contains(PollFlags::POLLIN) {
                    let mut probe = [0u8; 1];
                    match conn.read(&mut probe) {
                        Ok(0) => break Outcome::Dead,
                        Err(e) if e.kind() != io::ErrorKind::WouldBlock => break Outcome::Dead,
                        _ => {}
                    }
                }

                if revents.intersects(PollFlags::POLLHUP | PollFlags::POLLERR) {
                    break Outcome::Dead;
                } else if revents.contains(PollFlags::POLLOUT) {
                    match conn.write(&self.buf[sent..]) {
                        Ok(0) => break Outcome::Dead,
                        Ok(n) => sent += n,
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                        Err(_) => break Outcome::Dead,
                    }
                }
            }
        };

        match outcome {
            Outcome::Drained => {
                self.buf.clear();
                Ok(FlushStatus::Drained)
            }
            Outcome::Pending(sent) => {
                // Keep only the unsent tail so a retry never re-emits bytes.
                self.buf.drain(..sent);
                Ok(FlushStatus::Pending)
            }
            Outcome::Dead => {
                warn!("crawl client connection lost, closing it");
                self.close();
                Err(ClientGone)
            }
        }
    }

    /// Tear the connection down from the crawler thread.
    pub fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            conn.close();
        }
        self.buf = Vec::new();
    }

    /// Hand the connection back to the worker fleet.
    pub fn release(&mut self) {
        if let Some(conn) = self.conn.take() {
            conn.redispatch();
        }
        self.buf = Vec::new();
    }
}
