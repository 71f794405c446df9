//! Lazy, resumable payload sources for the sequencer.
//!
//! A [`PayloadFeeder`] yields message content on demand instead of
//! materializing it up front; the built-in [`FileFeeder`] streams a file
//! from disk. Every feeder-backed send returns a [`FeederHandle`] that
//! can pause, resume or cancel the transfer from any thread and report
//! its progress.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;

/// A resumable source of message payload bytes.
///
/// The sequencer calls `fill` once per frame with a buffer sized to the
/// frame budget, then checks `is_finished`. `release` runs once the
/// transfer ends for any reason.
pub trait PayloadFeeder: Send + 'static {
    /// Total number of octets this feeder will produce, or `None` for
    /// an open-ended stream (terminated by the caller, e.g. by NUL).
    fn size(&mut self) -> Option<u64>;

    /// Copy up to `buf.len()` octets into `buf`, returning how many
    /// were written. Zero with `is_finished() == false` means "try
    /// again later".
    fn fill(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Whether the source is exhausted.
    fn is_finished(&self) -> bool;

    /// Drop resources held by the feeder (file descriptors, etc.).
    fn release(&mut self) {}
}

/// Streams a file from disk.
///
/// With `add_mime_head` the feeder prepends the blank-line MIME
/// separator, and the reported size grows by those two octets; use it
/// when the channel sends the feeder content as a whole message body.
pub struct FileFeeder {
    file: Option<File>,
    content_len: u64,
    content_read: u64,
    head: &'static [u8],
    head_sent: usize,
}

impl FileFeeder {
    pub fn open(path: impl AsRef<Path>, add_mime_head: bool) -> io::Result<FileFeeder> {
        let file = File::open(path)?;
        let content_len = file.metadata()?.len();
        Ok(FileFeeder {
            file: Some(file),
            content_len,
            content_read: 0,
            head: if add_mime_head { b"\r\n" } else { b"" },
            head_sent: 0,
        })
    }
}

impl PayloadFeeder for FileFeeder {
    fn size(&mut self) -> Option<u64> {
        Some(self.content_len + self.head.len() as u64)
    }

    fn fill(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut written = 0;
        while self.head_sent < self.head.len() && written < buf.len() {
            buf[written] = self.head[self.head_sent];
            self.head_sent += 1;
            written += 1;
        }
        if written < buf.len() {
            if let Some(file) = self.file.as_mut() {
                let n = file.read(&mut buf[written..])?;
                self.content_read += n as u64;
                written += n;
            }
        }
        Ok(written)
    }

    fn is_finished(&self) -> bool {
        self.head_sent == self.head.len() && self.content_read >= self.content_len
    }

    fn release(&mut self) {
        self.file = None;
    }
}

/// Progress report for a feeder transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FeederStatus {
    /// Payload octets handed to the sequencer so far.
    pub bytes_transferred: u64,
    /// Whether the transfer has completed (or was cancelled).
    pub is_finished: bool,
    /// Message number the transfer is bound to, once known.
    pub msgno: Option<u32>,
}

/// Cloneable control surface for one feeder transfer.
#[derive(Clone)]
pub struct FeederHandle {
    shared: Arc<FeederShared>,
}

pub(crate) struct FeederShared {
    paused: AtomicBool,
    cancelled: AtomicBool,
    close_transfer: AtomicBool,
    finished: AtomicBool,
    transferred: AtomicU64,
    msgno: Mutex<Option<u32>>,
    waker: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
    on_finished: Mutex<Option<Box<dyn FnOnce(FeederStatus) + Send>>>,
}

impl FeederHandle {
    pub(crate) fn new() -> FeederHandle {
        FeederHandle {
            shared: Arc::new(FeederShared {
                paused: AtomicBool::new(false),
                cancelled: AtomicBool::new(false),
                close_transfer: AtomicBool::new(false),
                finished: AtomicBool::new(false),
                transferred: AtomicU64::new(0),
                msgno: Mutex::new(None),
                waker: Mutex::new(None),
                on_finished: Mutex::new(None),
            }),
        }
    }

    /// Suspend the transfer after the frame currently being built. The
    /// message keeps its place and offset.
    pub fn pause(&self) {
        self.shared.paused.store(true, Ordering::Release);
    }

    /// Resume a paused transfer.
    pub fn resume(&self) {
        self.shared.paused.store(false, Ordering::Release);
        self.wake();
    }

    /// Abort the transfer. With `close_transfer` the sequencer emits
    /// the terminal frame of the exchange (NUL for an ANS series, an
    /// empty terminal frame otherwise) so the peer sees a well-formed
    /// message.
    pub fn cancel(&self, close_transfer: bool) {
        self.shared
            .close_transfer
            .store(close_transfer, Ordering::Release);
        self.shared.cancelled.store(true, Ordering::Release);
        self.wake();
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::Acquire)
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::Acquire)
    }

    pub fn status(&self) -> FeederStatus {
        FeederStatus {
            bytes_transferred: self.shared.transferred.load(Ordering::Acquire),
            is_finished: self.shared.finished.load(Ordering::Acquire),
            msgno: *self.shared.msgno.lock(),
        }
    }

    /// Install a completion callback, invoked exactly once when the
    /// transfer finishes or is cancelled. If it already has, the
    /// callback runs immediately.
    pub fn set_on_finished<F>(&self, f: F)
    where
        F: FnOnce(FeederStatus) + Send + 'static,
    {
        if self.shared.finished.load(Ordering::Acquire) {
            f(self.status());
            return;
        }
        let mut slot = self.shared.on_finished.lock();
        if self.shared.finished.load(Ordering::Acquire) {
            drop(slot);
            f(self.status());
        } else {
            *slot = Some(Box::new(f));
        }
    }

    pub(crate) fn should_close_on_cancel(&self) -> bool {
        self.shared.close_transfer.load(Ordering::Acquire)
    }

    pub(crate) fn bind(&self, msgno: u32, waker: Box<dyn Fn() + Send + Sync>) {
        *self.shared.msgno.lock() = Some(msgno);
        *self.shared.waker.lock() = Some(waker);
    }

    pub(crate) fn note_sent(&self, n: u64) {
        self.shared.transferred.fetch_add(n, Ordering::AcqRel);
    }

    /// Mark the transfer finished and run the completion callback, if
    /// it has not run yet.
    pub(crate) fn finish(&self) {
        if self.shared.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        let callback = self.shared.on_finished.lock().take();
        if let Some(callback) = callback {
            callback(self.status());
        }
    }

    fn wake(&self) {
        let waker = self.shared.waker.lock();
        if let Some(waker) = waker.as_ref() {
            waker();
        }
    }
}
