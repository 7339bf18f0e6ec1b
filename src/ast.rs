//! Asynchronous delivery of completions and blocking notifications.
//!
//! The lockspace never runs caller callbacks itself. It builds an [`Ast`]
//! and hands it to an [`AstSink`]; the sink decides when and on which thread
//! the callback runs. [`AstQueue`] is the standard sink: a FIFO channel that
//! is drained either by an explicit [`AstQueue::deliver_pending`] call or by
//! a worker thread.

use std::fmt;
use std::sync::Arc;
use std::thread;

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::flags::SbFlags;
use crate::mode::LockMode;
use crate::status::Status;

/// Completion callback. Receives the status block after it was updated.
pub type CompletionFn = Arc<dyn Fn(&Lksb) + Send + Sync>;

/// Blocking callback. Receives the mode another request is blocked at.
pub type BlockingFn = Arc<dyn Fn(LockMode) + Send + Sync>;

#[derive(Debug, Default)]
struct LksbInner {
    status: Status,
    lkid: u32,
    flags: SbFlags,
    lvb: Option<Vec<u8>>,
}

/// Lock status block: the caller's view of one lock.
///
/// The lock id is filled in as soon as `lock` accepts a new request; status,
/// flags and the LVB are written when a completion is delivered.
#[derive(Debug, Default)]
pub struct Lksb {
    inner: Mutex<LksbInner>,
}

impl Lksb {
    /// Status block without a value block
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Status block with a zeroed value block of `len` bytes
    pub fn with_lvb(len: usize) -> Arc<Self> {
        let lksb = Self::default();
        lksb.inner.lock().lvb = Some(vec![0; len]);
        Arc::new(lksb)
    }

    /// Status of the last delivered completion
    pub fn status(&self) -> Status {
        self.inner.lock().status
    }

    /// Lock id (zero until a request is accepted)
    pub fn lock_id(&self) -> u32 {
        self.inner.lock().lkid
    }

    /// Flags of the last delivered completion
    pub fn flags(&self) -> SbFlags {
        self.inner.lock().flags
    }

    /// Copy of the value block, if the status block has one
    pub fn lvb(&self) -> Option<Vec<u8>> {
        self.inner.lock().lvb.clone()
    }

    /// Whether the status block carries a value block
    pub fn has_lvb(&self) -> bool {
        self.inner.lock().lvb.is_some()
    }

    /// Overwrite the start of the value block with `data`.
    ///
    /// Returns false if the status block has no value block.
    pub fn set_lvb(&self, data: &[u8]) -> bool {
        let mut inner = self.inner.lock();
        match inner.lvb.as_mut() {
            Some(lvb) => {
                let n = data.len().min(lvb.len());
                lvb[..n].copy_from_slice(&data[..n]);
                true
            }
            None => false,
        }
    }

    pub(crate) fn set_lock_id(&self, lkid: u32) {
        self.inner.lock().lkid = lkid;
    }

    fn complete(&self, status: Status, flags: SbFlags, lvb: Option<&[u8]>) {
        let mut inner = self.inner.lock();
        inner.status = status;
        inner.flags = flags;
        if let (Some(dst), Some(src)) = (inner.lvb.as_mut(), lvb) {
            let n = src.len().min(dst.len());
            dst[..n].copy_from_slice(&src[..n]);
        }
    }
}

/// One queued callback invocation.
pub enum Ast {
    /// Final result of an operation
    Completion {
        /// Status block to update
        lksb: Arc<Lksb>,
        /// Result
        status: Status,
        /// Completion flags
        flags: SbFlags,
        /// Value block to copy into the status block
        lvb: Option<Vec<u8>>,
        /// Caller callback
        callback: CompletionFn,
    },
    /// Another request is blocked behind this lock
    Blocking {
        /// Mode of the blocked request
        mode: LockMode,
        /// Caller callback
        callback: BlockingFn,
    },
}

impl Ast {
    /// Update the status block (for completions) and run the callback
    pub fn deliver(self) {
        match self {
            Ast::Completion {
                lksb,
                status,
                flags,
                lvb,
                callback,
            } => {
                lksb.complete(status, flags, lvb.as_deref());
                callback(&lksb);
            }
            Ast::Blocking { mode, callback } => callback(mode),
        }
    }
}

impl fmt::Debug for Ast {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ast::Completion { status, flags, .. } => f
                .debug_struct("Completion")
                .field("status", status)
                .field("flags", flags)
                .finish(),
            Ast::Blocking { mode, .. } => f.debug_struct("Blocking").field("mode", mode).finish(),
        }
    }
}

/// Destination for queued callbacks.
pub trait AstSink: Send + Sync {
    /// Queue `ast` for delivery. Must not run the callback inline.
    fn enqueue(&self, ast: Ast);
}

enum AstRequest {
    Deliver(Ast),
    Shutdown,
}

/// FIFO callback queue with optional worker thread.
pub struct AstQueue {
    tx: Sender<AstRequest>,
    rx: Receiver<AstRequest>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl AstQueue {
    /// Create an empty queue with no worker
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self {
            tx,
            rx,
            worker: Mutex::new(None),
        }
    }

    /// Number of queued callbacks
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Run every queued callback on the calling thread; returns how many ran
    pub fn deliver_pending(&self) -> usize {
        let mut delivered = 0;
        while let Ok(req) = self.rx.try_recv() {
            if let AstRequest::Deliver(ast) = req {
                ast.deliver();
                delivered += 1;
            }
        }
        delivered
    }

    /// Start a thread that runs callbacks as they are queued
    pub fn start_worker(&self) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }
        let rx = self.rx.clone();
        *worker = Some(thread::spawn(move || worker_loop(rx)));
    }

    /// Stop the worker thread, if any, after it drained the queue
    pub fn stop(&self) {
        if let Some(worker) = self.worker.lock().take() {
            let _ = self.tx.send(AstRequest::Shutdown);
            let _ = worker.join();
        }
    }
}

impl Default for AstQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AstQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

impl AstSink for AstQueue {
    fn enqueue(&self, ast: Ast) {
        if self.tx.send(AstRequest::Deliver(ast)).is_err() {
            tracing::warn!("ast queue closed, dropping callback");
        }
    }
}

fn worker_loop(rx: Receiver<AstRequest>) {
    while let Ok(req) = rx.recv() {
        match req {
            AstRequest::Deliver(ast) => ast.deliver(),
            AstRequest::Shutdown => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_updates_lksb_before_callback() {
        let queue = AstQueue::new();
        let lksb = Lksb::with_lvb(8);
        let seen = Arc::new(Mutex::new(None));
        let seen2 = Arc::clone(&seen);

        queue.enqueue(Ast::Completion {
            lksb: Arc::clone(&lksb),
            status: Status::Ok,
            flags: SbFlags::VALNOTVALID,
            lvb: Some(vec![1, 2, 3, 4, 5, 6, 7, 8]),
            callback: Arc::new(move |sb: &Lksb| {
                *seen2.lock() = Some((sb.status(), sb.lvb()));
            }),
        });
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.deliver_pending(), 1);

        let (status, lvb) = seen.lock().clone().unwrap();
        assert_eq!(status, Status::Ok);
        assert_eq!(lvb.unwrap(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(lksb.flags(), SbFlags::VALNOTVALID);
    }

    #[test]
    fn test_worker_delivers_in_order() {
        let queue = AstQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        queue.start_worker();
        for mode in [LockMode::Pr, LockMode::Ex] {
            let order = Arc::clone(&order);
            queue.enqueue(Ast::Blocking {
                mode,
                callback: Arc::new(move |m| order.lock().push(m)),
            });
        }
        queue.stop();
        assert_eq!(*order.lock(), vec![LockMode::Pr, LockMode::Ex]);
    }

    #[test]
    fn test_set_lvb_without_buffer() {
        let lksb = Lksb::new();
        assert!(!lksb.set_lvb(&[1]));
        assert!(!lksb.has_lvb());
        assert_eq!(lksb.lock_id(), 0);
    }
}
