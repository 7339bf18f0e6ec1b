//! Periodic maintenance: freeing tossed resources and timing out locks.

use std::sync::{Arc, Weak};
use std::thread;

use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::Lockspace;

/// What one scan did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// Tossed resources freed
    pub freed: usize,
    /// Locks cancelled for timing out
    pub timeouts: usize,
}

impl Lockspace {
    /// Run the toss shrink and the timeout scan once.
    pub fn scan(&self) -> ScanReport {
        ScanReport {
            freed: self.scan_rsbs(),
            timeouts: self.scan_timeouts(),
        }
    }

    /// Free tossed resources older than the toss period. A resource this
    /// node mastered also loses its directory entry.
    pub fn scan_rsbs(&self) -> usize {
        let Some(_barrier) = self.barrier.try_read() else {
            return 0;
        };
        if self.locking_stopped() || self.is_aborted() {
            return 0;
        }

        let freed = self
            .rsbs
            .shrink(self.config.toss_period(), || !self.locking_stopped());
        for r in &freed {
            let mastered = r.lock().master.is_local();
            debug!(name = %r.name_lossy(), mastered, "freeing tossed resource");
            if mastered {
                self.dir_remove(r);
            }
        }
        self.stats.record_toss_free(freed.len() as u64);
        freed.len()
    }
}

enum ScanRequest {
    Kick,
    Shutdown,
}

/// Background thread calling [`Lockspace::scan`] every scan period.
///
/// The thread holds only a weak reference; it exits on its own once the
/// lockspace is dropped.
pub struct Scand {
    tx: Sender<ScanRequest>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Scand {
    /// Start scanning `lockspace`
    pub fn start(lockspace: &Arc<Lockspace>) -> Self {
        let (tx, rx) = unbounded();
        let target = Arc::downgrade(lockspace);
        let worker = thread::spawn(move || worker_loop(target, rx));
        Self {
            tx,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Scan now instead of waiting for the next period
    pub fn kick(&self) -> bool {
        self.tx.send(ScanRequest::Kick).is_ok()
    }

    /// Stop the thread and wait for it
    pub fn stop(&self) {
        if let Some(worker) = self.worker.lock().take() {
            let _ = self.tx.send(ScanRequest::Shutdown);
            let _ = worker.join();
        }
    }
}

impl Drop for Scand {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(target: Weak<Lockspace>, rx: Receiver<ScanRequest>) {
    loop {
        let period = match target.upgrade() {
            Some(ls) => ls.config().scan_period(),
            None => break,
        };
        match rx.recv_timeout(period) {
            Ok(ScanRequest::Kick) | Err(RecvTimeoutError::Timeout) => {}
            Ok(ScanRequest::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
        }
        let Some(ls) = target.upgrade() else {
            break;
        };
        let report = ls.scan();
        trace!(lockspace = %ls.name(), freed = report.freed, timeouts = report.timeouts, "scan");
    }
}
