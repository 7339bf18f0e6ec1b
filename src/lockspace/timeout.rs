//! Lock timeouts and the timewarn watchdog.
//!
//! A lock is tracked from the moment it is queued behind a conflict until
//! its next completion. Entries hold a lock reference.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::flags::{LkbFlags, LockFlags};

use super::lkb::{Lkb, LkbStatus};
use super::Lockspace;

pub(crate) struct TimeoutEntry {
    lkb: Arc<Lkb>,
    since: Instant,
    /// Cancel once the lock waited this long
    timeout: Option<Duration>,
    /// Still owes a timewarn warning
    warn: bool,
}

impl TimeoutEntry {
    fn is_spent(&self) -> bool {
        self.timeout.is_none() && !self.warn
    }
}

impl Lockspace {
    /// Start tracking a lock that was just queued.
    pub(crate) fn add_timeout(&self, lkb: &Arc<Lkb>) {
        let (timeout, warn) = {
            let st = lkb.state();
            if st.is_master_copy() {
                return;
            }
            let warn =
                self.config.timewarn().is_some() && !st.exflags.contains(LockFlags::NODLCKWT);
            let timeout = (st.exflags.contains(LockFlags::TIMEOUT) && st.timeout_cs > 0)
                .then(|| Duration::from_millis(st.timeout_cs.saturating_mul(10)));
            (timeout, warn)
        };
        if timeout.is_none() && !warn {
            return;
        }

        let mut timeouts = self.timeouts.lock();
        if timeouts.iter().any(|e| Arc::ptr_eq(&e.lkb, lkb)) {
            debug!(lkid = lkb.id, "timeout already armed");
            return;
        }
        lkb.hold();
        timeouts.push(TimeoutEntry {
            lkb: Arc::clone(lkb),
            since: Instant::now(),
            timeout,
            warn,
        });
    }

    /// Stop tracking `lkb`. Takes only the timeouts mutex.
    pub(crate) fn del_timeout(&self, lkb: &Arc<Lkb>) {
        let removed = {
            let mut timeouts = self.timeouts.lock();
            match timeouts.iter().position(|e| Arc::ptr_eq(&e.lkb, lkb)) {
                Some(pos) => Some(timeouts.remove(pos)),
                None => None,
            }
        };
        if removed.is_some() {
            self.unhold_lkb(lkb);
        }
    }

    /// Number of locks being timed
    pub fn timeout_count(&self) -> usize {
        self.timeouts.lock().len()
    }

    /// Cancel the locks that waited past their timeout and warn about those
    /// past the timewarn threshold. Returns the number of cancels issued.
    ///
    /// Skipped while recovery runs.
    pub fn scan_timeouts(&self) -> usize {
        let Some(_barrier) = self.barrier.try_read() else {
            return 0;
        };
        if self.locking_stopped() || self.is_aborted() {
            return 0;
        }

        let now = Instant::now();
        let timewarn = self.config.timewarn();
        let mut expired = Vec::new();
        let mut spent = Vec::new();
        {
            let mut timeouts = self.timeouts.lock();
            for entry in timeouts.iter_mut() {
                let waited = now.saturating_duration_since(entry.since);
                if entry.warn && timewarn.is_some_and(|w| waited >= w) {
                    entry.warn = false;
                    warn!(
                        lockspace = %self.name,
                        lkid = format_args!("{:08x}", entry.lkb.id),
                        waited_ms = waited.as_millis() as u64,
                        "lock waited past timewarn"
                    );
                    self.stats.record_timewarn();
                }
                if entry.timeout.is_some_and(|t| waited >= t) {
                    entry.timeout = None;
                    entry.warn = false;
                    expired.push(Arc::clone(&entry.lkb));
                }
            }
            timeouts.retain(|entry| {
                if entry.is_spent() {
                    spent.push(Arc::clone(&entry.lkb));
                    false
                } else {
                    true
                }
            });
        }

        // expired locks keep the entry's reference until their cancel ran
        for lkb in &spent {
            if !expired.iter().any(|e| Arc::ptr_eq(e, lkb)) {
                self.unhold_lkb(lkb);
            }
        }

        let mut cancelled = 0;
        for lkb in expired {
            if self.timeout_cancel(&lkb) {
                cancelled += 1;
            }
            self.put_lkb(&lkb);
        }
        cancelled
    }

    fn timeout_cancel(&self, lkb: &Arc<Lkb>) -> bool {
        let Some(r) = lkb.resource() else {
            return false;
        };
        r.hold();
        let issued = {
            let mut ri = r.lock();
            let queued = {
                let mut st = lkb.state();
                let queued = matches!(st.status, LkbStatus::Convert | LkbStatus::Waiting)
                    && st.wait.op().is_none()
                    && !st.wait.is_overlap()
                    && !st.flags.contains(LkbFlags::ENDOFLIFE);
                if queued {
                    st.flags.insert(LkbFlags::TIMEOUT_CANCEL);
                }
                queued
            };
            if queued {
                debug!(lkid = lkb.id, name = %r.name_lossy(), "timeout cancel");
                self.stats.record_timeout();
                self.start_cancel(&r, &mut ri, lkb);
            }
            queued
        };
        self.rsbs.put(&r);
        issued
    }

    /// Shift every timestamp forward by `by`, so the time recovery held the
    /// lockspace does not count as waiting.
    pub(crate) fn adjust_timeouts(&self, by: Duration) {
        for entry in self.timeouts.lock().iter_mut() {
            entry.since += by;
        }
    }
}
