//! Grant decisions and blocking notifications.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::flags::{LockFlags, SbFlags};
use crate::mode::LockMode;

use super::lkb::{Lkb, LkbState, LkbStatus};
use super::rsb::{Rsb, RsbInner};
use super::Lockspace;

/// Outcome of a grant check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Grantable {
    Yes,
    No,
    /// Not grantable because of an in-place conversion deadlock
    Deadlock,
}

impl Grantable {
    #[inline]
    pub(crate) fn yes(self) -> bool {
        self == Grantable::Yes
    }
}

fn queue_conflict(queue: &[Arc<Lkb>], lkb: &Arc<Lkb>, rqmode: LockMode) -> bool {
    queue
        .iter()
        .filter(|other| !Arc::ptr_eq(other, lkb))
        .any(|other| !other.state().grmode.compatible(rqmode))
}

fn first_in(queue: &[Arc<Lkb>], lkb: &Arc<Lkb>) -> bool {
    queue.first().is_some_and(|first| Arc::ptr_eq(first, lkb))
}

/// Two conversions deadlock when each one's requested mode conflicts with
/// the other's granted mode.
fn conversion_deadlock(ri: &RsbInner, lkb: &Arc<Lkb>, grmode: LockMode, rqmode: LockMode) -> bool {
    ri.convert
        .iter()
        .filter(|other| !Arc::ptr_eq(other, lkb))
        .any(|other| {
            let o = other.state();
            !o.grmode.compatible(rqmode) && !grmode.compatible(o.rqmode)
        })
}

/// Whether a holder at `gr` should hear about a request at `rqmode`.
///
/// PR and CW conflict but do not order, so a holder of one always hears
/// about the other unless it was already told about EX.
fn modes_require_bast(gr: &LkbState, rqmode: LockMode) -> bool {
    if LockMode::is_middle_conversion(gr.grmode, rqmode) {
        return gr.highbast < LockMode::Ex;
    }
    gr.highbast < rqmode && !gr.grmode.compatible(rqmode)
}

/// Whether a holder should hear about the highest blocked mode `high`
fn lock_requires_bast(gr: &LkbState, high: LockMode, cw: bool) -> bool {
    if gr.grmode == LockMode::Pr && cw {
        return true;
    }
    gr.highbast < high && !gr.grmode.compatible(high)
}

impl Lockspace {
    /// The grant rules without alternate modes or demotion.
    fn can_be_granted_inner(&self, ri: &RsbInner, lkb: &Arc<Lkb>, now: bool, recover: bool) -> bool {
        let (grmode, rqmode, exflags) = {
            let st = lkb.state();
            (st.grmode, st.rqmode, st.exflags)
        };
        let conv = grmode != LockMode::Iv;

        // An NL request never conflicts; skip the queue checks.
        if !conv && rqmode == LockMode::Nl && exflags.contains(LockFlags::EXPEDITE) {
            return true;
        }

        if queue_conflict(&ri.grant, lkb, rqmode) {
            return false;
        }
        if queue_conflict(&ri.convert, lkb, rqmode) {
            return false;
        }

        // Conversions that fit with the holders are granted in place.
        if now && conv && !exflags.contains(LockFlags::QUECVT) {
            return true;
        }

        // Queue order was lost when recovery rebuilt the queues.
        if conv && recover {
            return true;
        }

        if exflags.contains(LockFlags::NOORDER) {
            return true;
        }

        if !now && conv && first_in(&ri.convert, lkb) {
            return true;
        }

        if now && !conv && ri.convert.is_empty() && ri.wait.is_empty() {
            return true;
        }

        if !now && !conv && ri.convert.is_empty() && first_in(&ri.wait, lkb) {
            return true;
        }

        false
    }

    /// Decide whether `lkb` can be granted now.
    ///
    /// A conversion caught in an in-place deadlock is demoted to NL when it
    /// carries CONVDEADLK (and reported as not grantable); otherwise the
    /// deadlock is reported. ALTPR/ALTCW retry at the alternate mode.
    pub(crate) fn can_be_granted(
        &self,
        ri: &RsbInner,
        lkb: &Arc<Lkb>,
        now: bool,
        recover: bool,
    ) -> Grantable {
        if self.can_be_granted_inner(ri, lkb, now, recover) {
            return Grantable::Yes;
        }

        let (grmode, rqmode, exflags, queueable) = {
            let st = lkb.state();
            (st.grmode, st.rqmode, st.exflags, st.can_be_queued())
        };

        if grmode != LockMode::Iv && queueable && conversion_deadlock(ri, lkb, grmode, rqmode) {
            if exflags.contains(LockFlags::CONVDEADLK) {
                let mut st = lkb.state();
                st.grmode = LockMode::Nl;
                st.sbflags.insert(SbFlags::DEMOTED);
                debug!(lkid = lkb.id, from = %grmode, "demoted to break a conversion deadlock");
                return Grantable::No;
            }
            return Grantable::Deadlock;
        }

        let alt = if rqmode != LockMode::Pr && exflags.contains(LockFlags::ALTPR) {
            LockMode::Pr
        } else if rqmode != LockMode::Cw && exflags.contains(LockFlags::ALTCW) {
            LockMode::Cw
        } else {
            return Grantable::No;
        };

        lkb.state().rqmode = alt;
        if self.can_be_granted_inner(ri, lkb, now, recover) {
            lkb.state().sbflags.insert(SbFlags::ALTMODE);
            Grantable::Yes
        } else {
            lkb.state().rqmode = rqmode;
            Grantable::No
        }
    }

    /// Grant whatever conversions became grantable. Returns the highest
    /// mode still blocked on the convert queue (or `high`).
    fn grant_pending_convert(
        &self,
        r: &Rsb,
        ri: &mut RsbInner,
        high: LockMode,
        cw: &mut bool,
        count: &mut u32,
        recover: bool,
    ) -> LockMode {
        let mut quit = false;
        loop {
            let mut hi = LockMode::Iv;
            let mut grant_restart = false;
            let mut demote_restart = false;

            for lkb in ri.convert.clone() {
                if lkb.state().status != LkbStatus::Convert {
                    continue;
                }
                let demoted = lkb.state().is_demoted();

                match self.can_be_granted(ri, &lkb, false, recover) {
                    Grantable::Yes => {
                        self.grant_lock_pending(r, ri, &lkb);
                        grant_restart = true;
                        *count += 1;
                        continue;
                    }
                    Grantable::No if !demoted && lkb.state().is_demoted() => {
                        debug!(lkid = lkb.id, "demoted while re-driving conversions");
                        demote_restart = true;
                        continue;
                    }
                    Grantable::Deadlock => {
                        let mut st = lkb.state();
                        if st.exflags.contains(LockFlags::NODLCKWT) {
                            if st.highbast < st.rqmode {
                                let mode = st.rqmode;
                                st.highbast = mode;
                                drop(st);
                                self.queue_bast(r, &lkb, mode);
                            }
                        } else {
                            warn!(lkid = lkb.id, grmode = %st.grmode, rqmode = %st.rqmode, "pending conversion deadlock");
                        }
                        continue;
                    }
                    Grantable::No => {}
                }

                let st = lkb.state();
                hi = hi.max(st.rqmode);
                if st.rqmode == LockMode::Cw {
                    *cw = true;
                }
            }

            if grant_restart {
                continue;
            }
            if demote_restart && !quit {
                quit = true;
                continue;
            }
            return high.max(hi);
        }
    }

    /// Re-drive only the convert queue
    pub(crate) fn grant_pending_converts(&self, r: &Rsb, ri: &mut RsbInner) {
        let mut cw = false;
        let mut count = 0;
        self.grant_pending_convert(r, ri, LockMode::Iv, &mut cw, &mut count, false);
    }

    fn grant_pending_wait(
        &self,
        r: &Rsb,
        ri: &mut RsbInner,
        high: LockMode,
        cw: &mut bool,
        count: &mut u32,
    ) -> LockMode {
        let mut high = high;
        for lkb in ri.wait.clone() {
            if lkb.state().status != LkbStatus::Waiting {
                continue;
            }
            if self.can_be_granted(ri, &lkb, false, false).yes() {
                self.grant_lock_pending(r, ri, &lkb);
                *count += 1;
            } else {
                let st = lkb.state();
                high = high.max(st.rqmode);
                if st.rqmode == LockMode::Cw {
                    *cw = true;
                }
            }
        }
        high
    }

    /// Re-drive the convert and wait queues after a change, then notify the
    /// holders that block what is left. Returns the number of grants.
    pub(crate) fn grant_pending_locks(&self, r: &Rsb, ri: &mut RsbInner, recover: bool) -> u32 {
        if !ri.master.is_local() {
            self.abort("grant_pending_locks on a resource mastered elsewhere", 0);
            return 0;
        }
        let mut cw = false;
        let mut count = 0;
        let high = self.grant_pending_convert(r, ri, LockMode::Iv, &mut cw, &mut count, recover);
        let high = self.grant_pending_wait(r, ri, high, &mut cw, &mut count);
        if high == LockMode::Iv {
            return count;
        }

        for gr in ri.grant.clone() {
            let mut st = gr.state();
            if !st.has_bast() || !lock_requires_bast(&st, high, cw) {
                continue;
            }
            let mode = if cw && high == LockMode::Pr && st.grmode == LockMode::Pr {
                LockMode::Cw
            } else {
                high
            };
            st.highbast = high;
            drop(st);
            self.queue_bast(r, &gr, mode);
        }
        count
    }

    fn send_bast_queue(&self, r: &Rsb, queue: &[Arc<Lkb>], lkb: &Arc<Lkb>) {
        let rqmode = lkb.state().rqmode;
        for gr in queue {
            if Arc::ptr_eq(gr, lkb) {
                continue;
            }
            let mut st = gr.state();
            if st.has_bast() && modes_require_bast(&st, rqmode) {
                st.highbast = rqmode;
                drop(st);
                self.queue_bast(r, gr, rqmode);
            }
        }
    }

    /// Notify the holders that block a freshly queued `lkb`
    pub(crate) fn send_blocking_asts(&self, r: &Rsb, ri: &RsbInner, lkb: &Arc<Lkb>) {
        self.send_bast_queue(r, &ri.grant, lkb);
    }

    /// Also notify conflicting conversions (for NOQUEUEBAST failures)
    pub(crate) fn send_blocking_asts_all(&self, r: &Rsb, ri: &RsbInner, lkb: &Arc<Lkb>) {
        self.send_bast_queue(r, &ri.grant, lkb);
        self.send_bast_queue(r, &ri.convert, lkb);
    }
}
