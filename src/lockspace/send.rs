//! Outbound messages.

use std::sync::Arc;

use tracing::debug;

use crate::cluster::NodeId;
use crate::flags::LockFlags;
use crate::mode::LockMode;
use crate::status::Status;
use crate::wire::{LockFields, Message, MsgType};

use super::lkb::{Lkb, LkbState};
use super::receive::Origin;
use super::rsb::{Rsb, RsbInner};
use super::waiters::WaitOp;
use super::Lockspace;

fn lvb_of(st: &LkbState) -> Option<Vec<u8>> {
    if st.exflags.contains(LockFlags::VALBLK) {
        st.lvb.clone()
    } else {
        None
    }
}

impl Lockspace {
    /// Register `op` as waiting on the master, then send it. On failure the
    /// registration is undone.
    fn send_common(&self, r: &Rsb, ri: &RsbInner, lkb: &Arc<Lkb>, op: WaitOp) -> Status {
        let Some(to) = ri.master.remote() else {
            self.abort("sending to a resource that is not remote", lkb.id);
            return Status::Aborted;
        };
        let rv = self.add_to_waiters(lkb, op, to);
        if rv != Status::Ok {
            return rv;
        }

        let message = {
            let st = lkb.state();
            let lock = st.fields(lkb.id, r.hash);
            match op {
                WaitOp::Request => Message::Request {
                    lock,
                    name: r.name.to_vec(),
                },
                WaitOp::Lookup => Message::Lookup {
                    lock,
                    name: r.name.to_vec(),
                },
                WaitOp::Convert => Message::Convert {
                    lock,
                    lvb: lvb_of(&st),
                },
                WaitOp::Unlock => Message::Unlock {
                    lock,
                    lvb: lvb_of(&st),
                },
                WaitOp::Cancel => Message::Cancel { lock },
            }
        };

        let rv = self.send_message(to, message);
        if rv != Status::Ok {
            let _ = self.remove_from_waiters(lkb, op.reply_type(), rv);
        }
        rv
    }

    pub(crate) fn send_request(&self, r: &Rsb, ri: &mut RsbInner, lkb: &Arc<Lkb>) -> Status {
        self.stats.record_remote_request();
        let rv = self.send_common(r, ri, lkb, WaitOp::Request);
        if rv != Status::Ok {
            self.queue_cast(lkb, Status::Again);
            self.confirm_master(r, ri, Status::Again);
            return Status::Again;
        }
        rv
    }

    pub(crate) fn send_convert(&self, r: &Rsb, ri: &mut RsbInner, lkb: &Arc<Lkb>) -> Status {
        let rv = self.send_common(r, ri, lkb, WaitOp::Convert);
        if rv != Status::Ok {
            self.revert_lock(ri, lkb);
            self.queue_cast(lkb, Status::Again);
            return Status::Again;
        }

        // Down-conversions always succeed; the master sends no reply and the
        // grant is mirrored right away.
        if lkb.state().is_down_conversion() {
            if self
                .remove_from_waiters(lkb, MsgType::ConvertReply, Status::Ok)
                .is_ok()
            {
                self.apply_convert_reply(ri, lkb, Origin::Stub, None, Status::Ok, None);
            }
        }
        rv
    }

    pub(crate) fn send_unlock(&self, r: &Rsb, ri: &mut RsbInner, lkb: &Arc<Lkb>) -> Status {
        self.send_common(r, ri, lkb, WaitOp::Unlock)
    }

    pub(crate) fn send_cancel(&self, r: &Rsb, ri: &mut RsbInner, lkb: &Arc<Lkb>) -> Status {
        self.send_common(r, ri, lkb, WaitOp::Cancel)
    }

    /// Ask the directory node for the master of `r`
    pub(crate) fn send_lookup(&self, r: &Rsb, lkb: &Arc<Lkb>, to: NodeId) -> Status {
        self.stats.record_lookup();
        let rv = self.add_to_waiters(lkb, WaitOp::Lookup, to);
        if rv != Status::Ok {
            return rv;
        }
        let lock = lkb.state().fields(lkb.id, r.hash);
        let rv = self.send_message(
            to,
            Message::Lookup {
                lock,
                name: r.name.to_vec(),
            },
        );
        if rv != Status::Ok {
            let _ = self.remove_from_waiters(lkb, MsgType::LookupReply, rv);
            self.queue_cast(lkb, Status::Again);
            return Status::Again;
        }
        debug!(lkid = lkb.id, to, name = %r.name_lossy(), "lookup sent");
        rv
    }

    // ============ Master to owner ============

    fn owner_of(&self, lkb: &Arc<Lkb>, r: &Rsb) -> Option<(NodeId, LockFields, Option<Vec<u8>>)> {
        let st = lkb.state();
        let to = st.nodeid.remote()?;
        Some((to, st.fields(lkb.id, r.hash), st.lvb.clone()))
    }

    pub(crate) fn send_grant(&self, r: &Rsb, lkb: &Arc<Lkb>) {
        if let Some((to, lock, lvb)) = self.owner_of(lkb, r) {
            self.send_message(to, Message::Grant { lock, lvb });
        }
    }

    pub(crate) fn send_bast(&self, r: &Rsb, lkb: &Arc<Lkb>, mode: LockMode) {
        if let Some((to, lock, _)) = self.owner_of(lkb, r) {
            self.send_message(to, Message::Bast { lock, mode });
        }
    }

    pub(crate) fn send_request_reply(&self, r: &Rsb, lkb: &Arc<Lkb>, result: Status) {
        if let Some((to, lock, lvb)) = self.owner_of(lkb, r) {
            self.send_message(to, Message::RequestReply { lock, result, lvb });
        }
    }

    pub(crate) fn send_convert_reply(&self, r: &Rsb, lkb: &Arc<Lkb>, result: Status) {
        if let Some((to, lock, lvb)) = self.owner_of(lkb, r) {
            self.send_message(to, Message::ConvertReply { lock, result, lvb });
        }
    }

    pub(crate) fn send_unlock_reply(&self, r: &Rsb, lkb: &Arc<Lkb>, result: Status) {
        if let Some((to, lock, _)) = self.owner_of(lkb, r) {
            self.send_message(to, Message::UnlockReply { lock, result });
        }
    }

    pub(crate) fn send_cancel_reply(&self, r: &Rsb, lkb: &Arc<Lkb>, result: Status) {
        if let Some((to, lock, _)) = self.owner_of(lkb, r) {
            self.send_message(to, Message::CancelReply { lock, result });
        }
    }

    /// Reply to an operation for which no master copy exists (or could be
    /// created). `remid` is the sender's lock id.
    pub(crate) fn send_fail_reply(&self, to: NodeId, reply: MsgType, remid: u32, result: Status) {
        debug!(to, ?reply, remid, %result, "failure reply");
        let lock = LockFields {
            remid,
            ..LockFields::default()
        };
        let message = match reply {
            MsgType::RequestReply => Message::RequestReply {
                lock,
                result,
                lvb: None,
            },
            MsgType::ConvertReply => Message::ConvertReply {
                lock,
                result,
                lvb: None,
            },
            MsgType::UnlockReply => Message::UnlockReply { lock, result },
            MsgType::CancelReply => Message::CancelReply { lock, result },
            other => {
                debug!(?other, "no failure reply for message type");
                return;
            }
        };
        self.send_message(to, message);
    }

    pub(crate) fn send_lookup_reply(&self, to: NodeId, lkid: u32, master: NodeId, result: Status) {
        self.send_message(
            to,
            Message::LookupReply {
                lkid,
                master,
                result,
            },
        );
    }

    pub(crate) fn send_remove(&self, to: NodeId, r: &Rsb) {
        debug!(to, name = %r.name_lossy(), "directory remove");
        self.send_message(
            to,
            Message::Remove {
                hash: r.hash,
                name: r.name.to_vec(),
            },
        );
    }

    pub(crate) fn send_purge(&self, to: NodeId, pid: u32) -> Status {
        self.send_message(
            to,
            Message::Purge {
                nodeid: to,
                pid,
            },
        )
    }
}
