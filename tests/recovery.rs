//! Recovery after a node leaves the cluster.

mod common;

use common::{granted, test_config, Cluster, Caller, LS_ID};
use oxidlm::{Frame, LkbStatus, LockFlags, LockMode, Message, MsgType, Status, StubReply};

const RES: &[u8] = b"journal-3";

/// Three nodes where node 3 masters `RES` through a lock of `mode`
fn mastered_on_3(mode: LockMode) -> (Cluster, Caller) {
    let c = Cluster::new(3);
    let holder = granted(&c, 3, RES, mode);
    assert_eq!(c.master_of(RES), Some(3));
    (c, holder)
}

// ============ Master Departure Tests ============

#[test]
fn test_granted_locks_move_to_new_master() {
    let (mut c, _holder) = mastered_on_3(LockMode::Nl);
    let a = granted(&c, 1, RES, LockMode::Pr);
    let b = granted(&c, 2, RES, LockMode::Pr);

    c.fail(3);
    assert_eq!(c.master_of(RES), None);
    let reports = c.recover();
    c.pump();

    // lowest id recovers first and claims the directory entry
    assert_eq!(c.master_of(RES), Some(1));
    assert_eq!(reports[&1].masters_reset, 1);
    assert_eq!(reports[&1].adopted, 1);
    assert_eq!(reports[&2].masters_reset, 1);
    assert_eq!(reports[&2].adopted, 0);

    let a_info = c.ls(1).lock_info(a.lkid()).unwrap();
    assert_eq!(a_info.nodeid, 1);
    assert_eq!(a_info.status, LkbStatus::Granted);
    assert!(c.ls(1).resource_info(RES).unwrap().master.is_local());
    assert_eq!(c.ls(2).lock_info(b.lkid()).unwrap().nodeid, 1);
    assert_eq!(a.completions(), vec![Status::Ok]);
}

#[test]
fn test_waiting_request_granted_by_adopting_node() {
    let (mut c, _holder) = mastered_on_3(LockMode::Ex);
    let p = Caller::new();
    p.lock(c.ls(1), RES, LockMode::Pr, LockFlags::empty());
    c.pump();
    assert_eq!(c.ls(1).lock_info(p.lkid()).unwrap().status, LkbStatus::Waiting);

    c.fail(3);
    let reports = c.recover();
    c.pump();

    assert_eq!(reports[&1].adopted, 1);
    assert_eq!(p.completions(), vec![Status::Ok]);
    assert_eq!(c.ls(1).lock_info(p.lkid()).unwrap().grmode, LockMode::Pr);
}

#[test]
fn test_request_in_flight_is_resent() {
    let (mut c, _holder) = mastered_on_3(LockMode::Nl);
    let anchor = granted(&c, 1, RES, LockMode::Nl);

    let p = Caller::new();
    assert_eq!(p.lock(c.ls(1), RES, LockMode::Cw, LockFlags::empty()), Status::InProgress);
    assert_eq!(c.ls(1).waiter_count(), 1);

    c.fail(3);
    let reports = c.recover();
    c.pump();

    assert_eq!(reports[&1].resent, vec![p.lkid()]);
    assert_eq!(p.completions(), vec![Status::Ok]);
    assert_eq!(anchor.completions(), vec![Status::Ok]);
    assert_eq!(c.ls(1).waiter_count(), 0);
    assert_eq!(c.ls(1).stats().resends, 1);
}

#[test]
fn test_middle_conversion_granted_once_by_adopting_node() {
    let (mut c, _holder) = mastered_on_3(LockMode::Nl);
    let p = granted(&c, 1, RES, LockMode::Pr);
    // PR to CW is neither up nor down; the conversion is lost with node 3
    assert_eq!(p.convert_on(c.ls(1), LockMode::Cw, LockFlags::empty()), Status::InProgress);
    assert_eq!(c.ls(1).waiter_count(), 1);

    c.fail(3);
    let reports = c.recover();
    c.pump();

    assert_eq!(
        reports[&1].stubs,
        vec![StubReply {
            lkid: p.lkid(),
            reply: MsgType::ConvertReply,
            result: Status::InProgress,
        }]
    );
    assert_eq!(reports[&1].adopted, 1);
    // the regrant pass already finished the conversion
    assert!(reports[&1].resent.is_empty());
    assert_eq!(c.ls(1).stats().resends, 0);

    assert_eq!(p.completions(), vec![Status::Ok, Status::Ok]);
    let info = c.ls(1).lock_info(p.lkid()).unwrap();
    assert_eq!(info.status, LkbStatus::Granted);
    assert_eq!(info.grmode, LockMode::Cw);
    assert_eq!(info.rqmode, LockMode::Iv);
    assert_eq!(c.ls(1).waiter_count(), 0);
    assert_eq!(
        c.ls(1).resource_info(RES).unwrap().granted,
        vec![(p.lkid(), LockMode::Cw)]
    );
}

// ============ Stub Reply Tests ============

#[test]
fn test_unlock_in_flight_gets_stub_reply() {
    let (mut c, _holder) = mastered_on_3(LockMode::Nl);
    let p = granted(&c, 1, RES, LockMode::Pw);
    assert_eq!(p.unlock(c.ls(1), LockFlags::empty()), Status::Ok);

    c.fail(3);
    let reports = c.recover();
    c.pump();

    assert_eq!(
        reports[&1].stubs,
        vec![StubReply {
            lkid: p.lkid(),
            reply: MsgType::UnlockReply,
            result: Status::Unlocked,
        }]
    );
    assert_eq!(p.completions(), vec![Status::Ok, Status::Unlocked]);
    assert_eq!(c.ls(1).lock_count(), 0);
    assert_eq!(c.ls(1).stats().stub_replies, 1);
}

#[test]
fn test_cancel_in_flight_gets_stub_reply() {
    let (mut c, _holder) = mastered_on_3(LockMode::Ex);
    let p = Caller::new();
    p.lock(c.ls(1), RES, LockMode::Pr, LockFlags::empty());
    c.pump();
    assert_eq!(p.unlock(c.ls(1), LockFlags::CANCEL), Status::Ok);

    c.fail(3);
    let reports = c.recover();
    c.pump();

    assert_eq!(reports[&1].stubs.len(), 1);
    assert_eq!(reports[&1].stubs[0].reply, MsgType::CancelReply);
    assert_eq!(p.completions(), vec![Status::Cancelled]);
    assert_eq!(c.ls(1).lock_count(), 0);
}

#[test]
fn test_overlapping_cancel_replaces_resend() {
    let (mut c, _holder) = mastered_on_3(LockMode::Ex);
    let anchor = granted(&c, 1, RES, LockMode::Nl);
    let p = Caller::new();
    p.lock(c.ls(1), RES, LockMode::Pr, LockFlags::empty());
    // request still in flight
    assert_eq!(p.unlock(c.ls(1), LockFlags::CANCEL), Status::Ok);

    c.fail(3);
    let reports = c.recover();
    c.pump();

    assert!(reports[&1].resent.is_empty());
    assert_eq!(p.completions(), vec![Status::Cancelled]);
    assert_eq!(anchor.completions(), vec![Status::Ok]);
    assert_eq!(c.ls(1).lock_count(), 1);
}

// ============ Departed Holder Tests ============

#[test]
fn test_master_copies_of_departed_node_are_purged() {
    let mut c = Cluster::new(3);
    let holder = granted(&c, 1, RES, LockMode::Nl);
    let remote = Caller::with_lvb(32);
    remote.lock(c.ls(3), RES, LockMode::Ex, LockFlags::VALBLK);
    c.pump();
    assert_eq!(remote.completions(), vec![Status::Ok]);

    let waiter = Caller::new();
    waiter.lock(c.ls(2), RES, LockMode::Pr, LockFlags::empty());
    c.pump();
    assert!(waiter.completions().is_empty());
    assert_eq!(c.ls(1).lock_count(), 3);

    c.fail(3);
    let reports = c.recover();
    c.pump();

    assert_eq!(reports[&1].purged, 1);
    assert_eq!(reports[&2].purged, 0);
    assert_eq!(waiter.completions(), vec![Status::Ok]);
    let info = c.ls(1).resource_info(RES).unwrap();
    assert!(info.valnotvalid);
    assert_eq!(info.granted.len(), 2);
    assert_eq!(holder.completions(), vec![Status::Ok]);
}

#[test]
fn test_messages_from_departed_node_are_ignored() {
    let (mut c, _holder) = mastered_on_3(LockMode::Nl);
    let _p = granted(&c, 1, RES, LockMode::Pr);
    c.fail(3);
    c.recover();

    let dropped = c.ls(1).stats().messages_dropped;
    let frame = Frame {
        lockspace: LS_ID,
        nodeid: 3,
        message: Message::Purge { nodeid: 1, pid: 0 },
    };
    c.ls(1).receive_frame(frame);
    assert_eq!(c.ls(1).stats().messages_dropped, dropped + 1);
    assert_eq!(c.ls(1).lock_count(), 1);
}

// ============ Masterless Mode Tests ============

#[test]
fn test_masterless_mode_uses_hash_master() {
    let mut c = Cluster::with_config(3, test_config().with_no_directory(true));
    let name = b"hashed-resource";
    let callers: Vec<(u32, Caller)> = (1..=3).map(|n| (n, granted(&c, n, name, LockMode::Cr))).collect();
    assert!(c.dir.is_empty());

    let master = c.ls(1).lock_info(callers[0].1.lkid()).unwrap().nodeid;
    for (n, p) in &callers {
        assert_eq!(c.ls(*n).lock_info(p.lkid()).unwrap().nodeid, master);
    }

    c.fail(master);
    let reports = c.recover();
    c.pump();

    let survivors: Vec<&(u32, Caller)> = callers.iter().filter(|(n, _)| *n != master).collect();
    let new_master = c
        .ls(survivors[0].0)
        .lock_info(survivors[0].1.lkid())
        .unwrap()
        .nodeid;
    assert_ne!(new_master, master);
    for (n, p) in &survivors {
        assert_eq!(reports[n].masters_reset, 1);
        assert_eq!(c.ls(*n).lock_info(p.lkid()).unwrap().nodeid, new_master);
    }
    assert_eq!(reports[&new_master].adopted, 1);
    assert!(c.dir.is_empty());
}

#[test]
fn test_recovery_counts_and_timing() {
    let (mut c, _holder) = mastered_on_3(LockMode::Nl);
    let _p = granted(&c, 2, RES, LockMode::Cr);
    c.fail(3);
    let reports = c.recover();
    for (id, report) in &reports {
        assert_eq!(c.ls(*id).stats().recoveries, 1);
        assert!(report.stubs.is_empty());
    }
    assert!(!c.ls(1).is_aborted());
    assert!(!c.ls(2).is_aborted());
}
