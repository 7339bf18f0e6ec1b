//! Lock timeouts, timewarn, and the periodic resource scan.

mod common;

use std::thread;
use std::time::{Duration, Instant};

use common::{granted, test_config, Cluster, Caller};
use oxidlm::{LockFlags, LockMode, Scand, Status};

const RES: &[u8] = b"timed";

fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    done()
}

// ============ Timeout Tests ============

#[test]
fn test_queued_request_times_out() {
    let c = Cluster::new(1);
    let ls = c.ls(1);
    let _holder = granted(&c, 1, RES, LockMode::Ex);

    let p = Caller::new();
    ls.lock(p.request(RES, LockMode::Pr).with_timeout(1));
    c.pump();
    assert_eq!(ls.timeout_count(), 1);

    thread::sleep(Duration::from_millis(30));
    assert_eq!(ls.scan_timeouts(), 1);
    c.pump();
    assert_eq!(p.completions(), vec![Status::TimedOut]);
    assert_eq!(ls.timeout_count(), 0);
    assert_eq!(ls.lock_count(), 1);
    assert_eq!(ls.stats().timeouts, 1);
}

#[test]
fn test_timed_out_conversion_keeps_granted_mode() {
    let c = Cluster::new(1);
    let ls = c.ls(1);
    let _other = granted(&c, 1, RES, LockMode::Pr);
    let p = granted(&c, 1, RES, LockMode::Pr);

    ls.lock(p.convert(LockMode::Ex).with_timeout(1));
    c.pump();
    thread::sleep(Duration::from_millis(30));
    assert_eq!(ls.scan_timeouts(), 1);
    c.pump();
    assert_eq!(p.completions(), vec![Status::Ok, Status::TimedOut]);
    assert_eq!(ls.lock_info(p.lkid()).unwrap().grmode, LockMode::Pr);
}

#[test]
fn test_grant_before_timeout_disarms_it() {
    let c = Cluster::new(1);
    let ls = c.ls(1);
    let holder = granted(&c, 1, RES, LockMode::Ex);

    let p = Caller::new();
    ls.lock(p.request(RES, LockMode::Pr).with_timeout(1));
    holder.unlock(ls, LockFlags::empty());
    c.pump();
    assert_eq!(p.completions(), vec![Status::Ok]);

    thread::sleep(Duration::from_millis(30));
    assert_eq!(ls.scan_timeouts(), 0);
    assert_eq!(ls.timeout_count(), 0);
}

#[test]
fn test_huge_timeout_never_fires() {
    let c = Cluster::new(1);
    let ls = c.ls(1);
    let holder = granted(&c, 1, RES, LockMode::Ex);

    let p = Caller::new();
    assert_eq!(
        ls.lock(p.request(RES, LockMode::Pr).with_timeout(u64::MAX)),
        Status::InProgress
    );
    c.pump();
    assert_eq!(ls.timeout_count(), 1);
    assert_eq!(ls.scan_timeouts(), 0);
    assert!(p.completions().is_empty());

    holder.unlock(ls, LockFlags::empty());
    c.pump();
    assert_eq!(p.completions(), vec![Status::Ok]);
    assert_eq!(ls.timeout_count(), 0);
}

#[test]
fn test_remote_request_times_out_at_requester() {
    let c = Cluster::new(2);
    let _holder = granted(&c, 1, RES, LockMode::Ex);
    let p = Caller::new();
    c.ls(2).lock(p.request(RES, LockMode::Pr).with_timeout(1));
    c.pump();
    assert_eq!(c.ls(2).timeout_count(), 1);
    assert_eq!(c.ls(1).timeout_count(), 0);

    thread::sleep(Duration::from_millis(30));
    assert_eq!(c.ls(2).scan_timeouts(), 1);
    c.pump();
    assert_eq!(p.completions(), vec![Status::TimedOut]);
    assert_eq!(c.lock_count(), 1);
}

#[test]
fn test_timewarn_counts_slow_waiters() {
    let c = Cluster::with_config(1, test_config().with_timewarn_cs(1));
    let ls = c.ls(1);
    let _holder = granted(&c, 1, RES, LockMode::Ex);

    let slow = Caller::new();
    slow.lock(ls, RES, LockMode::Pr, LockFlags::empty());
    let quiet = Caller::new();
    quiet.lock(ls, RES, LockMode::Pr, LockFlags::NODLCKWT);
    assert_eq!(ls.timeout_count(), 1);

    thread::sleep(Duration::from_millis(30));
    assert_eq!(ls.scan_timeouts(), 0);
    assert_eq!(ls.stats().timewarns, 1);
    // warned once only
    ls.scan_timeouts();
    assert_eq!(ls.stats().timewarns, 1);
    assert!(slow.completions().is_empty());
}

// ============ Toss Scan Tests ============

#[test]
fn test_scan_frees_expired_tossed_resources() {
    let c = Cluster::with_config(1, test_config().with_toss_secs(0));
    let ls = c.ls(1);
    for name in [b"t-1".as_slice(), b"t-2", b"t-3"] {
        let p = granted(&c, 1, name, LockMode::Cr);
        p.unlock(ls, LockFlags::empty());
    }
    let _kept = granted(&c, 1, b"t-4", LockMode::Cr);
    c.pump();
    assert_eq!(ls.tossed_count(), 3);

    let report = ls.scan();
    assert_eq!(report.freed, 3);
    assert_eq!(report.timeouts, 0);
    assert_eq!(ls.tossed_count(), 0);
    assert_eq!(ls.resource_count(), 1);
    assert_eq!(ls.stats().toss_freed, 3);
    assert!(ls.resource_info(b"t-1").is_none());
}

#[test]
fn test_toss_period_protects_recent_resources() {
    let c = Cluster::new(1);
    let ls = c.ls(1);
    let p = granted(&c, 1, RES, LockMode::Cr);
    p.unlock(ls, LockFlags::empty());
    c.pump();
    assert_eq!(ls.scan_rsbs(), 0);
    assert_eq!(ls.tossed_count(), 1);
}

#[test]
fn test_tossed_resource_is_revived_with_its_lvb() {
    let c = Cluster::new(1);
    let ls = c.ls(1);
    let writer = Caller::with_lvb(32);
    writer.lock(ls, RES, LockMode::Ex, LockFlags::VALBLK);
    c.pump();
    writer.lksb.set_lvb(b"kept");
    writer.unlock(ls, LockFlags::VALBLK);
    c.pump();
    assert_eq!(ls.tossed_count(), 1);

    let reader = Caller::with_lvb(32);
    reader.lock(ls, RES, LockMode::Pr, LockFlags::VALBLK);
    c.pump();
    assert_eq!(ls.tossed_count(), 0);
    assert_eq!(&reader.lksb.lvb().unwrap()[..4], b"kept");
}

#[test]
fn test_freeing_mastered_resource_drops_directory_entry() {
    let c = Cluster::with_config(2, test_config().with_toss_secs(0));
    let p = granted(&c, 2, RES, LockMode::Ex);
    assert_eq!(c.master_of(RES), Some(2));
    p.unlock(c.ls(2), LockFlags::empty());
    c.pump();

    assert_eq!(c.ls(2).scan_rsbs(), 1);
    c.pump();
    assert_eq!(c.master_of(RES), None);

    // the next requester becomes master
    let _q = granted(&c, 1, RES, LockMode::Ex);
    assert_eq!(c.master_of(RES), Some(1));
}

// ============ Scanner Thread Tests ============

#[test]
fn test_scand_kick_runs_a_scan() {
    let c = Cluster::with_config(1, test_config().with_toss_secs(0).with_scan_secs(60));
    let ls = c.ls(1);
    let p = granted(&c, 1, RES, LockMode::Nl);
    p.unlock(ls, LockFlags::empty());
    c.pump();
    assert_eq!(ls.tossed_count(), 1);

    let scand = Scand::start(ls);
    assert!(scand.kick());
    assert!(wait_until(Duration::from_secs(5), || ls.tossed_count() == 0));
    scand.stop();
    assert!(!scand.kick());
}

#[test]
fn test_scand_stops_on_drop() {
    let c = Cluster::new(1);
    let scand = Scand::start(c.ls(1));
    drop(scand);
    assert_eq!(c.ls(1).resource_count(), 0);
}
