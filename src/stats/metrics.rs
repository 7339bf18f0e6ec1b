//! Lockspace counters
//!
//! Counters are bumped with relaxed atomics on the hot paths and read back
//! as a plain [`StatsSnapshot`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;

use crate::status::Status;

/// Counters of one lockspace
#[derive(Debug)]
pub struct LockspaceStats {
    /// New lock requests accepted for processing
    pub requests: AtomicU64,
    /// Requests sent to a remote master
    pub remote_requests: AtomicU64,
    /// Conversions submitted
    pub conversions: AtomicU64,
    /// Unlocks submitted
    pub unlocks: AtomicU64,
    /// Cancels submitted
    pub cancels: AtomicU64,
    /// Locks granted by this node as master
    pub grants: AtomicU64,
    /// Completions queued
    pub completions: AtomicU64,
    /// Completions carrying a failure
    pub failed_completions: AtomicU64,
    /// Blocking notifications queued or sent
    pub basts: AtomicU64,
    /// Master lookups
    pub lookups: AtomicU64,
    /// Messages handed to the transport
    pub messages_sent: AtomicU64,
    /// Sends the transport refused
    pub send_errors: AtomicU64,
    /// Messages processed
    pub messages_received: AtomicU64,
    /// Inbound frames dropped
    pub messages_dropped: AtomicU64,
    /// Replies made up by recovery
    pub stub_replies: AtomicU64,
    /// Operations resent by recovery
    pub resends: AtomicU64,
    /// Locks cancelled for timing out
    pub timeouts: AtomicU64,
    /// Timewarn warnings
    pub timewarns: AtomicU64,
    /// Recovery passes
    pub recoveries: AtomicU64,
    /// Tossed resources freed
    pub toss_freed: AtomicU64,
    created: Instant,
}

impl Default for LockspaceStats {
    fn default() -> Self {
        Self {
            requests: AtomicU64::new(0),
            remote_requests: AtomicU64::new(0),
            conversions: AtomicU64::new(0),
            unlocks: AtomicU64::new(0),
            cancels: AtomicU64::new(0),
            grants: AtomicU64::new(0),
            completions: AtomicU64::new(0),
            failed_completions: AtomicU64::new(0),
            basts: AtomicU64::new(0),
            lookups: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            send_errors: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            stub_replies: AtomicU64::new(0),
            resends: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            timewarns: AtomicU64::new(0),
            recoveries: AtomicU64::new(0),
            toss_freed: AtomicU64::new(0),
            created: Instant::now(),
        }
    }
}

#[inline]
fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl LockspaceStats {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new request
    pub fn record_request(&self) {
        bump(&self.requests);
    }

    /// Record a request sent to a remote master
    pub fn record_remote_request(&self) {
        bump(&self.remote_requests);
    }

    /// Record a conversion
    pub fn record_convert(&self) {
        bump(&self.conversions);
    }

    /// Record an unlock
    pub fn record_unlock(&self) {
        bump(&self.unlocks);
    }

    /// Record a cancel
    pub fn record_cancel(&self) {
        bump(&self.cancels);
    }

    /// Record a grant made as master
    pub fn record_grant(&self) {
        bump(&self.grants);
    }

    /// Record a queued completion
    pub fn record_completion(&self, status: Status) {
        bump(&self.completions);
        if status.is_failure() {
            bump(&self.failed_completions);
        }
    }

    /// Record a blocking notification
    pub fn record_bast(&self) {
        bump(&self.basts);
    }

    /// Record a master lookup
    pub fn record_lookup(&self) {
        bump(&self.lookups);
    }

    /// Record a sent message
    pub fn record_send(&self) {
        bump(&self.messages_sent);
    }

    /// Record a failed send
    pub fn record_send_error(&self) {
        bump(&self.send_errors);
    }

    /// Record a processed message
    pub fn record_receive(&self) {
        bump(&self.messages_received);
    }

    /// Record a dropped frame
    pub fn record_dropped(&self) {
        bump(&self.messages_dropped);
    }

    /// Record a stub reply
    pub fn record_stub(&self) {
        bump(&self.stub_replies);
    }

    /// Record a resend
    pub fn record_resend(&self) {
        bump(&self.resends);
    }

    /// Record a timeout cancel
    pub fn record_timeout(&self) {
        bump(&self.timeouts);
    }

    /// Record a timewarn warning
    pub fn record_timewarn(&self) {
        bump(&self.timewarns);
    }

    /// Record a recovery pass
    pub fn record_recovery(&self) {
        bump(&self.recoveries);
    }

    /// Record freed tossed resources
    pub fn record_toss_free(&self, count: u64) {
        self.toss_freed.fetch_add(count, Ordering::Relaxed);
    }

    /// Read every counter
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            uptime_ms: self.created.elapsed().as_millis() as u64,
            requests: load(&self.requests),
            remote_requests: load(&self.remote_requests),
            conversions: load(&self.conversions),
            unlocks: load(&self.unlocks),
            cancels: load(&self.cancels),
            grants: load(&self.grants),
            completions: load(&self.completions),
            failed_completions: load(&self.failed_completions),
            basts: load(&self.basts),
            lookups: load(&self.lookups),
            messages_sent: load(&self.messages_sent),
            send_errors: load(&self.send_errors),
            messages_received: load(&self.messages_received),
            messages_dropped: load(&self.messages_dropped),
            stub_replies: load(&self.stub_replies),
            resends: load(&self.resends),
            timeouts: load(&self.timeouts),
            timewarns: load(&self.timewarns),
            recoveries: load(&self.recoveries),
            toss_freed: load(&self.toss_freed),
            ..StatsSnapshot::default()
        }
    }
}

/// Point-in-time copy of the counters plus table gauges
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Milliseconds since the lockspace was created
    pub uptime_ms: u64,
    /// New lock requests
    pub requests: u64,
    /// Requests sent to a remote master
    pub remote_requests: u64,
    /// Conversions
    pub conversions: u64,
    /// Unlocks
    pub unlocks: u64,
    /// Cancels
    pub cancels: u64,
    /// Grants made as master
    pub grants: u64,
    /// Completions queued
    pub completions: u64,
    /// Completions carrying a failure
    pub failed_completions: u64,
    /// Blocking notifications
    pub basts: u64,
    /// Master lookups
    pub lookups: u64,
    /// Messages sent
    pub messages_sent: u64,
    /// Failed sends
    pub send_errors: u64,
    /// Messages processed
    pub messages_received: u64,
    /// Frames dropped
    pub messages_dropped: u64,
    /// Stub replies
    pub stub_replies: u64,
    /// Resends
    pub resends: u64,
    /// Timeout cancels
    pub timeouts: u64,
    /// Timewarn warnings
    pub timewarns: u64,
    /// Recovery passes
    pub recoveries: u64,
    /// Tossed resources freed
    pub toss_freed: u64,
    /// Locks in the lock table
    pub locks: u64,
    /// Referenced resources
    pub resources: u64,
    /// Resources on the toss list
    pub tossed: u64,
    /// Locks with an operation in flight
    pub waiters: u64,
}
