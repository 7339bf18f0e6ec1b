//! Lockspace statistics
//!
//! Counters kept by every lockspace and a reporter that formats them.

pub mod metrics;
pub mod reporter;

pub use metrics::{LockspaceStats, StatsSnapshot};
pub use reporter::{ReportFormat, StatsReporter};
