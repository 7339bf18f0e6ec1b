//! Statistics reporter
//!
//! Formats a [`StatsSnapshot`] for logs and tooling.

use std::fmt::Write;

use crate::stats::metrics::StatsSnapshot;

/// Output format for statistics reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
    /// Human-readable text format
    Text,
    /// JSON format
    Json,
    /// Compact one-line format
    Compact,
}

/// Statistics reporter
pub struct StatsReporter {
    format: ReportFormat,
    /// Whether to include message and recovery counters
    detailed: bool,
}

impl StatsReporter {
    /// Create a new reporter with the given format
    pub fn new(format: ReportFormat) -> Self {
        Self {
            format,
            detailed: true,
        }
    }

    /// Create a reporter with text format
    pub fn text() -> Self {
        Self::new(ReportFormat::Text)
    }

    /// Create a reporter with JSON format
    pub fn json() -> Self {
        Self::new(ReportFormat::Json)
    }

    /// Set whether to include detailed stats
    pub fn with_detailed(mut self, detailed: bool) -> Self {
        self.detailed = detailed;
        self
    }

    /// Generate a report for `name` from a snapshot
    pub fn report_snapshot(&self, name: &str, snapshot: &StatsSnapshot) -> String {
        match self.format {
            ReportFormat::Text => self.format_text(name, snapshot),
            ReportFormat::Json => self.format_json(name, snapshot),
            ReportFormat::Compact => self.format_compact(name, snapshot),
        }
    }

    fn format_text(&self, name: &str, s: &StatsSnapshot) -> String {
        let mut output = String::new();

        let _ = writeln!(output, "=== Lockspace {name} ===");
        let _ = writeln!(output, "Uptime: {} ms", s.uptime_ms);
        let _ = writeln!(output);

        let _ = writeln!(output, "Operations:");
        let _ = writeln!(output, "  Requests:    {} (remote: {})", s.requests, s.remote_requests);
        let _ = writeln!(output, "  Conversions: {}", s.conversions);
        let _ = writeln!(output, "  Unlocks:     {}", s.unlocks);
        let _ = writeln!(output, "  Cancels:     {}", s.cancels);
        let _ = writeln!(output, "  Grants:      {}", s.grants);
        let _ = writeln!(
            output,
            "  Completions: {} (failed: {})",
            s.completions, s.failed_completions
        );
        let _ = writeln!(output, "  Basts:       {}", s.basts);
        let _ = writeln!(output);

        let _ = writeln!(output, "Tables:");
        let _ = writeln!(output, "  Locks:     {}", s.locks);
        let _ = writeln!(output, "  Resources: {} (tossed: {})", s.resources, s.tossed);
        let _ = writeln!(output, "  Waiters:   {}", s.waiters);

        if self.detailed {
            let _ = writeln!(output);
            let _ = writeln!(output, "Messages:");
            let _ = writeln!(output, "  Sent:     {} (errors: {})", s.messages_sent, s.send_errors);
            let _ = writeln!(output, "  Received: {}", s.messages_received);
            let _ = writeln!(output, "  Dropped:  {}", s.messages_dropped);
            let _ = writeln!(output, "  Lookups:  {}", s.lookups);
            let _ = writeln!(output);

            let _ = writeln!(output, "Recovery:");
            let _ = writeln!(output, "  Passes:  {}", s.recoveries);
            let _ = writeln!(output, "  Stubs:   {}", s.stub_replies);
            let _ = writeln!(output, "  Resends: {}", s.resends);
            let _ = writeln!(output);

            let _ = writeln!(output, "Scanner:");
            let _ = writeln!(output, "  Timeouts:   {}", s.timeouts);
            let _ = writeln!(output, "  Timewarns:  {}", s.timewarns);
            let _ = writeln!(output, "  Toss freed: {}", s.toss_freed);
        }

        output
    }

    fn format_json(&self, name: &str, s: &StatsSnapshot) -> String {
        let mut value = serde_json::json!({
            "lockspace": name,
            "stats": s,
        });
        if !self.detailed {
            if let Some(stats) = value.get_mut("stats").and_then(|v| v.as_object_mut()) {
                stats.retain(|key, _| {
                    matches!(
                        key.as_str(),
                        "uptime_ms"
                            | "requests"
                            | "conversions"
                            | "unlocks"
                            | "cancels"
                            | "completions"
                            | "locks"
                            | "resources"
                            | "waiters"
                    )
                });
            }
        }
        serde_json::to_string_pretty(&value).unwrap_or_default()
    }

    fn format_compact(&self, name: &str, s: &StatsSnapshot) -> String {
        format!(
            "ls={} req={} cvt={} unl={} cast={} bast={} locks={} rsbs={} waiters={}",
            name,
            s.requests,
            s.conversions,
            s.unlocks,
            s.completions,
            s.basts,
            s.locks,
            s.resources,
            s.waiters
        )
    }
}
