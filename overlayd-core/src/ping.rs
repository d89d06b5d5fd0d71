//! ICMP probe parameters and summary parsing, shared between the probe
//! driver (`overlayd-root`) and anything that needs to reason about a probe
//! result without actually sending packets (tests, the status reporter).

use std::time::Duration;

/// Adaptive packet count: `clamp(check_interval_ms / 100, 10, 20)`.
pub fn packet_count(check_interval: Duration) -> u32 {
    let by_interval = (check_interval.as_millis() / 100) as u32;
    by_interval.clamp(10, 20)
}

pub const PACKET_SPACING: Duration = Duration::from_millis(40);
pub const PER_PACKET_TIMEOUT: Duration = Duration::from_secs(1);

/// Outcome of a bounded ping run against one target.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PingResult {
    pub mean_latency_ms: f64,
    pub loss_pct: f64,
}

impl PingResult {
    pub fn success(self) -> bool {
        self.loss_pct < 100.0
    }
}

/// Parses the numbers an `ip -s` style ping summary reports: packets sent,
/// packets received, and the average RTT in milliseconds from the `rtt
/// min/avg/max/mdev` line. Callers that drive the real `ping` binary extract
/// these two numbers from its stdout and hand them here rather than
/// re-deriving the arithmetic at each call site.
pub fn summarize(sent: u32, received: u32, avg_rtt_ms: f64) -> PingResult {
    let loss_pct = if sent == 0 {
        100.0
    } else {
        ((sent - received) as f64 / sent as f64) * 100.0
    };
    PingResult {
        mean_latency_ms: avg_rtt_ms,
        loss_pct,
    }
}
