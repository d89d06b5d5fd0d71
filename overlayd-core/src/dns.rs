//! DNS probe parameters shared between the probe driver (`overlayd-root`,
//! which owns the actual `hickory-resolver` lookups) and anything reasoning
//! about probe results without performing them.

use std::time::Duration;

pub const QUERY_TIMEOUT: Duration = Duration::from_secs(1);
pub const QUERY_SPACING: Duration = Duration::from_millis(50);

/// A DNS response code, collapsed to the two buckets that matter for
/// liveness: any answer (even NXDOMAIN/SERVFAIL) proves the resolver is
/// reachable; only a timeout or network error means the path is down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Answered,
    TimedOut,
}

impl ProbeOutcome {
    pub fn is_success(self) -> bool {
        matches!(self, ProbeOutcome::Answered)
    }
}

/// Reduces N probe outcomes (with per-success latency samples) to the
/// (mean latency, loss%) pair the scoring model consumes. `latencies_ms`
/// holds one entry per successful probe only.
pub fn reduce(outcomes: &[ProbeOutcome], success_latencies_ms: &[f64]) -> (f64, f64) {
    let total = outcomes.len();
    let successes = outcomes.iter().filter(|o| o.is_success()).count();
    let loss_pct = if total == 0 {
        100.0
    } else {
        ((total - successes) as f64 / total as f64) * 100.0
    };
    let mean_latency_ms = if success_latencies_ms.is_empty() {
        0.0
    } else {
        success_latencies_ms.iter().sum::<f64>() / success_latencies_ms.len() as f64
    };
    (mean_latency_ms, loss_pct)
}
