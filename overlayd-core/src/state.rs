//! Runtime scoring state: per-candidate rolling probe results, the event
//! ring, and atomic persistence of the daemon's snapshot.

use serde::{Deserialize, Serialize};

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::time::SystemTime;

const EVENT_RING_CAPACITY: usize = 20;

/// Per-candidate-exit rolling probe result and derived score.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InterfaceState {
    pub last_latency_ms: f64,
    pub last_loss_pct: f64,
    pub last_cost: u8,
    pub base_score: f64,
    pub final_score: f64,
    pub last_target: String,
    #[serde(with = "humantime_serde")]
    pub last_check: SystemTime,
    pub initial_check_done: bool,
}

impl InterfaceState {
    pub fn from_probe(latency_ms: f64, loss_pct: f64, cost: u8, target: &str, now: SystemTime) -> Self {
        let base = base_score(latency_ms, loss_pct);
        Self {
            last_latency_ms: latency_ms,
            last_loss_pct: loss_pct,
            last_cost: cost,
            base_score: base,
            final_score: final_score(base, cost),
            last_target: target.to_string(),
            last_check: now,
            initial_check_done: true,
        }
    }
}

/// Loss/latency bucket sum; 0 outright if loss is total.
pub fn base_score(latency_ms: f64, loss_pct: f64) -> f64 {
    if loss_pct >= 100.0 {
        return 0.0;
    }
    let loss_points = if loss_pct <= 0.0 {
        60.0
    } else if loss_pct <= 5.0 {
        45.0
    } else if loss_pct <= 10.0 {
        30.0
    } else if loss_pct <= 20.0 {
        15.0
    } else {
        0.0
    };
    let latency_points = if latency_ms < 50.0 {
        40.0
    } else if latency_ms < 100.0 {
        35.0
    } else if latency_ms < 150.0 {
        30.0
    } else if latency_ms < 200.0 {
        25.0
    } else if latency_ms < 300.0 {
        15.0
    } else {
        5.0
    };
    loss_points + latency_points
}

/// Final comparison key: base score discounted by half the configured cost,
/// floored at zero.
pub fn final_score(base: f64, cost: u8) -> f64 {
    (base - 0.5 * cost as f64).max(0.0)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventKind {
    Failover,
    Check,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailoverEvent {
    #[serde(with = "humantime_serde")]
    pub timestamp: SystemTime,
    pub monitor: String,
    pub kind: EventKind,
    pub message: String,
}

/// Fixed-capacity ring of the most recent events, oldest first.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct EventRing {
    events: Vec<FailoverEvent>,
}

impl EventRing {
    pub fn push(&mut self, event: FailoverEvent) {
        self.events.push(event);
        if self.events.len() > EVENT_RING_CAPACITY {
            self.events.remove(0);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &FailoverEvent> {
        self.events.iter()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// The daemon's full in-memory picture, persisted as a single file on each
/// check cycle.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct RuntimeSnapshot {
    #[serde(with = "humantime_serde::option")]
    pub started_at: Option<SystemTime>,
    pub interfaces: HashMap<String, InterfaceState>,
    pub events: EventRing,
}

impl RuntimeSnapshot {
    pub fn new(started_at: SystemTime) -> Self {
        Self {
            started_at: Some(started_at),
            interfaces: HashMap::new(),
            events: EventRing::default(),
        }
    }

    /// Writes the snapshot atomically: write to a sibling temp file, fsync,
    /// then rename over the target.
    pub fn save_atomic(&self, path: &Path) -> Result<(), std::io::Error> {
        let body = serde_json::to_vec_pretty(self)?;
        let tmp_path = path.with_extension("tmp");
        {
            let mut file = std::fs::File::create(&tmp_path)?;
            file.write_all(&body)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }

    /// Loads the snapshot, tolerating absence (fresh start) by returning the
    /// default empty snapshot.
    pub fn load_or_default(path: &Path) -> Result<Self, std::io::Error> {
        match std::fs::read(path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e),
        }
    }
}

/// Returns `true` when `challenger`'s score beats `current`'s score by
/// strictly more than `margin`. A margin greater than or equal to the gap
/// keeps the current exit forever; a zero margin still requires a strictly
/// positive improvement.
pub fn exceeds_margin(current_score: f64, challenger_score: f64, margin: f64) -> bool {
    challenger_score - current_score > margin
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_loss_scores_zero_regardless_of_latency() {
        assert_eq!(base_score(10.0, 100.0), 0.0);
    }

    #[test]
    fn perfect_link_scores_max() {
        assert_eq!(base_score(10.0, 0.0), 100.0);
    }

    #[test]
    fn bucket_boundaries_from_spec_example() {
        // S3: eth0 loss 0%, lat 20ms -> base 100; tun01 loss 0%, lat 40ms -> base 100
        assert_eq!(base_score(20.0, 0.0), 100.0);
        assert_eq!(base_score(40.0, 0.0), 100.0);
        // degraded eth0: loss 20%, lat 100ms -> base 50
        assert_eq!(base_score(100.0, 20.0), 50.0);
    }

    #[test]
    fn final_score_applies_half_cost_discount_floored_at_zero() {
        assert_eq!(final_score(100.0, 20), 90.0);
        assert_eq!(final_score(10.0, 100), 0.0);
    }

    #[test]
    fn margin_uses_strict_greater_than() {
        // gap == margin keeps the current exit (margin >= gap keeps current forever).
        assert!(!exceeds_margin(50.0, 55.0, 5.0));
        assert!(exceeds_margin(50.0, 56.0, 5.0));
        assert!(exceeds_margin(50.0, 50.01, 0.0));
        assert!(!exceeds_margin(50.0, 50.0, 0.0));
    }

    #[test]
    fn event_ring_caps_at_twenty() {
        let mut ring = EventRing::default();
        for i in 0..25 {
            ring.push(FailoverEvent {
                timestamp: SystemTime::UNIX_EPOCH,
                monitor: "m".into(),
                kind: EventKind::Check,
                message: format!("event {i}"),
            });
        }
        assert_eq!(ring.len(), EVENT_RING_CAPACITY);
        assert_eq!(ring.iter().next().unwrap().message, "event 5");
    }

    #[test]
    fn snapshot_save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let snapshot = RuntimeSnapshot::new(SystemTime::UNIX_EPOCH);
        snapshot.save_atomic(&path).unwrap();
        let loaded = RuntimeSnapshot::load_or_default(&path).unwrap();
        assert_eq!(loaded, snapshot);
    }

    #[test]
    fn load_missing_file_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.json");
        let loaded = RuntimeSnapshot::load_or_default(&path).unwrap();
        assert_eq!(loaded, RuntimeSnapshot::default());
    }
}
