//! Versioned on-disk configuration: the default-route binding plus the set
//! of failover monitors the daemon should run.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::net::Ipv4Addr;
use std::path::Path;

use crate::policy::DefaultRouteBinding;

pub const DEFAULT_PATH: &str = "/etc/overlayd/overlayd.toml";
pub const ENV_VAR: &str = "OVERLAYD_CONFIG_PATH";

const CURRENT_VERSION: u8 = 1;

fn default_interval() -> humantime::Duration {
    humantime::Duration::from(std::time::Duration::from_millis(500))
}

fn default_score_margin() -> f64 {
    5.0
}

fn default_confirmation_count() -> u32 {
    1
}

/// How often the daemon re-runs `SyncProtection` independently of monitor
/// ticks.
fn default_sync_interval() -> humantime::Duration {
    humantime::Duration::from(std::time::Duration::from_secs(5))
}

/// Minimum time a protection rule must stand before SyncProtection accepts a
/// new peer endpoint as authoritative, damping a WireGuard peer that migrates
/// faster than it can be trusted. Defaults to twice the sync interval.
fn default_protection_min_dwell() -> humantime::Duration {
    humantime::Duration::from(std::time::Duration::from_secs(10))
}

/// `policy-group` monitors retarget a named group's exit; `default-route`
/// monitors retarget the system default.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum MonitorKind {
    PolicyGroup,
    DefaultRoute,
}

/// Health-check discipline for a monitor: which probe method, which targets,
/// and (for DNS mode) which query name and servers to use.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Copy)]
#[serde(rename_all = "kebab-case")]
pub enum CheckMode {
    Ping,
    Dns,
}

impl Default for CheckMode {
    fn default() -> Self {
        CheckMode::Ping
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthConfig {
    #[serde(default)]
    pub mode: CheckMode,
    /// Probe targets, tried in order; first success wins.
    pub targets: Vec<Ipv4Addr>,
    /// DNS servers to query against, in `mode = "dns"`.
    #[serde(default)]
    pub dns_servers: Vec<Ipv4Addr>,
    /// Query name resolved in `mode = "dns"`.
    #[serde(default)]
    pub dns_query_name: Option<String>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            mode: CheckMode::Ping,
            targets: vec!["1.1.1.1".parse().unwrap(), "8.8.8.8".parse().unwrap()],
            dns_servers: Vec::new(),
            dns_query_name: None,
        }
    }
}

/// One independently ticking failover monitor, evaluating `candidates` and
/// retargeting `target` (a policy-group name, or "default").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Monitor {
    pub name: String,
    pub kind: MonitorKind,
    pub target: String,
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: std::time::Duration,
    #[serde(default = "default_score_margin")]
    pub score_margin: f64,
    #[serde(default = "default_confirmation_count")]
    pub confirmation_count: u32,
    #[serde(default)]
    pub check: HealthConfig,
    /// Candidate exit interface names; at least two are required.
    pub candidates: Vec<String>,
}

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("monitor {0} needs at least two candidates")]
    TooFewCandidates(String),
    #[error("monitor {0} has a duplicate name")]
    DuplicateMonitorName(String),
}

impl Monitor {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.candidates.len() < 2 {
            return Err(ValidationError::TooFewCandidates(self.name.clone()));
        }
        Ok(())
    }

    pub fn check_mode(&self) -> CheckMode {
        self.check.mode
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub default_route: DefaultRouteBinding,
    #[serde(default)]
    pub monitors: Vec<Monitor>,
    /// How often `SyncProtection` runs independently of monitor ticks.
    #[serde(default = "default_sync_interval", with = "humantime_serde")]
    pub sync_interval: std::time::Duration,
    /// Minimum dwell time before a WireGuard peer migration is accepted; see
    /// [`default_protection_min_dwell`].
    #[serde(default = "default_protection_min_dwell", with = "humantime_serde")]
    pub protection_min_dwell: std::time::Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_route: DefaultRouteBinding::default(),
            monitors: Vec::new(),
            sync_interval: default_sync_interval().into(),
            protection_min_dwell: default_protection_min_dwell().into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration file not found")]
    NoFile,
    #[error("unable to determine configuration version")]
    VersionNotFound,
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
    #[error("deserialization error: {0}")]
    Decode(#[from] toml::de::Error),
    #[error("unsupported config version: {0}")]
    VersionMismatch(u8),
    #[error("duplicate monitor name: {0}")]
    DuplicateMonitorName(String),
    #[error("{0}")]
    Validation(#[from] ValidationError),
}

/// Versioned config dispatch: a `version` field selects the parse path so
/// future format changes don't break old config files in place.
pub fn read(path: &Path) -> Result<Config, Error> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::NoFile
        } else {
            Error::IO(e)
        }
    })?;

    let table = content.parse::<toml::Table>()?;
    let version = table
        .get("version")
        .and_then(|v| v.as_integer())
        .ok_or(Error::VersionNotFound)?;

    match version {
        1 => {
            let config: Config = toml::from_str(&content)?;
            validate(&config)?;
            Ok(config)
        }
        other => Err(Error::VersionMismatch(other as u8)),
    }
}

fn validate(config: &Config) -> Result<(), Error> {
    let mut seen = std::collections::HashSet::new();
    for monitor in &config.monitors {
        if !seen.insert(monitor.name.clone()) {
            return Err(Error::DuplicateMonitorName(monitor.name.clone()));
        }
        monitor.validate()?;
    }
    Ok(())
}

pub fn current_version() -> u8 {
    CURRENT_VERSION
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_minimal_v1_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("overlayd.toml");
        std::fs::write(
            &path,
            r#"
            version = 1

            [[monitors]]
            name = "default"
            kind = "default-route"
            target = "default"
            candidates = ["eth0", "tun01"]
            "#,
        )
        .unwrap();
        let config = read(&path).unwrap();
        assert_eq!(config.monitors.len(), 1);
        assert_eq!(config.monitors[0].interval, std::time::Duration::from_millis(500));
    }

    #[test]
    fn missing_file_is_distinguishable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.toml");
        assert!(matches!(read(&path), Err(Error::NoFile)));
    }

    #[test]
    fn duplicate_monitor_names_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("overlayd.toml");
        std::fs::write(
            &path,
            r#"
            version = 1

            [[monitors]]
            name = "m1"
            kind = "default-route"
            target = "default"
            candidates = ["eth0", "tun01"]

            [[monitors]]
            name = "m1"
            kind = "policy-group"
            target = "g1"
            candidates = ["eth0", "tun02"]
            "#,
        )
        .unwrap();
        assert!(matches!(read(&path), Err(Error::DuplicateMonitorName(_))));
    }

    #[test]
    fn single_candidate_monitor_rejected() {
        let monitor = Monitor {
            name: "m1".into(),
            kind: MonitorKind::DefaultRoute,
            target: "default".into(),
            interval: std::time::Duration::from_millis(500),
            score_margin: 5.0,
            confirmation_count: 1,
            check: HealthConfig::default(),
            candidates: vec!["eth0".into()],
        };
        assert!(monitor.validate().is_err());
    }
}
