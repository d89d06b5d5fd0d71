//! Shared handles wired up once at process startup and threaded through
//! every CLI one-shot command and the daemon's monitor tasks.

use std::path::PathBuf;
use std::time::Duration;

use overlayd_core::iface::PhysicalInterface;
use overlayd_core::policy::{DefaultRouteBinding, PolicyGroup};
use overlayd_core::registry::{self, Registry};
use overlayd_core::tunnel::TunnelRecord;
use overlayd_root::kernel::RealKernel;

const DEFAULT_BINDING_FILE: &str = "default_route.toml";

/// Mirrors `config::default_protection_min_dwell`'s value for one-shot CLI
/// commands that run outside the daemon and so never parse the config file's
/// `protection_min_dwell` field.
const FALLBACK_PROTECTION_MIN_DWELL: Duration = Duration::from_secs(10);

pub struct Context {
    pub kernel: RealKernel,
    pub physicals: Registry<PhysicalInterface>,
    pub tunnels: Registry<TunnelRecord>,
    pub groups: Registry<PolicyGroup>,
    pub protection_min_dwell: Duration,
    records_dir: PathBuf,
    pub runtime_dir: PathBuf,
}

impl Context {
    pub fn load() -> Result<Self, crate::error::AppError> {
        let records_dir = overlayd_core::dirs::records_dir()?;
        let runtime_dir = overlayd_core::dirs::runtime_dir()?;
        let protection_min_dwell = std::env::var(overlayd_core::config::ENV_VAR)
            .ok()
            .map(PathBuf::from)
            .or_else(|| Some(PathBuf::from(overlayd_core::config::DEFAULT_PATH)))
            .and_then(|path| overlayd_core::config::read(&path).ok())
            .map(|config| config.protection_min_dwell)
            .unwrap_or(FALLBACK_PROTECTION_MIN_DWELL);
        Ok(Self {
            kernel: RealKernel,
            physicals: Registry::new(records_dir.join("physicals"))?,
            tunnels: Registry::new(records_dir.join("tunnels"))?,
            groups: Registry::new(records_dir.join("policy_groups"))?,
            protection_min_dwell,
            records_dir,
            runtime_dir,
        })
    }

    fn default_binding_path(&self) -> PathBuf {
        self.records_dir.join(DEFAULT_BINDING_FILE)
    }

    pub fn load_default_binding(&self) -> Result<DefaultRouteBinding, registry::Error> {
        let path = self.default_binding_path();
        if !path.exists() {
            return Ok(DefaultRouteBinding::default());
        }
        let raw = std::fs::read_to_string(&path)?;
        Ok(toml::from_str(&raw)?)
    }

    pub fn save_default_binding(&self, binding: &DefaultRouteBinding) -> Result<(), registry::Error> {
        let raw = toml::to_string_pretty(binding)?;
        std::fs::write(self.default_binding_path(), raw)?;
        Ok(())
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.runtime_dir.join("state.json")
    }

    pub fn pid_path(&self) -> PathBuf {
        self.runtime_dir.join("overlayd.pid")
    }

    pub fn rev_dir(&self) -> PathBuf {
        self.runtime_dir.join("rev")
    }
}
