//! WireGuard driver (C5): link creation, private key handoff over stdin,
//! peer configuration for client/server modes, and the client-side
//! handshake latch.

use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;

use overlayd_core::priority::TABLE_OVERLAY_VIP;
use overlayd_core::tunnel::{TunnelRecord, WireGuardMode, WireGuardParams};

use crate::gre_ipsec::ensure_shared_overlay_rule;
use crate::kernel::Kernel;
use crate::revfile::{RevCommand, RevFile};

const PERSISTENT_KEEPALIVE_SECS: u16 = 25;
const HANDSHAKE_POLL_INTERVAL: Duration = Duration::from_secs(1);
const HANDSHAKE_POLL_ATTEMPTS: u32 = 15;
const HANDSHAKE_PROBE_BURSTS: u32 = 5;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Kernel(#[from] crate::kernel::Error),
    #[error(transparent)]
    RevFile(#[from] crate::revfile::Error),
}

/// Whether a pre-existing `wg-quick@<name>` unit or config file would race
/// with a tunnel we're about to take direct control of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub systemd_unit_active: bool,
    pub legacy_config_present: bool,
}

impl Conflict {
    pub fn none() -> Self {
        Self {
            systemd_unit_active: false,
            legacy_config_present: false,
        }
    }

    pub fn any(&self) -> bool {
        self.systemd_unit_active || self.legacy_config_present
    }
}

/// Detects whether `name` is already managed by `wg-quick`/systemd, so the
/// caller can offer to stop the unit or back up the legacy config before we
/// take over the link ourselves.
pub async fn detect_conflict(name: &str) -> Conflict {
    let unit_active = tokio::process::Command::new("systemctl")
        .args(["is-active", "--quiet", &format!("wg-quick@{name}")])
        .status()
        .await
        .map(|status| status.success())
        .unwrap_or(false);
    let legacy_config_present = std::path::Path::new(&format!("/etc/wireguard/{name}.conf")).exists();
    Conflict {
        systemd_unit_active: unit_active,
        legacy_config_present,
    }
}

/// Runs the full create sequence for a WireGuard tunnel.
pub async fn create<K: Kernel>(kernel: &K, rev_dir: &Path, record: &TunnelRecord, params: &WireGuardParams) -> Result<(), Error> {
    let mut rev = RevFile::open(rev_dir, &record.name)?;

    kernel.link_add_wireguard(&record.name).await?;
    rev.push(RevCommand::LinkDel(record.name.clone()))?;

    kernel.wg_set_private_key(&record.name, &params.private_key).await?;

    if params.local_listen_port > 0 {
        kernel.wg_set_listen_port(&record.name, params.local_listen_port).await?;
    }

    let endpoint = match params.mode {
        WireGuardMode::Client => Some((record.remote_underlay_ip, params.peer_listen_port)),
        WireGuardMode::Server => None,
    };
    let keepalive = match params.mode {
        WireGuardMode::Client => Some(PERSISTENT_KEEPALIVE_SECS),
        WireGuardMode::Server => None,
    };
    kernel
        .wg_set_peer(&record.name, &params.peer_public_key, endpoint, keepalive)
        .await?;

    kernel.addr_add(&record.name, record.local_virtual_ip, 32).await?;
    rev.push(RevCommand::AddrDel {
        dev: record.name.clone(),
        addr: record.local_virtual_ip,
        prefix_len: 32,
    })?;

    kernel.link_set_up(&record.name, None).await?;

    ensure_shared_overlay_rule(kernel).await.map_err(|e| match e {
        crate::gre_ipsec::Error::Kernel(k) => Error::Kernel(k),
        _ => unreachable!("ensure_shared_overlay_rule only returns Kernel errors"),
    })?;

    let dest = format!("{}/32", record.remote_virtual_ip);
    kernel
        .route_add(&dest, None, &record.name, TABLE_OVERLAY_VIP, false)
        .await?;
    rev.push(RevCommand::RouteDel {
        dest,
        table: TABLE_OVERLAY_VIP,
    })?;

    if params.mode == WireGuardMode::Client {
        latch_handshake(kernel, record).await;
    }

    Ok(())
}

/// Client-only: sends a handful of probe bursts to trigger a handshake,
/// then polls `wg show <if> latest-handshakes` until one completes or the
/// poll budget runs out. Timeout is a warning, not a failure.
async fn latch_handshake<K: Kernel>(kernel: &K, record: &TunnelRecord) {
    for _ in 0..HANDSHAKE_PROBE_BURSTS {
        let _ = kernel.ping(record.remote_underlay_ip, 1, Duration::from_millis(10)).await;
    }

    for _ in 0..HANDSHAKE_POLL_ATTEMPTS {
        match kernel.wg_latest_handshake(&record.name).await {
            Ok(ts) if ts > 0 => {
                tracing::info!(tunnel = %record.name, timestamp = ts, "wireguard handshake completed");
                return;
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(tunnel = %record.name, %err, "failed to poll handshake state");
            }
        }
        sleep(HANDSHAKE_POLL_INTERVAL).await;
    }
    tracing::warn!(tunnel = %record.name, "no wireguard handshake within the poll budget; will complete opportunistically");
}

pub async fn destroy<K: Kernel>(kernel: &K, rev_dir: &Path, name: &str) -> Result<(), Error> {
    let mut rev = RevFile::open(rev_dir, name)?;
    rev.execute_teardown(kernel).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::mocks::FakeKernel;
    use overlayd_core::tunnel::TunnelKind;

    fn sample_record(mode: WireGuardMode) -> (TunnelRecord, WireGuardParams) {
        let params = WireGuardParams {
            private_key: "cGl2YXRlLWtleS1wbGFjZWhvbGRlci0zMmJ5dGVz".into(),
            public_key: "cHVibGljLWtleS1wbGFjZWhvbGRlci0zMmJ5dGVzcw".into(),
            peer_public_key: "cGVlci1wdWJsaWMta2V5LXBsYWNlaG9sZGVyMzI".into(),
            local_listen_port: 51820,
            peer_listen_port: if mode == WireGuardMode::Client { 51820 } else { 0 },
            mode,
        };
        let record = TunnelRecord {
            name: "wg0".into(),
            kind: TunnelKind::WireGuard(params.clone()),
            parent: "eth0".into(),
            local_underlay_ip: "10.0.0.1".parse().unwrap(),
            remote_underlay_ip: "10.0.0.2".parse().unwrap(),
            local_virtual_ip: "192.168.100.1".parse().unwrap(),
            remote_virtual_ip: "192.168.100.2".parse().unwrap(),
            cost: 0,
            enabled: true,
            protected_underlay_ip: None,
            protected_since: None,
        };
        (record, params)
    }

    #[tokio::test]
    async fn server_mode_create_omits_endpoint_and_keepalive() {
        let kernel = FakeKernel::new();
        let dir = tempfile::tempdir().unwrap();
        let (record, params) = sample_record(WireGuardMode::Server);

        create(&kernel, dir.path(), &record, &params).await.unwrap();

        let state = kernel.state.lock().unwrap();
        assert_eq!(state.links, vec!["wg0"]);
        assert_eq!(state.wg_peers.get("wg0").unwrap(), &vec![params.peer_public_key.clone()]);
        assert_eq!(state.wg_private_keys.get("wg0").unwrap(), &params.private_key);
    }

    #[tokio::test]
    async fn client_mode_create_installs_route_and_address() {
        let kernel = FakeKernel::new();
        let dir = tempfile::tempdir().unwrap();
        let (record, params) = sample_record(WireGuardMode::Client);

        create(&kernel, dir.path(), &record, &params).await.unwrap();

        let state = kernel.state.lock().unwrap();
        assert!(state.addrs.contains(&("wg0".to_string(), record.local_virtual_ip, 32)));
        assert!(state
            .routes
            .get(&TABLE_OVERLAY_VIP)
            .unwrap()
            .iter()
            .any(|r| r.contains("192.168.100.2")));
    }

    #[tokio::test]
    async fn destroy_removes_the_link() {
        let kernel = FakeKernel::new();
        let dir = tempfile::tempdir().unwrap();
        let (record, params) = sample_record(WireGuardMode::Server);

        create(&kernel, dir.path(), &record, &params).await.unwrap();
        destroy(&kernel, dir.path(), &record.name).await.unwrap();

        assert!(kernel.state.lock().unwrap().links.is_empty());
    }
}
