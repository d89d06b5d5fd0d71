//! Tunnel record data model shared by the GRE/IPsec and WireGuard drivers.

use serde::{Deserialize, Serialize};

use std::net::Ipv4Addr;

/// WireGuard server tunnels store this sentinel as their remote underlay IP
/// until the peer's first inbound packet reveals its real address.
pub const WIREGUARD_SERVER_SENTINEL: Ipv4Addr = Ipv4Addr::new(0, 0, 0, 0);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum WireGuardMode {
    Server,
    Client,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GreIpsecParams {
    /// SHA-256-hashed, `0x`-prefixed hex auth secret.
    pub auth_key: String,
    /// SHA-256-hashed, `0x`-prefixed hex encryption secret.
    pub enc_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireGuardParams {
    pub private_key: String,
    pub public_key: String,
    pub peer_public_key: String,
    /// 0 means kernel-assigned.
    pub local_listen_port: u16,
    /// 0 means server-mode, unknown until the peer connects.
    pub peer_listen_port: u16,
    pub mode: WireGuardMode,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind")]
pub enum TunnelKind {
    GreIpsec(GreIpsecParams),
    WireGuard(WireGuardParams),
}

/// A single point-to-point tunnel link, GRE-over-IPsec or WireGuard.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TunnelRecord {
    /// Matches the created link name.
    pub name: String,
    pub kind: TunnelKind,
    /// Name of the physical or tunnel interface this tunnel rides on.
    pub parent: String,
    pub local_underlay_ip: Ipv4Addr,
    /// `0.0.0.0` sentinel for WireGuard server mode until the peer connects.
    pub remote_underlay_ip: Ipv4Addr,
    pub local_virtual_ip: Ipv4Addr,
    pub remote_virtual_ip: Ipv4Addr,
    pub cost: u8,
    pub enabled: bool,
    /// Last underlay IP for which a protection rule was installed; used by
    /// SyncProtection to detect drift and avoid redundant kernel calls.
    pub protected_underlay_ip: Option<Ipv4Addr>,
    /// Unix timestamp of the last time `protected_underlay_ip` changed; used
    /// by SyncProtection's minimum-dwell damping to reject a peer-migration
    /// flood (see `protection_min_dwell` in the global config).
    #[serde(default)]
    pub protected_since: Option<u64>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("tunnel name must match the created link name")]
    NameMismatch,
    #[error("local and remote underlay IPs must differ")]
    UnderlayIpCollision,
    #[error("local and remote virtual IPs must differ")]
    VirtualIpCollision,
}

impl TunnelRecord {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.local_underlay_ip == self.remote_underlay_ip {
            return Err(ValidationError::UnderlayIpCollision);
        }
        if self.local_virtual_ip == self.remote_virtual_ip {
            return Err(ValidationError::VirtualIpCollision);
        }
        Ok(())
    }

    /// `true` while a WireGuard server tunnel's peer hasn't connected yet.
    pub fn remote_underlay_unknown(&self) -> bool {
        matches!(&self.kind, TunnelKind::WireGuard(p) if p.mode == WireGuardMode::Server)
            && self.remote_underlay_ip == WIREGUARD_SERVER_SENTINEL
    }

    pub fn set_cost(&mut self, cost: u8) -> Result<(), crate::iface::CostError> {
        crate::iface::validate_cost(cost)?;
        self.cost = cost;
        Ok(())
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }
}
