//! Interface inventory (C2): discovers physical NICs at host bootstrap and
//! classifies any interface name the rest of the system asks about.

use std::net::Ipv4Addr;
use thiserror::Error;
use tokio::process::Command;

use overlayd_core::iface::{Class, PhysicalInterface};
use overlayd_core::registry::{self, Registry};
use overlayd_core::shell_command_ext::{self, Logs, ShellCommandExt};

/// Name prefixes recognized as physical NICs during `scan`.
const PHYSICAL_PREFIXES: &[&str] = &["eth", "ens", "enp", "eno", "em", "p"];

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    ShellCommand(#[from] shell_command_ext::Error),
    #[error(transparent)]
    Registry(#[from] registry::Error),
    #[error("parent interface {0} is neither a registered physical interface nor a tunnel")]
    UnknownParent(String),
}

/// Enumerates link-layer interfaces, retaining those with a recognized
/// physical-NIC name prefix and at least one IPv4 address.
pub async fn scan() -> Result<Vec<PhysicalInterface>, Error> {
    let link_names = list_link_names().await?;
    let mut found = Vec::new();
    for name in link_names {
        if name == "lo" || !PHYSICAL_PREFIXES.iter().any(|p| name.starts_with(p)) {
            continue;
        }
        let Some(address) = primary_ipv4(&name).await? else {
            continue;
        };
        let gateway = link_gateway(&name).await?;
        found.push(PhysicalInterface {
            name,
            address,
            gateway,
            enabled: true,
            cost: 0,
        });
    }
    Ok(found)
}

async fn list_link_names() -> Result<Vec<String>, Error> {
    let output = Command::new("ip")
        .args(["-o", "link", "show"])
        .run_stdout(Logs::Print)
        .await?;
    Ok(output
        .lines()
        .filter_map(|line| {
            let rest = line.splitn(2, ": ").nth(1)?;
            rest.split(':').next().map(|s| s.trim().to_string())
        })
        .collect())
}

async fn primary_ipv4(dev: &str) -> Result<Option<Ipv4Addr>, Error> {
    let output = Command::new("ip")
        .args(["-o", "-4", "addr", "show", "dev", dev])
        .run_stdout(Logs::Print)
        .await?;
    Ok(output.lines().find_map(|line| {
        let mut tokens = line.split_whitespace();
        while let Some(tok) = tokens.next() {
            if tok == "inet" {
                let cidr = tokens.next()?;
                return cidr.split('/').next()?.parse().ok();
            }
        }
        None
    }))
}

/// First route on `dev` with a non-empty gateway.
async fn link_gateway(dev: &str) -> Result<Option<Ipv4Addr>, Error> {
    let output = Command::new("ip")
        .args(["route", "show", "dev", dev])
        .run_stdout(Logs::Print)
        .await?;
    Ok(output.lines().find_map(|line| {
        let mut tokens = line.split_whitespace();
        while let Some(tok) = tokens.next() {
            if tok == "via" {
                return tokens.next()?.parse().ok();
            }
        }
        None
    }))
}

/// Classifies `name` against the saved physical inventory and the tunnel
/// registry. Third-party gateway discovery reuses [`link_gateway`] directly
/// against the live kernel rather than any saved record.
pub async fn classify(
    name: &str,
    physicals: &Registry<PhysicalInterface>,
    tunnels: &Registry<overlayd_core::tunnel::TunnelRecord>,
) -> Class {
    if name == "lo" {
        return Class::Loopback;
    }
    if physicals.exists(name) {
        return Class::PhysicalManaged;
    }
    if tunnels.exists(name) {
        return Class::TunnelManaged;
    }
    Class::ThirdParty
}

/// Resolves a new tunnel's local underlay IP from its declared parent: a
/// managed physical interface's primary address, or a parent tunnel's local
/// virtual IP. The caller is responsible for enforcing that a tunnel parent
/// is enabled.
pub fn resolve_local_underlay(
    parent: &str,
    physicals: &Registry<PhysicalInterface>,
    tunnels: &Registry<overlayd_core::tunnel::TunnelRecord>,
) -> Result<Ipv4Addr, Error> {
    if let Ok(physical) = physicals.load(parent) {
        return Ok(physical.address);
    }
    if let Ok(parent_tunnel) = tunnels.load(parent) {
        return Ok(parent_tunnel.local_virtual_ip);
    }
    Err(Error::UnknownParent(parent.to_string()))
}

/// Gateway for an interface not tracked by either registry: scans `ip route`
/// for a `via` clause on that device.
pub async fn third_party_gateway(name: &str) -> Result<Option<Ipv4Addr>, Error> {
    link_gateway(name).await
}

/// Re-derives each saved physical interface's gateway from the live kernel
/// and persists it if it drifted. Run before the status reporter renders so
/// a DHCP-renewed gateway doesn't show stale.
pub async fn refresh(physicals: &Registry<PhysicalInterface>) -> Result<usize, Error> {
    let mut changed = 0;
    for name in physicals.list()? {
        let mut iface = physicals.load(&name)?;
        let current = link_gateway(&name).await?;
        if current != iface.gateway {
            iface.gateway = current;
            physicals.save(&name, &iface)?;
            changed += 1;
        }
    }
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_physical_prefixes() {
        for name in ["eth0", "ens3", "enp0s31f6", "eno1", "em1", "p1p1"] {
            assert!(PHYSICAL_PREFIXES.iter().any(|p| name.starts_with(p)), "{name}");
        }
        assert!(!PHYSICAL_PREFIXES.iter().any(|p| "tun01".starts_with(p)));
        assert!(!PHYSICAL_PREFIXES.iter().any(|p| "wg0".starts_with(p)));
    }

    #[tokio::test]
    async fn classify_prefers_physical_then_tunnel_then_third_party() {
        let dir = tempfile::tempdir().unwrap();
        let physicals: Registry<PhysicalInterface> = Registry::new(dir.path().join("phys")).unwrap();
        let tunnels: Registry<overlayd_core::tunnel::TunnelRecord> = Registry::new(dir.path().join("tun")).unwrap();

        physicals
            .create(
                "eth0",
                &PhysicalInterface {
                    name: "eth0".into(),
                    address: "10.0.0.1".parse().unwrap(),
                    gateway: None,
                    enabled: true,
                    cost: 0,
                },
            )
            .unwrap();

        assert_eq!(classify("lo", &physicals, &tunnels).await, Class::Loopback);
        assert_eq!(classify("eth0", &physicals, &tunnels).await, Class::PhysicalManaged);
        assert_eq!(classify("wg0", &physicals, &tunnels).await, Class::ThirdParty);
    }

    #[test]
    fn resolve_local_underlay_prefers_physical_then_parent_tunnel() {
        let dir = tempfile::tempdir().unwrap();
        let physicals: Registry<PhysicalInterface> = Registry::new(dir.path().join("phys")).unwrap();
        let tunnels: Registry<overlayd_core::tunnel::TunnelRecord> = Registry::new(dir.path().join("tun")).unwrap();

        physicals
            .create(
                "eth0",
                &PhysicalInterface {
                    name: "eth0".into(),
                    address: "10.0.0.1".parse().unwrap(),
                    gateway: None,
                    enabled: true,
                    cost: 0,
                },
            )
            .unwrap();
        assert_eq!(
            resolve_local_underlay("eth0", &physicals, &tunnels).unwrap(),
            "10.0.0.1".parse().unwrap()
        );

        assert!(matches!(
            resolve_local_underlay("missing", &physicals, &tunnels),
            Err(Error::UnknownParent(_))
        ));
    }
}
