//! Policy-routing engine (C6): applies/revokes policy groups and the
//! default-route binding, and keeps per-tunnel protection rules in sync
//! with reality.

use std::net::Ipv4Addr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

use overlayd_core::iface::{Class, PhysicalInterface};
use overlayd_core::policy::{DefaultRouteBinding, FromSelector, PolicyGroup};
use overlayd_core::priority::{PREF_PROTECTION, TABLE_PROTECTION, PREF_DEFAULT, TABLE_DEFAULT};
use overlayd_core::registry::{self, Registry};
use overlayd_core::tunnel::{TunnelRecord, WIREGUARD_SERVER_SENTINEL};

use crate::kernel::Kernel;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Kernel(#[from] crate::kernel::Error),
    #[error(transparent)]
    Registry(#[from] registry::Error),
    #[error("exit interface {0} does not exist or is not up")]
    InvalidExit(String),
    #[error("from-selector refers to an unmanaged third-party device: {0}")]
    UnresolvableThirdParty(String),
}

/// Next-hop form for a given exit class: either `via <gw> dev <iface>` or a
/// bare `dev <iface>`.
fn next_hop(exit_class: Class, gateway: Option<Ipv4Addr>) -> Option<Ipv4Addr> {
    if exit_class.needs_gateway(gateway.is_some()) {
        gateway
    } else {
        None
    }
}

/// Applies a single policy group: flush its table, install its CIDRs with
/// the exit's next-hop form, then install exactly one selector rule at its
/// priority. `from` is the already-resolved selector clause (see
/// [`resolve_from_selector`]) — `None` for "all".
pub async fn apply_group<K: Kernel>(
    kernel: &K,
    group: &PolicyGroup,
    exit_class: Class,
    exit_gateway: Option<Ipv4Addr>,
    from: Option<&str>,
) -> Result<(), Error> {
    let table = group.priority;
    kernel.route_flush_table(table).await?;

    let via = next_hop(exit_class, exit_gateway);
    for cidr in &group.destinations {
        kernel.route_add(&cidr.to_string(), via, &group.exit, table, false).await?;
    }

    install_unique_rule(kernel, group.priority, table, from).await?;
    Ok(())
}

/// Deletes at `pref` repeatedly until no rule remains, then re-adds exactly
/// one. The kernel allows duplicate rules at the same pref; this discipline
/// guarantees the invariant "exactly one rule at pref P -> table P" holds
/// regardless of how many duplicates had accumulated.
async fn install_unique_rule<K: Kernel>(kernel: &K, pref: u32, table: u32, from: Option<&str>) -> Result<(), Error> {
    loop {
        let existing = kernel.rule_list_at_pref(pref).await?;
        if existing.is_empty() {
            break;
        }
        kernel.rule_del_at_pref(pref, table).await?;
    }
    kernel.rule_add(pref, table, from, None).await?;
    Ok(())
}

pub async fn revoke_group<K: Kernel>(kernel: &K, group: &PolicyGroup) -> Result<(), Error> {
    kernel.rule_del_at_pref(group.priority, group.priority).await?;
    kernel.route_flush_table(group.priority).await?;
    Ok(())
}

pub async fn apply_default<K: Kernel>(kernel: &K, exit: &str, exit_class: Class, exit_gateway: Option<Ipv4Addr>) -> Result<(), Error> {
    kernel.route_flush_table(TABLE_DEFAULT).await?;
    let via = next_hop(exit_class, exit_gateway);
    kernel.route_add("default", via, exit, TABLE_DEFAULT, false).await?;
    install_unique_rule(kernel, PREF_DEFAULT, TABLE_DEFAULT, None).await?;
    Ok(())
}

pub async fn revoke_default<K: Kernel>(kernel: &K) -> Result<(), Error> {
    kernel.rule_del_at_pref(PREF_DEFAULT, TABLE_DEFAULT).await?;
    kernel.route_flush_table(TABLE_DEFAULT).await?;
    Ok(())
}

/// Validates every group's exit (exists, up, non-loopback), skipping
/// invalid ones with a warning rather than aborting. Runs SyncProtection
/// first, applies every valid group, then the default binding if set, then
/// flushes the route cache.
pub async fn apply_all<K: Kernel>(
    kernel: &K,
    groups: &Registry<PolicyGroup>,
    tunnels: &Registry<TunnelRecord>,
    physicals: &Registry<PhysicalInterface>,
    default_binding: &DefaultRouteBinding,
    protection_min_dwell: Duration,
) -> Result<(), Error> {
    sync_protection(kernel, tunnels, protection_min_dwell).await?;

    for name in groups.list()? {
        let group = groups.load(&name)?;
        match resolve_exit(&group.exit, tunnels, physicals).await {
            Ok((class, gateway)) => match resolve_from_selector(&group.from, tunnels, physicals) {
                Ok(from) => {
                    if let Err(err) = apply_group(kernel, &group, class, gateway, from.as_deref()).await {
                        tracing::warn!(group = %group.name, %err, "failed to apply policy group");
                    }
                }
                Err(err) => {
                    tracing::warn!(group = %group.name, %err, "skipping policy group with unresolvable from-selector");
                }
            },
            Err(err) => {
                tracing::warn!(group = %group.name, exit = %group.exit, %err, "skipping policy group with invalid exit");
            }
        }
    }

    if let Some(exit) = &default_binding.exit {
        match resolve_exit(exit, tunnels, physicals).await {
            Ok((class, gateway)) => apply_default(kernel, exit, class, gateway).await?,
            Err(err) => tracing::warn!(%exit, %err, "skipping default binding with invalid exit"),
        }
    }

    kernel.route_flush_cache().await?;
    Ok(())
}

async fn resolve_exit(
    name: &str,
    tunnels: &Registry<TunnelRecord>,
    physicals: &Registry<PhysicalInterface>,
) -> Result<(Class, Option<Ipv4Addr>), Error> {
    if let Ok(physical) = physicals.load(name) {
        if !physical.enabled {
            return Err(Error::InvalidExit(name.to_string()));
        }
        return Ok((Class::PhysicalManaged, physical.gateway));
    }
    if let Ok(tunnel) = tunnels.load(name) {
        if !tunnel.enabled {
            return Err(Error::InvalidExit(name.to_string()));
        }
        return Ok((Class::TunnelManaged, None));
    }
    let gateway = crate::ifinventory::third_party_gateway(name).await.ok().flatten();
    Ok((Class::ThirdParty, gateway))
}

/// Resolves a group's `From` selector to the concrete `from` clause used in
/// its rule. "all" drops the clause; a CIDR/IP passes through; an interface
/// name resolves to the peer's virtual IP (managed tunnel) or the primary
/// IP (managed physical) — a third-party device is refused.
pub fn resolve_from_selector(
    selector: &FromSelector,
    tunnels: &Registry<TunnelRecord>,
    physicals: &Registry<PhysicalInterface>,
) -> Result<Option<String>, Error> {
    match selector {
        FromSelector::All => Ok(None),
        FromSelector::Cidr(c) => Ok(Some(c.to_string())),
        FromSelector::InterfaceName(name) => {
            if let Ok(tunnel) = tunnels.load(name) {
                return Ok(Some(format!("{}/32", tunnel.remote_virtual_ip)));
            }
            if let Ok(physical) = physicals.load(name) {
                return Ok(Some(format!("{}/32", physical.address)));
            }
            Err(Error::UnresolvableThirdParty(name.clone()))
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// Invariant restorer. For each tunnel: resolve its current remote underlay
/// IP, diff against the stored protected-underlay-IP, and reconcile. Then
/// scans pref 10 and deletes any entry whose target IP isn't in the
/// just-computed valid set, cleaning up zombie protection rules left by
/// removed tunnels.
///
/// `min_dwell` damps a WireGuard server peer migrating faster than that
/// interval: a candidate IP change within the dwell window is logged and
/// skipped rather than accepted, so a flapping peer can't thrash the
/// protection rule every cycle.
pub async fn sync_protection<K: Kernel>(kernel: &K, tunnels: &Registry<TunnelRecord>, min_dwell: Duration) -> Result<(), Error> {
    let mut valid_ips = Vec::new();
    let now = unix_now();

    for name in tunnels.list()? {
        let mut tunnel = tunnels.load(&name)?;
        let current_ip = if tunnel.remote_underlay_unknown() {
            match kernel.wg_peer_endpoint(&tunnel.name).await {
                Ok(Some(ip)) => ip,
                _ => continue, // peer hasn't connected yet; nothing to protect
            }
        } else {
            tunnel.remote_underlay_ip
        };

        if current_ip == WIREGUARD_SERVER_SENTINEL {
            continue;
        }

        match tunnel.protected_underlay_ip {
            Some(old_ip) if old_ip != current_ip => {
                let elapsed = tunnel.protected_since.map(|since| now.saturating_sub(since)).unwrap_or(u64::MAX);
                if elapsed < min_dwell.as_secs() {
                    tracing::warn!(
                        tunnel = %name,
                        old = %old_ip,
                        new = %current_ip,
                        elapsed_secs = elapsed,
                        min_dwell_secs = min_dwell.as_secs(),
                        "peer migration arrived before minimum dwell time; keeping current protection rule"
                    );
                    valid_ips.push(old_ip);
                    continue;
                }
                kernel.rule_del_at_pref(PREF_PROTECTION, TABLE_PROTECTION).await?;
                kernel
                    .rule_add(PREF_PROTECTION, TABLE_PROTECTION, None, Some(&current_ip.to_string()))
                    .await?;
                tunnel.protected_since = Some(now);
            }
            Some(_) => {}
            None => {
                kernel
                    .rule_add(PREF_PROTECTION, TABLE_PROTECTION, None, Some(&current_ip.to_string()))
                    .await?;
                tunnel.protected_since = Some(now);
            }
        }
        valid_ips.push(current_ip);
        tunnel.protected_underlay_ip = Some(current_ip);
        tunnels.save(&name, &tunnel)?;
    }

    let entries = kernel.rule_list_at_pref(PREF_PROTECTION).await?;
    for entry in entries {
        let Some(to) = &entry.to else { continue };
        let to_ip: Option<Ipv4Addr> = to.parse().ok();
        if !to_ip.is_some_and(|ip| valid_ips.contains(&ip)) {
            kernel.rule_del_at_pref(PREF_PROTECTION, entry.table).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::mocks::FakeKernel;
    use overlayd_core::tunnel::{GreIpsecParams, TunnelKind};

    fn sample_tunnel(name: &str, remote: &str, protected: Option<&str>) -> TunnelRecord {
        TunnelRecord {
            name: name.into(),
            kind: TunnelKind::GreIpsec(GreIpsecParams {
                auth_key: "0xabc".into(),
                enc_key: "0xdef".into(),
            }),
            parent: "eth0".into(),
            local_underlay_ip: "10.0.0.1".parse().unwrap(),
            remote_underlay_ip: remote.parse().unwrap(),
            local_virtual_ip: "192.168.99.1".parse().unwrap(),
            remote_virtual_ip: "192.168.99.2".parse().unwrap(),
            cost: 0,
            enabled: true,
            protected_underlay_ip: protected.map(|p| p.parse().unwrap()),
            protected_since: None,
        }
    }

    #[tokio::test]
    async fn apply_group_installs_one_rule_and_routes() {
        let kernel = FakeKernel::new();
        let group = PolicyGroup {
            name: "g1".into(),
            priority: 150,
            exit: "tun01".into(),
            destinations: vec!["8.8.8.8/32".parse().unwrap()],
            from: FromSelector::Cidr("10.0.0.0/24".parse().unwrap()),
        };

        apply_group(&kernel, &group, Class::TunnelManaged, None, Some("10.0.0.0/24"))
            .await
            .unwrap();

        let state = kernel.state.lock().unwrap();
        assert_eq!(state.rules.get(&150).unwrap().len(), 1);
        assert!(state.routes.get(&150).unwrap().iter().any(|r| r.contains("8.8.8.8/32")));
    }

    #[tokio::test]
    async fn install_unique_rule_dedupes_existing_duplicates() {
        let kernel = FakeKernel::new();
        kernel.rule_add(150, 150, None, None).await.unwrap();
        kernel.rule_add(150, 150, None, None).await.unwrap();
        kernel.rule_add(150, 150, None, None).await.unwrap();

        install_unique_rule(&kernel, 150, 150, None).await.unwrap();

        assert_eq!(kernel.rule_list_at_pref(150).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn sync_protection_installs_rule_for_new_tunnel() {
        let kernel = FakeKernel::new();
        let dir = tempfile::tempdir().unwrap();
        let tunnels: Registry<TunnelRecord> = Registry::new(dir.path()).unwrap();
        tunnels.create("tun01", &sample_tunnel("tun01", "10.0.0.2", None)).unwrap();

        sync_protection(&kernel, &tunnels, Duration::from_secs(0)).await.unwrap();

        let state = kernel.state.lock().unwrap();
        let rules = state.rules.get(&PREF_PROTECTION).unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].to.as_deref(), Some("10.0.0.2"));
        drop(state);

        let updated = tunnels.load("tun01").unwrap();
        assert_eq!(updated.protected_underlay_ip, Some("10.0.0.2".parse().unwrap()));
    }

    #[tokio::test]
    async fn sync_protection_replaces_rule_on_ip_change() {
        let kernel = FakeKernel::new();
        let dir = tempfile::tempdir().unwrap();
        let tunnels: Registry<TunnelRecord> = Registry::new(dir.path()).unwrap();
        tunnels
            .create("tun01", &sample_tunnel("tun01", "10.0.0.9", Some("10.0.0.9")))
            .unwrap();
        kernel
            .rule_add(PREF_PROTECTION, TABLE_PROTECTION, None, Some("10.0.0.9"))
            .await
            .unwrap();

        // simulate the peer reconnecting from a new address
        let mut tunnel = tunnels.load("tun01").unwrap();
        tunnel.remote_underlay_ip = "10.0.0.42".parse().unwrap();
        tunnels.save("tun01", &tunnel).unwrap();

        sync_protection(&kernel, &tunnels, Duration::from_secs(0)).await.unwrap();

        let state = kernel.state.lock().unwrap();
        let rules = state.rules.get(&PREF_PROTECTION).unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].to.as_deref(), Some("10.0.0.42"));
    }

    #[tokio::test]
    async fn sync_protection_damps_migration_within_min_dwell() {
        let kernel = FakeKernel::new();
        let dir = tempfile::tempdir().unwrap();
        let tunnels: Registry<TunnelRecord> = Registry::new(dir.path()).unwrap();
        let mut tunnel = sample_tunnel("tun01", "10.0.0.9", Some("10.0.0.9"));
        tunnel.protected_since = Some(unix_now());
        tunnels.create("tun01", &tunnel).unwrap();
        kernel
            .rule_add(PREF_PROTECTION, TABLE_PROTECTION, None, Some("10.0.0.9"))
            .await
            .unwrap();

        let mut tunnel = tunnels.load("tun01").unwrap();
        tunnel.remote_underlay_ip = "10.0.0.42".parse().unwrap();
        tunnels.save("tun01", &tunnel).unwrap();

        // dwell window just started: a migration this soon is damped
        sync_protection(&kernel, &tunnels, Duration::from_secs(3600)).await.unwrap();

        let state = kernel.state.lock().unwrap();
        let rules = state.rules.get(&PREF_PROTECTION).unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].to.as_deref(), Some("10.0.0.9"), "old rule kept until dwell elapses");
    }

    #[tokio::test]
    async fn sync_protection_prunes_zombie_rules() {
        let kernel = FakeKernel::new();
        let dir = tempfile::tempdir().unwrap();
        let tunnels: Registry<TunnelRecord> = Registry::new(dir.path()).unwrap();
        // a rule with no matching tunnel record at all
        kernel
            .rule_add(PREF_PROTECTION, TABLE_PROTECTION, None, Some("192.0.2.1"))
            .await
            .unwrap();

        sync_protection(&kernel, &tunnels, Duration::from_secs(0)).await.unwrap();

        let state = kernel.state.lock().unwrap();
        assert!(state.rules.get(&PREF_PROTECTION).unwrap().is_empty());
    }
}
