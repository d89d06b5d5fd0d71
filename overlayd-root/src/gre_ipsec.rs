//! GRE-over-IPsec driver (C4): SPI/key derivation, XFRM state and policy
//! installation, GRE link creation, and the liveness probe that follows.

use std::net::Ipv4Addr;
use std::path::Path;
use thiserror::Error;

use overlayd_core::keys::{self, SpiPair};
use overlayd_core::priority::{PREF_OVERLAY_VIP, TABLE_OVERLAY_VIP};
use overlayd_core::tunnel::{GreIpsecParams, TunnelRecord};

use crate::kernel::{Direction, Kernel};
use crate::revfile::{RevCommand, RevFile};

/// GRE tunnels carry an MTU of 1400 to leave headroom for the IPsec/GRE
/// encapsulation overhead.
pub const GRE_MTU: u32 = 1400;
const GRE_TTL: u8 = 255;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Kernel(#[from] crate::kernel::Error),
    #[error(transparent)]
    RevFile(#[from] crate::revfile::Error),
    #[error("neither endpoint of the tunnel is local")]
    NoLocalEndpoint,
}

/// Derives both endpoints' shared SPI pair and key material from the auth
/// and enc passphrases, already hashed into `GreIpsecParams`.
pub fn derive_spi(local: Ipv4Addr, remote: Ipv4Addr) -> SpiPair {
    keys::spi_pair(local, remote)
}

pub fn derive_gre_key(params: &GreIpsecParams) -> u32 {
    keys::gre_key(&params.auth_key)
}

/// Stable rev-file artifact name for an endpoint pair: sorted so both sides
/// of the tunnel key to the same file name even though "local" differs.
pub fn rev_artifact_name(local: Ipv4Addr, remote: Ipv4Addr) -> String {
    let (low, high) = if local.octets() <= remote.octets() {
        (local, remote)
    } else {
        (remote, local)
    };
    format!("ipsec-{low}-{high}")
}

/// Runs the full create sequence for `record`. `record.local_underlay_ip`
/// must be an address owned by this host; the caller is expected to have
/// validated that before calling.
pub async fn create<K: Kernel>(kernel: &K, rev_dir: &Path, record: &TunnelRecord, params: &GreIpsecParams) -> Result<(), Error> {
    let local = record.local_underlay_ip;
    let remote = record.remote_underlay_ip;

    let mut rev = RevFile::open(rev_dir, &rev_artifact_name(local, remote))?;
    rev.execute_teardown(kernel).await;
    let mut rev = RevFile::open(rev_dir, &rev_artifact_name(local, remote))?;

    let spi = derive_spi(local, remote);
    let gre_key = derive_gre_key(params);

    kernel
        .xfrm_state_add(local, remote, spi.spi_one, &params.auth_key, &params.enc_key)
        .await?;
    rev.push(RevCommand::XfrmStateDel {
        src: local,
        dst: remote,
        spi: spi.spi_one,
    })?;

    kernel
        .xfrm_state_add(remote, local, spi.spi_two, &params.auth_key, &params.enc_key)
        .await?;
    rev.push(RevCommand::XfrmStateDel {
        src: remote,
        dst: local,
        spi: spi.spi_two,
    })?;

    kernel.xfrm_policy_add(local, remote, Direction::Out, spi.spi_one).await?;
    rev.push(RevCommand::XfrmPolicyDel {
        src: local,
        dst: remote,
        dir: Direction::Out,
    })?;

    kernel.xfrm_policy_add(remote, local, Direction::In, spi.spi_two).await?;
    rev.push(RevCommand::XfrmPolicyDel {
        src: remote,
        dst: local,
        dir: Direction::In,
    })?;

    kernel.link_add_gre(&record.name, local, remote, gre_key, GRE_TTL).await?;
    rev.push(RevCommand::LinkDel(record.name.clone()))?;

    kernel.addr_add(&record.name, record.local_virtual_ip, 32).await?;
    rev.push(RevCommand::AddrDel {
        dev: record.name.clone(),
        addr: record.local_virtual_ip,
        prefix_len: 32,
    })?;

    kernel.link_set_up(&record.name, Some(GRE_MTU)).await?;

    ensure_shared_overlay_rule(kernel).await?;

    let dest = format!("{}/32", record.remote_virtual_ip);
    kernel
        .route_add(&dest, None, &record.name, TABLE_OVERLAY_VIP, false)
        .await?;
    rev.push(RevCommand::RouteDel {
        dest,
        table: TABLE_OVERLAY_VIP,
    })?;

    check_liveness(kernel, remote).await;

    Ok(())
}

/// Installs `from all lookup 80 pref 80` if it isn't already present. Shared
/// across every tunnel, so it's never part of any single tunnel's rev file.
pub async fn ensure_shared_overlay_rule<K: Kernel>(kernel: &K) -> Result<(), Error> {
    let existing = kernel.rule_list_at_pref(PREF_OVERLAY_VIP).await?;
    if existing.iter().any(|r| r.table == TABLE_OVERLAY_VIP) {
        return Ok(());
    }
    kernel.rule_add(PREF_OVERLAY_VIP, TABLE_OVERLAY_VIP, None, None).await?;
    Ok(())
}

/// An ICMP echo to the remote underlay; failure is logged as a warning,
/// never surfaced as an error, since the remote side may not be up yet.
async fn check_liveness<K: Kernel>(kernel: &K, remote: Ipv4Addr) {
    match kernel.ping(remote, 3, std::time::Duration::from_millis(200)).await {
        Ok((sent, received, _)) if received > 0 => {
            tracing::info!(%remote, sent, received, "remote underlay reachable after create");
        }
        Ok((sent, received, _)) => {
            tracing::warn!(%remote, sent, received, "remote underlay not yet reachable");
        }
        Err(err) => {
            tracing::warn!(%remote, %err, "liveness probe failed");
        }
    }
}

/// Reverses every kernel mutation `create` made, via the same rev file.
pub async fn destroy<K: Kernel>(kernel: &K, rev_dir: &Path, local: Ipv4Addr, remote: Ipv4Addr) -> Result<(), Error> {
    let mut rev = RevFile::open(rev_dir, &rev_artifact_name(local, remote))?;
    rev.execute_teardown(kernel).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::mocks::FakeKernel;
    use overlayd_core::tunnel::TunnelKind;

    fn sample_record() -> TunnelRecord {
        TunnelRecord {
            name: "tun01".into(),
            kind: TunnelKind::GreIpsec(GreIpsecParams {
                auth_key: keys::hash_passphrase("abc"),
                enc_key: keys::hash_passphrase("def"),
            }),
            parent: "eth0".into(),
            local_underlay_ip: "10.0.0.1".parse().unwrap(),
            remote_underlay_ip: "10.0.0.2".parse().unwrap(),
            local_virtual_ip: "192.168.99.1".parse().unwrap(),
            remote_virtual_ip: "192.168.99.2".parse().unwrap(),
            cost: 0,
            enabled: true,
            protected_underlay_ip: None,
            protected_since: None,
        }
    }

    #[test]
    fn rev_artifact_name_is_order_independent() {
        let a: Ipv4Addr = "10.0.0.1".parse().unwrap();
        let b: Ipv4Addr = "10.0.0.2".parse().unwrap();
        assert_eq!(rev_artifact_name(a, b), rev_artifact_name(b, a));
    }

    #[test]
    fn spi_and_gre_key_are_symmetric_for_both_endpoints() {
        let record = sample_record();
        let TunnelKind::GreIpsec(params) = &record.kind else {
            unreachable!()
        };
        let spi_forward = derive_spi(record.local_underlay_ip, record.remote_underlay_ip);
        let spi_backward = derive_spi(record.remote_underlay_ip, record.local_underlay_ip);
        assert_eq!(spi_forward, spi_backward);
        assert_eq!(derive_gre_key(params), keys::gre_key(&params.auth_key));
    }

    #[tokio::test]
    async fn create_installs_xfrm_link_addr_and_route() {
        let kernel = FakeKernel::new();
        let dir = tempfile::tempdir().unwrap();
        let record = sample_record();
        let TunnelKind::GreIpsec(params) = &record.kind else {
            unreachable!()
        };

        create(&kernel, dir.path(), &record, params).await.unwrap();

        let state = kernel.state.lock().unwrap();
        assert_eq!(state.links, vec!["tun01"]);
        assert_eq!(state.xfrm_states.len(), 2);
        assert_eq!(state.xfrm_policies.len(), 2);
        assert!(state.addrs.contains(&("tun01".to_string(), record.local_virtual_ip, 32)));
        assert!(state.routes.get(&TABLE_OVERLAY_VIP).unwrap().iter().any(|r| r.contains("192.168.99.2")));
    }

    #[tokio::test]
    async fn destroy_undoes_every_create_mutation() {
        let kernel = FakeKernel::new();
        let dir = tempfile::tempdir().unwrap();
        let record = sample_record();
        let TunnelKind::GreIpsec(params) = &record.kind else {
            unreachable!()
        };

        create(&kernel, dir.path(), &record, params).await.unwrap();
        destroy(&kernel, dir.path(), record.local_underlay_ip, record.remote_underlay_ip)
            .await
            .unwrap();

        let state = kernel.state.lock().unwrap();
        assert!(state.links.is_empty());
        assert!(state.xfrm_states.is_empty());
        assert!(state.xfrm_policies.is_empty());
    }
}
