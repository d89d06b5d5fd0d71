//! Handlers for `overlayd tunnel ...`.

use std::net::Ipv4Addr;

use overlayd_core::keys;
use overlayd_core::tunnel::{GreIpsecParams, TunnelKind, TunnelRecord, WireGuardMode, WireGuardParams, WIREGUARD_SERVER_SENTINEL};
use overlayd_root::{gre_ipsec, ifinventory, wireguard};

use crate::cli::WgMode;
use crate::context::Context;
use crate::error::AppError;

fn require_enabled_parent(ctx: &Context, parent: &str) -> Result<(), AppError> {
    if let Ok(physical) = ctx.physicals.load(parent) {
        if !physical.enabled {
            return Err(AppError::DisabledParent(parent.to_string()));
        }
        return Ok(());
    }
    if let Ok(tunnel) = ctx.tunnels.load(parent) {
        if !tunnel.enabled {
            return Err(AppError::DisabledParent(parent.to_string()));
        }
        return Ok(());
    }
    Err(AppError::Ifinventory(ifinventory::Error::UnknownParent(parent.to_string())))
}

#[allow(clippy::too_many_arguments)]
pub async fn create_gre_ipsec(
    ctx: &Context,
    name: &str,
    parent: &str,
    remote_underlay: Ipv4Addr,
    local_virtual: Ipv4Addr,
    remote_virtual: Ipv4Addr,
    auth_secret: &str,
    enc_secret: &str,
    cost: u8,
) -> Result<(), AppError> {
    require_enabled_parent(ctx, parent)?;
    let local_underlay = ifinventory::resolve_local_underlay(parent, &ctx.physicals, &ctx.tunnels)?;

    let params = GreIpsecParams {
        auth_key: keys::hash_passphrase(auth_secret),
        enc_key: keys::hash_passphrase(enc_secret),
    };
    let record = TunnelRecord {
        name: name.to_string(),
        kind: TunnelKind::GreIpsec(params.clone()),
        parent: parent.to_string(),
        local_underlay_ip: local_underlay,
        remote_underlay_ip: remote_underlay,
        local_virtual_ip: local_virtual,
        remote_virtual_ip: remote_virtual,
        cost,
        enabled: true,
        protected_underlay_ip: None,
        protected_since: None,
    };
    record.validate()?;

    ctx.tunnels.create(name, &record)?;
    gre_ipsec::create(&ctx.kernel, &ctx.rev_dir(), &record, &params).await?;
    tracing::info!(tunnel = name, "created GRE/IPsec tunnel");
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub async fn create_wireguard(
    ctx: &Context,
    name: &str,
    parent: &str,
    mode: WgMode,
    remote_underlay: Option<Ipv4Addr>,
    peer_public_key: &str,
    local_virtual: Ipv4Addr,
    remote_virtual: Ipv4Addr,
    listen_port: u16,
    peer_port: u16,
    cost: u8,
) -> Result<(), AppError> {
    require_enabled_parent(ctx, parent)?;
    let local_underlay = ifinventory::resolve_local_underlay(parent, &ctx.physicals, &ctx.tunnels)?;

    let wg_mode = match mode {
        WgMode::Server => WireGuardMode::Server,
        WgMode::Client => WireGuardMode::Client,
    };
    let remote = match wg_mode {
        WireGuardMode::Server => remote_underlay.unwrap_or(WIREGUARD_SERVER_SENTINEL),
        WireGuardMode::Client => remote_underlay.ok_or(AppError::MissingRemoteUnderlay)?,
    };

    let keypair = keys::generate_keypair();
    let params = WireGuardParams {
        private_key: keypair.private_key,
        public_key: keypair.public_key,
        peer_public_key: peer_public_key.to_string(),
        local_listen_port: listen_port,
        peer_listen_port: peer_port,
        mode: wg_mode,
    };
    let record = TunnelRecord {
        name: name.to_string(),
        kind: TunnelKind::WireGuard(params.clone()),
        parent: parent.to_string(),
        local_underlay_ip: local_underlay,
        remote_underlay_ip: remote,
        local_virtual_ip: local_virtual,
        remote_virtual_ip: remote_virtual,
        cost,
        enabled: true,
        protected_underlay_ip: None,
        protected_since: None,
    };
    record.validate()?;

    let conflict = wireguard::detect_conflict(name).await;
    if conflict.any() {
        tracing::warn!(tunnel = name, ?conflict, "wg-quick conflict detected; proceeding anyway");
    }

    ctx.tunnels.create(name, &record)?;
    wireguard::create(&ctx.kernel, &ctx.rev_dir(), &record, &params).await?;
    tracing::info!(tunnel = name, public_key = %record_public_key(&record), "created WireGuard tunnel");
    Ok(())
}

fn record_public_key(record: &TunnelRecord) -> String {
    match &record.kind {
        TunnelKind::WireGuard(p) => p.public_key.clone(),
        TunnelKind::GreIpsec(_) => String::new(),
    }
}

pub async fn destroy(ctx: &Context, name: &str) -> Result<(), AppError> {
    let record = ctx.tunnels.load(name).map_err(|_| AppError::NotFound(name.to_string()))?;
    match &record.kind {
        TunnelKind::GreIpsec(_) => {
            gre_ipsec::destroy(&ctx.kernel, &ctx.rev_dir(), record.local_underlay_ip, record.remote_underlay_ip).await?;
        }
        TunnelKind::WireGuard(_) => {
            wireguard::destroy(&ctx.kernel, &ctx.rev_dir(), name).await?;
        }
    }
    tracing::info!(tunnel = name, "destroyed tunnel");
    Ok(())
}

pub fn remove(ctx: &Context, name: &str) -> Result<(), AppError> {
    ctx.tunnels.delete(name)?;
    Ok(())
}

pub fn list(ctx: &Context) -> Result<Vec<String>, AppError> {
    Ok(ctx.tunnels.list()?)
}

pub fn show(ctx: &Context, name: &str) -> Result<TunnelRecord, AppError> {
    ctx.tunnels.load(name).map_err(|_| AppError::NotFound(name.to_string()))
}

pub fn set_cost(ctx: &Context, name: &str, cost: u8) -> Result<(), AppError> {
    if let Ok(mut physical) = ctx.physicals.load(name) {
        physical.set_cost(cost)?;
        ctx.physicals.save(name, &physical)?;
        return Ok(());
    }
    let mut tunnel = ctx.tunnels.load(name).map_err(|_| AppError::NotFound(name.to_string()))?;
    tunnel.set_cost(cost)?;
    ctx.tunnels.save(name, &tunnel)?;
    Ok(())
}

pub fn set_enabled(ctx: &Context, name: &str, enabled: bool) -> Result<(), AppError> {
    if let Ok(mut physical) = ctx.physicals.load(name) {
        physical.set_enabled(enabled);
        ctx.physicals.save(name, &physical)?;
        return Ok(());
    }
    let mut tunnel = ctx.tunnels.load(name).map_err(|_| AppError::NotFound(name.to_string()))?;
    tunnel.set_enabled(enabled);
    ctx.tunnels.save(name, &tunnel)?;
    Ok(())
}
