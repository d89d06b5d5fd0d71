//! Handlers for `overlayd policy ...` and `overlayd default ...`.

use cidr::Ipv4Cidr;

use overlayd_core::policy::{DefaultRouteBinding, FromSelector, PolicyGroup};
use overlayd_root::policy_engine;

use crate::context::Context;
use crate::error::AppError;

fn parse_from(raw: Option<&str>) -> Result<FromSelector, AppError> {
    match raw {
        None => Ok(FromSelector::All),
        Some(s) if s.eq_ignore_ascii_case("all") => Ok(FromSelector::All),
        Some(s) => match s.parse::<Ipv4Cidr>() {
            Ok(cidr) => Ok(FromSelector::Cidr(cidr)),
            Err(_) => Ok(FromSelector::InterfaceName(s.to_string())),
        },
    }
}

pub fn add(ctx: &Context, name: &str, priority: u32, exit: &str, destinations: &[String], from: Option<&str>) -> Result<(), AppError> {
    let destinations = destinations
        .iter()
        .map(|d| d.parse::<Ipv4Cidr>().map_err(|_| AppError::InvalidCidr(d.clone())))
        .collect::<Result<Vec<_>, _>>()?;

    let group = PolicyGroup {
        name: name.to_string(),
        priority,
        exit: exit.to_string(),
        destinations,
        from: parse_from(from)?,
    };
    group.validate()?;
    ctx.groups.create(name, &group)?;
    Ok(())
}

pub async fn apply(ctx: &Context, name: Option<&str>) -> Result<(), AppError> {
    let binding = ctx.load_default_binding()?;
    match name {
        Some(name) => {
            let group = ctx.groups.load(name).map_err(|_| AppError::NotFound(name.to_string()))?;
            let (class, gateway) = resolve_exit(ctx, &group.exit).await?;
            let from = policy_engine::resolve_from_selector(&group.from, &ctx.tunnels, &ctx.physicals)?;
            policy_engine::apply_group(&ctx.kernel, &group, class, gateway, from.as_deref()).await?;
        }
        None => {
            policy_engine::apply_all(
                &ctx.kernel,
                &ctx.groups,
                &ctx.tunnels,
                &ctx.physicals,
                &binding,
                ctx.protection_min_dwell,
            )
            .await?;
        }
    }
    Ok(())
}

pub async fn revoke(ctx: &Context, name: &str) -> Result<(), AppError> {
    let group = ctx.groups.load(name).map_err(|_| AppError::NotFound(name.to_string()))?;
    policy_engine::revoke_group(&ctx.kernel, &group).await?;
    Ok(())
}

pub fn remove(ctx: &Context, name: &str) -> Result<(), AppError> {
    ctx.groups.delete(name)?;
    Ok(())
}

pub fn list(ctx: &Context) -> Result<Vec<String>, AppError> {
    Ok(ctx.groups.list()?)
}

async fn resolve_exit(ctx: &Context, name: &str) -> Result<(overlayd_core::iface::Class, Option<std::net::Ipv4Addr>), AppError> {
    if let Ok(physical) = ctx.physicals.load(name) {
        return Ok((overlayd_core::iface::Class::PhysicalManaged, physical.gateway));
    }
    if ctx.tunnels.exists(name) {
        return Ok((overlayd_core::iface::Class::TunnelManaged, None));
    }
    let gateway = overlayd_root::ifinventory::third_party_gateway(name).await.unwrap_or(None);
    Ok((overlayd_core::iface::Class::ThirdParty, gateway))
}

pub fn default_set(ctx: &Context, exit: &str) -> Result<(), AppError> {
    ctx.save_default_binding(&DefaultRouteBinding { exit: Some(exit.to_string()) })?;
    Ok(())
}

pub fn default_clear(ctx: &Context) -> Result<(), AppError> {
    ctx.save_default_binding(&DefaultRouteBinding::default())?;
    Ok(())
}

pub async fn default_apply(ctx: &Context) -> Result<(), AppError> {
    let binding = ctx.load_default_binding()?;
    let Some(exit) = &binding.exit else {
        return Err(AppError::NotFound("no default-route exit configured".to_string()));
    };
    let (class, gateway) = resolve_exit(ctx, exit).await?;
    policy_engine::apply_default(&ctx.kernel, exit, class, gateway).await?;
    Ok(())
}

pub async fn default_revoke(ctx: &Context) -> Result<(), AppError> {
    policy_engine::revoke_default(&ctx.kernel).await?;
    Ok(())
}
