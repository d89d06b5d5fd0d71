//! `overlayd`: a thin `clap` shell dispatching to `overlayd-core`/
//! `overlayd-root`, plus the failover daemon's own entry point.

use std::process;

mod cli;
mod context;
mod daemon;
mod error;
mod policy_cmd;
mod status;
mod supervise;
mod tunnel_cmd;

use cli::{Command, DefaultCommand, PolicyCommand, TunnelCommand};
use context::Context;
use error::AppError;

// Avoid musl's default allocator due to degraded performance under
// concurrent load.
#[cfg(target_os = "linux")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() {
    let reload_handle = overlayd_core::logging::init();
    let args = cli::parse();

    let result = run(args, reload_handle).await;
    match result {
        Ok(()) => process::exit(exitcode::OK),
        Err(err) => {
            eprintln!("overlayd: {err}");
            process::exit(err.exit_code());
        }
    }
}

async fn run(args: cli::Cli, reload_handle: overlayd_core::logging::FilterReloadHandle) -> Result<(), AppError> {
    match args.command {
        Command::Daemon { config_path } => {
            let ctx = Context::load()?;
            daemon::run(ctx, config_path, reload_handle).await
        }
        Command::Scan => {
            let ctx = Context::load()?;
            let found = overlayd_root::ifinventory::scan().await?;
            for mut iface in found {
                // preserve operator-set cost/enabled across a re-scan
                if let Ok(existing) = ctx.physicals.load(&iface.name) {
                    iface.cost = existing.cost;
                    iface.enabled = existing.enabled;
                }
                ctx.physicals.save(&iface.name, &iface)?;
                println!("{}: {}", iface.name, iface.address);
            }
            Ok(())
        }
        Command::Ifaces => {
            let ctx = Context::load()?;
            for name in ctx.physicals.list()? {
                let iface = ctx.physicals.load(&name)?;
                println!(
                    "{} {} gateway={} enabled={} cost={}",
                    iface.name,
                    iface.address,
                    iface.gateway.map(|g| g.to_string()).unwrap_or_else(|| "-".to_string()),
                    iface.enabled,
                    iface.cost
                );
            }
            Ok(())
        }
        Command::Tunnel(cmd) => run_tunnel(cmd).await,
        Command::Policy(cmd) => run_policy(cmd).await,
        Command::Default(cmd) => run_default(cmd).await,
        Command::SetCost { name, cost } => {
            let ctx = Context::load()?;
            tunnel_cmd::set_cost(&ctx, &name, cost)
        }
        Command::Enable { name } => {
            let ctx = Context::load()?;
            tunnel_cmd::set_enabled(&ctx, &name, true)
        }
        Command::Disable { name } => {
            let ctx = Context::load()?;
            tunnel_cmd::set_enabled(&ctx, &name, false)
        }
        Command::Status { classify, json } => {
            let ctx = Context::load()?;
            if let Some(name) = classify {
                println!("{}", status::classify(&ctx, &name).await);
                return Ok(());
            }
            let tree = status::tree(&ctx).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&tree)?);
            } else {
                print!("{}", status::render_text(&tree));
            }
            Ok(())
        }
    }
}

async fn run_tunnel(cmd: TunnelCommand) -> Result<(), AppError> {
    let ctx = Context::load()?;
    match cmd {
        TunnelCommand::CreateGreIpsec {
            name,
            parent,
            remote_underlay,
            local_virtual,
            remote_virtual,
            auth_secret,
            enc_secret,
            cost,
        } => {
            tunnel_cmd::create_gre_ipsec(
                &ctx,
                &name,
                &parent,
                remote_underlay,
                local_virtual,
                remote_virtual,
                &auth_secret,
                &enc_secret,
                cost,
            )
            .await
        }
        TunnelCommand::CreateWireGuard {
            name,
            parent,
            mode,
            remote_underlay,
            peer_public_key,
            local_virtual,
            remote_virtual,
            listen_port,
            peer_port,
            cost,
        } => {
            tunnel_cmd::create_wireguard(
                &ctx,
                &name,
                &parent,
                mode,
                remote_underlay,
                &peer_public_key,
                local_virtual,
                remote_virtual,
                listen_port,
                peer_port,
                cost,
            )
            .await
        }
        TunnelCommand::Destroy { name } => tunnel_cmd::destroy(&ctx, &name).await,
        TunnelCommand::Remove { name } => tunnel_cmd::remove(&ctx, &name),
        TunnelCommand::List => {
            for name in tunnel_cmd::list(&ctx)? {
                println!("{name}");
            }
            Ok(())
        }
        TunnelCommand::Show { name } => {
            let record = tunnel_cmd::show(&ctx, &name)?;
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }
    }
}

async fn run_policy(cmd: PolicyCommand) -> Result<(), AppError> {
    let ctx = Context::load()?;
    match cmd {
        PolicyCommand::Add {
            name,
            priority,
            exit,
            destinations,
            from,
        } => policy_cmd::add(&ctx, &name, priority, &exit, &destinations, from.as_deref()),
        PolicyCommand::Apply { name } => policy_cmd::apply(&ctx, name.as_deref()).await,
        PolicyCommand::Revoke { name } => policy_cmd::revoke(&ctx, &name).await,
        PolicyCommand::Remove { name } => policy_cmd::remove(&ctx, &name),
        PolicyCommand::List => {
            for name in policy_cmd::list(&ctx)? {
                println!("{name}");
            }
            Ok(())
        }
    }
}

async fn run_default(cmd: DefaultCommand) -> Result<(), AppError> {
    let ctx = Context::load()?;
    match cmd {
        DefaultCommand::Set { exit } => policy_cmd::default_set(&ctx, &exit),
        DefaultCommand::Clear => policy_cmd::default_clear(&ctx),
        DefaultCommand::Apply => policy_cmd::default_apply(&ctx).await,
        DefaultCommand::Revoke => policy_cmd::default_revoke(&ctx).await,
    }
}
