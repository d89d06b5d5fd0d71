//! Failover daemon (C9): one tokio task per monitor, each independently
//! probing its candidates, applying hysteresis and a confirmation count,
//! and retargeting its policy group or the default route under a
//! process-wide lock shared with every other monitor.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use overlayd_core::config::{self, Config, Monitor, MonitorKind};
use overlayd_core::iface::Class;
use overlayd_core::state::{EventKind, FailoverEvent, InterfaceState, RuntimeSnapshot};
use overlayd_root::{health, ifinventory, policy_engine};

use crate::context::Context;
use crate::error::AppError;

/// Serializes every monitor's retargeting call against the kernel, distinct
/// from `health::PROBE_LOCK`'s pref-5 probe-exception lock.
static RETARGET_LOCK: Mutex<()> = Mutex::const_new(());

async fn resolve_exit(ctx: &Context, name: &str) -> (Class, Option<Ipv4Addr>) {
    if let Ok(physical) = ctx.physicals.load(name) {
        return (Class::PhysicalManaged, physical.gateway);
    }
    if ctx.tunnels.exists(name) {
        return (Class::TunnelManaged, None);
    }
    let gateway = ifinventory::third_party_gateway(name).await.unwrap_or(None);
    (Class::ThirdParty, gateway)
}

async fn retarget(ctx: &Context, monitor: &Monitor, exit: &str) -> Result<(), AppError> {
    let _guard = RETARGET_LOCK.lock().await;
    let (class, gateway) = resolve_exit(ctx, exit).await;
    match monitor.kind {
        MonitorKind::PolicyGroup => {
            let mut group = ctx
                .groups
                .load(&monitor.target)
                .map_err(|_| AppError::NotFound(monitor.target.clone()))?;
            group.exit = exit.to_string();
            let from = policy_engine::resolve_from_selector(&group.from, &ctx.tunnels, &ctx.physicals)?;
            policy_engine::apply_group(&ctx.kernel, &group, class, gateway, from.as_deref()).await?;
            ctx.groups.save(&monitor.target, &group)?;
        }
        MonitorKind::DefaultRoute => {
            policy_engine::apply_default(&ctx.kernel, exit, class, gateway).await?;
            ctx.save_default_binding(&overlayd_core::policy::DefaultRouteBinding { exit: Some(exit.to_string()) })?;
        }
    }
    Ok(())
}

/// Reads the currently applied exit: for a default-route monitor, the
/// kernel's table-900 `default` route (pruning any duplicates down to the
/// first, detecting drift from external tampering along the way); for a
/// policy-group monitor, the group's recorded exit, since no external party
/// is expected to edit policy groups directly.
async fn current_exit(ctx: &Context, monitor: &Monitor) -> Result<Option<String>, AppError> {
    match monitor.kind {
        MonitorKind::DefaultRoute => prune_and_read_default(&ctx.kernel).await,
        MonitorKind::PolicyGroup => Ok(ctx.groups.load(&monitor.target).ok().map(|g| g.exit)),
    }
}

async fn prune_and_read_default<K: overlayd_root::kernel::Kernel>(kernel: &K) -> Result<Option<String>, AppError> {
    let devs = kernel.route_show_default(overlayd_core::priority::TABLE_DEFAULT).await?;
    if devs.len() > 1 {
        tracing::warn!(count = devs.len(), devs = ?devs, "multiple default routes in table 900; pruning duplicates");
        for dev in &devs[1..] {
            let _ = kernel.route_del_default_dev(dev, overlayd_core::priority::TABLE_DEFAULT).await;
        }
    }
    Ok(devs.into_iter().next())
}

/// Picks the candidate with the maximum final score, breaking ties in favor
/// of the currently applied exit for stability.
fn pick_best(scores: &HashMap<String, f64>, current: Option<&str>) -> Option<(String, f64)> {
    scores.iter().fold(None, |best, (name, score)| match best {
        None => Some((name.clone(), *score)),
        Some((best_name, best_score)) => {
            if *score > best_score || (*score == best_score && current == Some(name.as_str())) {
                Some((name.clone(), *score))
            } else {
                Some((best_name, best_score))
            }
        }
    })
}

/// Runs one monitor's probe/hysteresis/retarget loop until `handle` is
/// aborted by the reload or shutdown path.
async fn run_monitor(ctx: Arc<Context>, monitor: Monitor, snapshot: Arc<Mutex<RuntimeSnapshot>>, snapshot_path: PathBuf) {
    let mut ticker = tokio::time::interval(monitor.interval);
    let mut streaks: HashMap<String, u32> = HashMap::new();

    loop {
        ticker.tick().await;

        let mut scores: HashMap<String, f64> = HashMap::new();
        for candidate in &monitor.candidates {
            let (class, gateway) = resolve_exit(&ctx, candidate).await;
            let result = match health::check(&ctx.kernel, candidate, class, gateway, &monitor.check, monitor.interval).await {
                Ok(r) => r,
                Err(err) => {
                    tracing::warn!(monitor = %monitor.name, candidate, %err, "probe failed");
                    continue;
                }
            };
            let cost = candidate_cost(&ctx, candidate);
            let state = InterfaceState::from_probe(result.mean_latency_ms, result.loss_pct, cost, &result.target_used, SystemTime::now());
            scores.insert(candidate.clone(), state.final_score);

            let mut guard = snapshot.lock().await;
            guard.interfaces.insert(candidate.clone(), state);
            drop(guard);
        }

        // Initial-check grace: a monitor without a completed first probe on
        // every candidate never retargets this cycle.
        let all_probed = {
            let guard = snapshot.lock().await;
            monitor
                .candidates
                .iter()
                .all(|c| guard.interfaces.get(c).map(|s| s.initial_check_done).unwrap_or(false))
        };
        if !all_probed {
            let guard = snapshot.lock().await;
            if let Err(err) = guard.save_atomic(&snapshot_path) {
                tracing::warn!(%err, "failed to persist runtime snapshot");
            }
            continue;
        }

        let current = match current_exit(&ctx, &monitor).await {
            Ok(current) => current,
            Err(err) => {
                tracing::warn!(monitor = %monitor.name, %err, "failed to determine currently applied exit");
                let guard = snapshot.lock().await;
                let _ = guard.save_atomic(&snapshot_path);
                continue;
            }
        };

        if let Some((best_name, best_score)) = pick_best(&scores, current.as_deref()) {
            match &current {
                None => {
                    apply_and_record(&ctx, &monitor, &best_name, &snapshot, "initial selection").await;
                    streaks.clear();
                }
                Some(current_name) if current_name == &best_name => {
                    streaks.clear();
                }
                Some(current_name) => {
                    let current_score = scores.get(current_name).copied().unwrap_or(0.0);
                    if overlayd_core::state::exceeds_margin(current_score, best_score, monitor.score_margin) {
                        let streak = streaks.entry(best_name.clone()).or_insert(0);
                        *streak += 1;
                        if *streak >= monitor.confirmation_count {
                            let message = format!("{current_name} -> {best_name} (score {current_score:.1} -> {best_score:.1})");
                            apply_and_record(&ctx, &monitor, &best_name, &snapshot, &message).await;
                            streaks.clear();
                        }
                    } else {
                        streaks.remove(&best_name);
                    }
                }
            }
        }

        let guard = snapshot.lock().await;
        if let Err(err) = guard.save_atomic(&snapshot_path) {
            tracing::warn!(%err, "failed to persist runtime snapshot");
        }
    }
}

fn candidate_cost(ctx: &Context, name: &str) -> u8 {
    if let Ok(physical) = ctx.physicals.load(name) {
        return physical.cost;
    }
    if let Ok(tunnel) = ctx.tunnels.load(name) {
        return tunnel.cost;
    }
    0
}

async fn apply_and_record(ctx: &Context, monitor: &Monitor, exit: &str, snapshot: &Arc<Mutex<RuntimeSnapshot>>, message: &str) -> bool {
    match retarget(ctx, monitor, exit).await {
        Ok(()) => {
            tracing::info!(monitor = %monitor.name, exit, "retargeted");
            let mut guard = snapshot.lock().await;
            guard.events.push(FailoverEvent {
                timestamp: SystemTime::now(),
                monitor: monitor.name.clone(),
                kind: EventKind::Failover,
                message: message.to_string(),
            });
            true
        }
        Err(err) => {
            tracing::error!(monitor = %monitor.name, exit, %err, "retarget failed");
            false
        }
    }
}

/// Owns the set of running monitor tasks so `reload` can diff against it.
struct Supervisor {
    ctx: Arc<Context>,
    snapshot: Arc<Mutex<RuntimeSnapshot>>,
    snapshot_path: PathBuf,
    tasks: HashMap<String, (Monitor, JoinHandle<()>)>,
}

impl Supervisor {
    fn spawn(&mut self, monitor: Monitor) {
        let ctx = self.ctx.clone();
        let snapshot = self.snapshot.clone();
        let snapshot_path = self.snapshot_path.clone();
        let name = monitor.name.clone();
        let handle = tokio::spawn(run_monitor(ctx, monitor.clone(), snapshot, snapshot_path));
        self.tasks.insert(name, (monitor, handle));
    }

    /// Stops monitors no longer in `config`, starts new ones, and restarts
    /// any whose definition changed. Called on startup and on SIGHUP.
    fn reconcile(&mut self, config: &Config) {
        let wanted: HashMap<String, &Monitor> = config.monitors.iter().map(|m| (m.name.clone(), m)).collect();

        let stale: Vec<String> = self
            .tasks
            .keys()
            .filter(|name| !wanted.contains_key(name.as_str()))
            .cloned()
            .collect();
        for name in stale {
            if let Some((_, handle)) = self.tasks.remove(&name) {
                handle.abort();
                tracing::info!(monitor = %name, "stopped monitor (removed from config)");
            }
        }

        for (name, monitor) in wanted {
            let needs_restart = match self.tasks.get(&name) {
                Some((existing, _)) => existing != monitor,
                None => true,
            };
            if needs_restart {
                if let Some((_, handle)) = self.tasks.remove(&name) {
                    handle.abort();
                }
                tracing::info!(monitor = %name, "starting monitor");
                self.spawn(monitor.clone());
            }
        }
    }

    fn shutdown(self) {
        for (_, (_, handle)) in self.tasks {
            handle.abort();
        }
    }
}

/// Runs the daemon until SIGTERM/SIGINT, handling SIGHUP as a config
/// reload. `config_path` is re-read from disk on every reload.
pub async fn run(ctx: Context, config_path: PathBuf, reload_handle: overlayd_core::logging::FilterReloadHandle) -> Result<(), AppError> {
    let pid_path = ctx.pid_path();
    crate::supervise::acquire(&pid_path)?;

    let mut config = config::read(&config_path)?;
    let snapshot_path = ctx.snapshot_path();
    let snapshot = Arc::new(Mutex::new(RuntimeSnapshot::load_or_default(&snapshot_path).map(|mut s| {
        s.started_at.get_or_insert(SystemTime::now());
        s
    })?));

    let ctx = Arc::new(ctx);

    // Startup reconciliation: bring protection rules and every configured
    // policy group/default binding in line with the saved records before
    // the first monitor tick.
    {
        let binding = ctx.load_default_binding()?;
        if let Err(err) = policy_engine::apply_all(
            &ctx.kernel,
            &ctx.groups,
            &ctx.tunnels,
            &ctx.physicals,
            &binding,
            config.protection_min_dwell,
        )
        .await
        {
            tracing::warn!(%err, "startup reconciliation failed");
        }
    }

    let mut supervisor = Supervisor {
        ctx: ctx.clone(),
        snapshot: snapshot.clone(),
        snapshot_path: snapshot_path.clone(),
        tasks: HashMap::new(),
    };
    supervisor.reconcile(&config);

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).map_err(AppError::Io)?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()).map_err(AppError::Io)?;
    let mut sighup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()).map_err(AppError::Io)?;
    let mut sync_tick = tokio::time::interval(config.sync_interval);
    sync_tick.tick().await; // first tick fires immediately; already reconciled above

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
                break;
            }
            _ = sigint.recv() => {
                tracing::info!("received SIGINT, shutting down");
                break;
            }
            _ = sighup.recv() => {
                tracing::info!("received SIGHUP, reloading configuration");
                overlayd_core::logging::reload(&reload_handle);
                match config::read(&config_path) {
                    Ok(new_config) => {
                        config = new_config;
                        sync_tick = tokio::time::interval(config.sync_interval);
                        supervisor.reconcile(&config);
                    }
                    Err(err) => {
                        tracing::error!(%err, "failed to reload configuration; keeping previous config");
                    }
                }
            }
            _ = sync_tick.tick() => {
                let binding = ctx.load_default_binding()?;
                if let Err(err) = policy_engine::apply_all(
                    &ctx.kernel,
                    &ctx.groups,
                    &ctx.tunnels,
                    &ctx.physicals,
                    &binding,
                    config.protection_min_dwell,
                )
                .await
                {
                    tracing::warn!(%err, "periodic reconciliation failed");
                }
            }
        }
    }

    supervisor.shutdown();
    let guard = snapshot.lock().await;
    if let Err(err) = guard.save_atomic(&snapshot_path) {
        tracing::warn!(%err, "failed to persist final runtime snapshot");
    }
    drop(guard);
    crate::supervise::release(&pid_path);
    Ok(())
}
