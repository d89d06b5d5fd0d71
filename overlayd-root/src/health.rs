//! Health checker (C7): installs a transient routing exception so an active
//! probe traverses the candidate exit rather than the system default, then
//! runs a bounded ping or DNS probe and tears the exception down.

use std::net::Ipv4Addr;
use std::time::Duration;

use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{NameServerConfig, Protocol, ResolverConfig, ResolverOpts};
use hickory_resolver::error::ResolveErrorKind;
use thiserror::Error;
use tokio::sync::Mutex;

use overlayd_core::config::{CheckMode, HealthConfig};
use overlayd_core::dns::{self, ProbeOutcome};
use overlayd_core::iface::Class;
use overlayd_core::ping;
use overlayd_core::priority::{PREF_PROBE_EXCEPTION, TABLE_OVERLAY_VIP, TABLE_PROTECTION};

use crate::kernel::Kernel;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Kernel(#[from] crate::kernel::Error),
}

/// `pref 5` is a single globally unique kernel resource: every probe across
/// every monitor holds this process-wide lock for its entire
/// add-route-remove window.
static PROBE_LOCK: Mutex<()> = Mutex::const_new(());

const PRE_ACQUIRE_SWEEP_PASSES: u32 = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct CheckResult {
    pub success: bool,
    pub mean_latency_ms: f64,
    pub loss_pct: f64,
    pub target_used: String,
}

/// Table the transient exception routes into: the overlay table for tunnel
/// exits (reusing table 80), `main` for physical/third-party exits.
fn exception_table(exit_class: Class) -> u32 {
    match exit_class {
        Class::TunnelManaged => TABLE_OVERLAY_VIP,
        _ => TABLE_PROTECTION, // "main" (254)
    }
}

/// Runs the configured probe (ping or dns) against `exit`, trying each
/// target in order until one succeeds.
pub async fn check<K: Kernel>(
    kernel: &K,
    exit: &str,
    exit_class: Class,
    exit_gateway: Option<Ipv4Addr>,
    config: &HealthConfig,
    interval: Duration,
) -> Result<CheckResult, Error> {
    let _guard = PROBE_LOCK.lock().await;
    sweep_stale_exception(kernel).await?;

    match config.mode {
        CheckMode::Ping => check_ping(kernel, exit, exit_class, exit_gateway, &config.targets, interval).await,
        CheckMode::Dns => {
            check_dns(
                kernel,
                exit,
                exit_class,
                exit_gateway,
                &config.dns_servers,
                config.dns_query_name.as_deref().unwrap_or("."),
                interval,
            )
            .await
        }
    }
}

/// Self-healing: deletes any leftover pref-5 rule from a previous crashed
/// probe before installing a new one.
async fn sweep_stale_exception<K: Kernel>(kernel: &K) -> Result<(), Error> {
    for _ in 0..PRE_ACQUIRE_SWEEP_PASSES {
        let existing = kernel.rule_list_at_pref(PREF_PROBE_EXCEPTION).await?;
        if existing.is_empty() {
            break;
        }
        for entry in &existing {
            kernel.rule_del_at_pref(PREF_PROBE_EXCEPTION, entry.table).await?;
        }
    }
    Ok(())
}

async fn check_ping<K: Kernel>(
    kernel: &K,
    exit: &str,
    exit_class: Class,
    exit_gateway: Option<Ipv4Addr>,
    targets: &[Ipv4Addr],
    interval: Duration,
) -> Result<CheckResult, Error> {
    let count = ping::packet_count(interval);
    for target in targets {
        let exception = install_exception(kernel, exit, exit_class, exit_gateway, *target).await?;
        let (sent, received, avg_rtt) = kernel.ping(*target, count, ping::PACKET_SPACING).await?;
        exception.teardown(kernel).await;

        let result = ping::summarize(sent, received, avg_rtt);
        if result.success() {
            return Ok(CheckResult {
                success: true,
                mean_latency_ms: result.mean_latency_ms,
                loss_pct: result.loss_pct,
                target_used: target.to_string(),
            });
        }
    }
    Ok(CheckResult {
        success: false,
        mean_latency_ms: 0.0,
        loss_pct: 100.0,
        target_used: targets.first().map(Ipv4Addr::to_string).unwrap_or_default(),
    })
}

async fn check_dns<K: Kernel>(
    kernel: &K,
    exit: &str,
    exit_class: Class,
    exit_gateway: Option<Ipv4Addr>,
    dns_servers: &[Ipv4Addr],
    query_name: &str,
    interval: Duration,
) -> Result<CheckResult, Error> {
    let count = ping::packet_count(interval);
    for server in dns_servers {
        let exception = install_exception(kernel, exit, exit_class, exit_gateway, *server).await?;

        let mut outcomes = Vec::with_capacity(count as usize);
        let mut latencies = Vec::new();
        let resolver = build_resolver(*server);
        for _ in 0..count {
            let started = std::time::Instant::now();
            let lookup = tokio::time::timeout(dns::QUERY_TIMEOUT, resolver.lookup_ip(query_name)).await;
            match lookup {
                // timed out waiting on the resolver future itself
                Err(_) => outcomes.push(ProbeOutcome::TimedOut),
                // NOERROR with records
                Ok(Ok(_)) => {
                    outcomes.push(ProbeOutcome::Answered);
                    latencies.push(started.elapsed().as_secs_f64() * 1000.0);
                }
                // NXDOMAIN/SERVFAIL/empty-NOERROR all surface as NoRecordsFound;
                // the server answered, which is liveness.
                Ok(Err(e)) if matches!(e.kind(), ResolveErrorKind::NoRecordsFound { .. }) => {
                    outcomes.push(ProbeOutcome::Answered);
                    latencies.push(started.elapsed().as_secs_f64() * 1000.0);
                }
                // timeout/IO/protocol errors mean the path is actually down
                Ok(Err(_)) => outcomes.push(ProbeOutcome::TimedOut),
            }
            tokio::time::sleep(dns::QUERY_SPACING).await;
        }
        exception.teardown(kernel).await;

        let (mean_latency_ms, loss_pct) = dns::reduce(&outcomes, &latencies);
        if loss_pct < 100.0 {
            return Ok(CheckResult {
                success: true,
                mean_latency_ms,
                loss_pct,
                target_used: server.to_string(),
            });
        }
    }
    Ok(CheckResult {
        success: false,
        mean_latency_ms: 0.0,
        loss_pct: 100.0,
        target_used: dns_servers.first().map(Ipv4Addr::to_string).unwrap_or_default(),
    })
}

fn build_resolver(server: Ipv4Addr) -> TokioAsyncResolver {
    let mut config = ResolverConfig::new();
    config.add_name_server(NameServerConfig {
        socket_addr: std::net::SocketAddr::new(server.into(), 53),
        protocol: Protocol::Udp,
        tls_dns_name: None,
        trust_negative_responses: false,
        bind_addr: None,
    });
    let mut opts = ResolverOpts::default();
    opts.timeout = dns::QUERY_TIMEOUT;
    opts.attempts = 1;
    TokioAsyncResolver::tokio(config, opts)
}

/// A transient routing exception installed for the duration of one probe.
/// Callers must call [`Exception::teardown`] exactly once; this struct does
/// not implement `Drop` because teardown is itself async.
struct Exception {
    target: Ipv4Addr,
    table: u32,
}

impl Exception {
    async fn teardown<K: Kernel>(self, kernel: &K) {
        let dest = format!("{}/32", self.target);
        let _ = kernel.route_del(&dest, self.table).await;
        let _ = kernel.rule_del_at_pref(PREF_PROBE_EXCEPTION, self.table).await;
    }
}

async fn install_exception<K: Kernel>(
    kernel: &K,
    exit: &str,
    exit_class: Class,
    exit_gateway: Option<Ipv4Addr>,
    target: Ipv4Addr,
) -> Result<Exception, Error> {
    let table = exception_table(exit_class);
    let dest = format!("{target}/32");

    let via = if exit_class.needs_gateway(exit_gateway.is_some()) {
        exit_gateway
    } else {
        None
    };

    if kernel.route_add(&dest, via, exit, table, false).await.is_err() {
        // retry with `onlink`: common on cloud hosts where the gateway is
        // off-subnet for an otherwise valid physical next hop.
        kernel.route_add(&dest, via, exit, table, true).await?;
    }
    kernel.rule_add(PREF_PROBE_EXCEPTION, table, None, Some(&dest)).await?;

    Ok(Exception { target, table })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::mocks::FakeKernel;

    #[tokio::test]
    async fn ping_check_succeeds_on_first_target() {
        let kernel = FakeKernel::new();
        let config = HealthConfig {
            mode: CheckMode::Ping,
            targets: vec!["1.1.1.1".parse().unwrap()],
            dns_servers: vec![],
            dns_query_name: None,
        };

        let result = check(&kernel, "eth0", Class::PhysicalManaged, None, &config, Duration::from_millis(500))
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.target_used, "1.1.1.1");
    }

    #[tokio::test]
    async fn exception_rule_is_removed_after_probe() {
        let kernel = FakeKernel::new();
        let config = HealthConfig {
            mode: CheckMode::Ping,
            targets: vec!["1.1.1.1".parse().unwrap()],
            dns_servers: vec![],
            dns_query_name: None,
        };

        check(&kernel, "eth0", Class::PhysicalManaged, None, &config, Duration::from_millis(500))
            .await
            .unwrap();

        let state = kernel.state.lock().unwrap();
        assert!(state.rules.get(&PREF_PROBE_EXCEPTION).map(|r| r.is_empty()).unwrap_or(true));
    }

    #[tokio::test]
    async fn sweep_removes_leftover_exception_before_probing() {
        let kernel = FakeKernel::new();
        kernel
            .rule_add(PREF_PROBE_EXCEPTION, TABLE_PROTECTION, None, Some("203.0.113.1/32"))
            .await
            .unwrap();

        sweep_stale_exception(&kernel).await.unwrap();

        assert!(kernel.rule_list_at_pref(PREF_PROBE_EXCEPTION).await.unwrap().is_empty());
    }

    #[test]
    fn tunnel_exits_probe_into_overlay_table() {
        assert_eq!(exception_table(Class::TunnelManaged), TABLE_OVERLAY_VIP);
        assert_eq!(exception_table(Class::PhysicalManaged), TABLE_PROTECTION);
    }
}
