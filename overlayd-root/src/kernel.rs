//! The kernel administrative surface: every mutation the agent makes to
//! routing tables, rules, XFRM state, links, and WireGuard peers goes
//! through this single capability.
//!
//! The routing tables, rule prefs, and XFRM database are process-wide
//! kernel resources shared across every tunnel and policy group. Modeling
//! them behind one `Kernel` trait (rather than, say, a method per driver)
//! keeps that sharing explicit: every component takes `&K` by reference,
//! and tests substitute [`mocks::FakeKernel`] for an in-memory equivalent
//! instead of touching the host's network namespace.

use async_trait::async_trait;
use std::net::Ipv4Addr;
use thiserror::Error;
use tokio::process::Command;

use overlayd_core::shell_command_ext::{self, Logs, ShellCommandExt};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    ShellCommand(#[from] shell_command_ext::Error),
    #[error("could not parse command output: {0}")]
    Parse(String),
}

/// Direction of an XFRM state/policy entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::In => "in",
            Direction::Out => "out",
        }
    }
}

/// An `ip rule` entry as read back from the kernel, used by the policy
/// engine's dedup-to-one-rule-per-pref discipline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleEntry {
    pub pref: u32,
    pub table: u32,
    pub from: Option<String>,
    pub to: Option<String>,
}

/// Link, address, and XFRM primitives used by the tunnel drivers.
#[async_trait]
pub trait LinkOps: Send + Sync {
    async fn link_add_gre(
        &self,
        name: &str,
        local: Ipv4Addr,
        remote: Ipv4Addr,
        key: u32,
        ttl: u8,
    ) -> Result<(), Error>;

    async fn link_add_wireguard(&self, name: &str) -> Result<(), Error>;

    /// Idempotent: tolerates the link already being gone.
    async fn link_del(&self, name: &str) -> Result<(), Error>;

    async fn link_set_up(&self, name: &str, mtu: Option<u32>) -> Result<(), Error>;

    async fn addr_add(&self, dev: &str, addr: Ipv4Addr, prefix_len: u8) -> Result<(), Error>;

    /// Idempotent: tolerates the address already being gone.
    async fn addr_del(&self, dev: &str, addr: Ipv4Addr, prefix_len: u8) -> Result<(), Error>;

    async fn xfrm_state_add(
        &self,
        src: Ipv4Addr,
        dst: Ipv4Addr,
        spi: u32,
        auth_key_hex: &str,
        enc_key_hex: &str,
    ) -> Result<(), Error>;

    /// Idempotent: tolerates the state already being gone.
    async fn xfrm_state_del(&self, src: Ipv4Addr, dst: Ipv4Addr, spi: u32) -> Result<(), Error>;

    async fn xfrm_policy_add(
        &self,
        src: Ipv4Addr,
        dst: Ipv4Addr,
        dir: Direction,
        spi: u32,
    ) -> Result<(), Error>;

    /// Idempotent: tolerates the policy already being gone.
    async fn xfrm_policy_del(&self, src: Ipv4Addr, dst: Ipv4Addr, dir: Direction) -> Result<(), Error>;
}

/// `ip rule` / `ip route` primitives used by the policy-routing engine and
/// the health checker's transient routing exception.
#[async_trait]
pub trait RuleOps: Send + Sync {
    async fn rule_add(&self, pref: u32, table: u32, from: Option<&str>, to: Option<&str>) -> Result<(), Error>;

    /// Deletes the first rule matching `pref`/`table`; idempotent.
    async fn rule_del_at_pref(&self, pref: u32, table: u32) -> Result<(), Error>;

    async fn rule_list_at_pref(&self, pref: u32) -> Result<Vec<RuleEntry>, Error>;

    async fn route_add(
        &self,
        dest: &str,
        via: Option<Ipv4Addr>,
        dev: &str,
        table: u32,
        onlink: bool,
    ) -> Result<(), Error>;

    /// Idempotent: tolerates the route already being gone.
    async fn route_del(&self, dest: &str, table: u32) -> Result<(), Error>;

    async fn route_flush_table(&self, table: u32) -> Result<(), Error>;

    async fn route_flush_cache(&self) -> Result<(), Error>;

    /// Returns the `dev` (and interface count, for duplicate-pruning) of the
    /// `default` route in the given table.
    async fn route_show_default(&self, table: u32) -> Result<Vec<String>, Error>;

    /// Deletes one specific device's `default` route from `table`, used to
    /// prune duplicate default routes down to a single one.
    async fn route_del_default_dev(&self, dev: &str, table: u32) -> Result<(), Error>;
}

/// WireGuard peer/key primitives used by the WireGuard driver.
#[async_trait]
pub trait WgOps: Send + Sync {
    async fn wg_set_private_key(&self, dev: &str, private_key_b64: &str) -> Result<(), Error>;

    async fn wg_set_listen_port(&self, dev: &str, port: u16) -> Result<(), Error>;

    async fn wg_set_peer(
        &self,
        dev: &str,
        peer_public_key: &str,
        endpoint: Option<(Ipv4Addr, u16)>,
        persistent_keepalive: Option<u16>,
    ) -> Result<(), Error>;

    /// Returns the unix timestamp of the most recent handshake, 0 if none
    /// has occurred yet.
    async fn wg_latest_handshake(&self, dev: &str) -> Result<u64, Error>;

    /// Returns the peer's currently known endpoint address, learned from
    /// its first inbound packet on a server-mode tunnel. `None` if no
    /// packet has arrived yet.
    async fn wg_peer_endpoint(&self, dev: &str) -> Result<Option<Ipv4Addr>, Error>;
}

/// Active health probes.
#[async_trait]
pub trait ProbeOps: Send + Sync {
    async fn ping(&self, target: Ipv4Addr, count: u32, interval: std::time::Duration) -> Result<(u32, u32, f64), Error>;
}

/// The full kernel capability; every driver takes `&dyn Kernel` (or a
/// generic `K: Kernel`) rather than shelling out directly.
pub trait Kernel: LinkOps + RuleOps + WgOps + ProbeOps {}
impl<T: LinkOps + RuleOps + WgOps + ProbeOps> Kernel for T {}

/// Production kernel backed by `ip`, `wg`, and `ping`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealKernel;

#[async_trait]
impl LinkOps for RealKernel {
    async fn link_add_gre(&self, name: &str, local: Ipv4Addr, remote: Ipv4Addr, key: u32, ttl: u8) -> Result<(), Error> {
        Command::new("ip")
            .args(["link", "add", name, "type", "gre"])
            .args(["local", &local.to_string()])
            .args(["remote", &remote.to_string()])
            .args(["key", &key.to_string()])
            .args(["ttl", &ttl.to_string()])
            .run(Logs::Print)
            .await?;
        Ok(())
    }

    async fn link_add_wireguard(&self, name: &str) -> Result<(), Error> {
        Command::new("ip")
            .args(["link", "add", name, "type", "wireguard"])
            .run(Logs::Print)
            .await?;
        Ok(())
    }

    async fn link_del(&self, name: &str) -> Result<(), Error> {
        Command::new("ip")
            .args(["link", "del", name])
            .run(Logs::Suppress)
            .await?;
        Ok(())
    }

    async fn link_set_up(&self, name: &str, mtu: Option<u32>) -> Result<(), Error> {
        if let Some(mtu) = mtu {
            Command::new("ip")
                .args(["link", "set", "dev", name, "mtu", &mtu.to_string()])
                .run(Logs::Print)
                .await?;
        }
        Command::new("ip")
            .args(["link", "set", "dev", name, "up"])
            .run(Logs::Print)
            .await?;
        Ok(())
    }

    async fn addr_add(&self, dev: &str, addr: Ipv4Addr, prefix_len: u8) -> Result<(), Error> {
        Command::new("ip")
            .args(["addr", "add", &format!("{addr}/{prefix_len}"), "dev", dev])
            .run(Logs::Print)
            .await?;
        Ok(())
    }

    async fn addr_del(&self, dev: &str, addr: Ipv4Addr, prefix_len: u8) -> Result<(), Error> {
        Command::new("ip")
            .args(["addr", "del", &format!("{addr}/{prefix_len}"), "dev", dev])
            .run(Logs::Suppress)
            .await?;
        Ok(())
    }

    async fn xfrm_state_add(
        &self,
        src: Ipv4Addr,
        dst: Ipv4Addr,
        spi: u32,
        auth_key_hex: &str,
        enc_key_hex: &str,
    ) -> Result<(), Error> {
        Command::new("ip")
            .args(["xfrm", "state", "add"])
            .args(["src", &src.to_string()])
            .args(["dst", &dst.to_string()])
            .args(["proto", "esp"])
            .args(["spi", &format!("0x{spi:08x}")])
            .args(["mode", "tunnel"])
            .args(["auth", "sha256", auth_key_hex])
            .args(["enc", "aes", enc_key_hex])
            .run(Logs::Print)
            .await?;
        Ok(())
    }

    async fn xfrm_state_del(&self, src: Ipv4Addr, dst: Ipv4Addr, spi: u32) -> Result<(), Error> {
        Command::new("ip")
            .args(["xfrm", "state", "del"])
            .args(["src", &src.to_string()])
            .args(["dst", &dst.to_string()])
            .args(["proto", "esp"])
            .args(["spi", &format!("0x{spi:08x}")])
            .run(Logs::Suppress)
            .await?;
        Ok(())
    }

    async fn xfrm_policy_add(&self, src: Ipv4Addr, dst: Ipv4Addr, dir: Direction, spi: u32) -> Result<(), Error> {
        Command::new("ip")
            .args(["xfrm", "policy", "add"])
            .args(["src", &src.to_string()])
            .args(["dst", &dst.to_string()])
            .args(["dir", dir.as_str()])
            .args(["ptype", "main"])
            .args(["tmpl", "src", &src.to_string(), "dst", &dst.to_string()])
            .args(["proto", "esp"])
            .args(["spi", &format!("0x{spi:08x}")])
            .args(["mode", "tunnel"])
            .run(Logs::Print)
            .await?;
        Ok(())
    }

    async fn xfrm_policy_del(&self, src: Ipv4Addr, dst: Ipv4Addr, dir: Direction) -> Result<(), Error> {
        Command::new("ip")
            .args(["xfrm", "policy", "del"])
            .args(["src", &src.to_string()])
            .args(["dst", &dst.to_string()])
            .args(["dir", dir.as_str()])
            .run(Logs::Suppress)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl RuleOps for RealKernel {
    async fn rule_add(&self, pref: u32, table: u32, from: Option<&str>, to: Option<&str>) -> Result<(), Error> {
        let mut cmd = Command::new("ip");
        cmd.args(["rule", "add"]);
        if let Some(from) = from {
            cmd.args(["from", from]);
        }
        if let Some(to) = to {
            cmd.args(["to", to]);
        }
        cmd.args(["lookup", &table.to_string(), "pref", &pref.to_string()]);
        cmd.run(Logs::Print).await?;
        Ok(())
    }

    async fn rule_del_at_pref(&self, pref: u32, table: u32) -> Result<(), Error> {
        Command::new("ip")
            .args(["rule", "del", "pref", &pref.to_string(), "lookup", &table.to_string()])
            .run(Logs::Suppress)
            .await?;
        Ok(())
    }

    async fn rule_list_at_pref(&self, pref: u32) -> Result<Vec<RuleEntry>, Error> {
        let output = Command::new("ip")
            .args(["rule", "show", "pref", &pref.to_string()])
            .run_stdout(Logs::Print)
            .await?;
        Ok(output.lines().filter_map(|line| parse_rule_line(pref, line)).collect())
    }

    async fn route_add(&self, dest: &str, via: Option<Ipv4Addr>, dev: &str, table: u32, onlink: bool) -> Result<(), Error> {
        let mut cmd = Command::new("ip");
        cmd.args(["route", "add", dest]);
        if let Some(via) = via {
            cmd.args(["via", &via.to_string()]);
        }
        cmd.args(["dev", dev, "table", &table.to_string()]);
        if onlink {
            cmd.arg("onlink");
        }
        cmd.run(Logs::Print).await?;
        Ok(())
    }

    async fn route_del(&self, dest: &str, table: u32) -> Result<(), Error> {
        Command::new("ip")
            .args(["route", "del", dest, "table", &table.to_string()])
            .run(Logs::Suppress)
            .await?;
        Ok(())
    }

    async fn route_flush_table(&self, table: u32) -> Result<(), Error> {
        Command::new("ip")
            .args(["route", "flush", "table", &table.to_string()])
            .run(Logs::Suppress)
            .await?;
        Ok(())
    }

    async fn route_flush_cache(&self) -> Result<(), Error> {
        Command::new("ip")
            .args(["route", "flush", "cache"])
            .run(Logs::Print)
            .await?;
        Ok(())
    }

    async fn route_show_default(&self, table: u32) -> Result<Vec<String>, Error> {
        let output = Command::new("ip")
            .args(["route", "show", "table", &table.to_string(), "default"])
            .run_stdout(Logs::Print)
            .await?;
        Ok(output
            .lines()
            .filter_map(|line| {
                let mut tokens = line.split_whitespace();
                while let Some(tok) = tokens.next() {
                    if tok == "dev" {
                        return tokens.next().map(str::to_string);
                    }
                }
                None
            })
            .collect())
    }

    async fn route_del_default_dev(&self, dev: &str, table: u32) -> Result<(), Error> {
        Command::new("ip")
            .args(["route", "del", "default", "dev", dev, "table", &table.to_string()])
            .run(Logs::Suppress)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl WgOps for RealKernel {
    async fn wg_set_private_key(&self, dev: &str, private_key_b64: &str) -> Result<(), Error> {
        use std::process::Stdio;
        use tokio::io::AsyncWriteExt;

        let mut child = Command::new("wg")
            .args(["set", dev, "private-key", "/dev/stdin"])
            .stdin(Stdio::piped())
            .spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(private_key_b64.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
        }
        let status = child.wait().await?;
        if !status.success() {
            return Err(shell_command_ext::Error::CommandFailed.into());
        }
        Ok(())
    }

    async fn wg_set_listen_port(&self, dev: &str, port: u16) -> Result<(), Error> {
        Command::new("wg")
            .args(["set", dev, "listen-port", &port.to_string()])
            .run(Logs::Print)
            .await?;
        Ok(())
    }

    async fn wg_set_peer(
        &self,
        dev: &str,
        peer_public_key: &str,
        endpoint: Option<(Ipv4Addr, u16)>,
        persistent_keepalive: Option<u16>,
    ) -> Result<(), Error> {
        let mut cmd = Command::new("wg");
        cmd.args(["set", dev, "peer", peer_public_key]);
        if let Some((ip, port)) = endpoint {
            cmd.args(["endpoint", &format!("{ip}:{port}")]);
        }
        if let Some(keepalive) = persistent_keepalive {
            cmd.args(["persistent-keepalive", &keepalive.to_string()]);
        }
        cmd.args(["allowed-ips", "0.0.0.0/0"]);
        cmd.run(Logs::Print).await?;
        Ok(())
    }

    async fn wg_latest_handshake(&self, dev: &str) -> Result<u64, Error> {
        let output = Command::new("wg")
            .args(["show", dev, "latest-handshakes"])
            .run_stdout(Logs::Print)
            .await?;
        // format: "<peer-pubkey>\t<unix-ts>"
        let ts = output
            .split_whitespace()
            .last()
            .and_then(|tok| tok.parse::<u64>().ok())
            .unwrap_or(0);
        Ok(ts)
    }

    async fn wg_peer_endpoint(&self, dev: &str) -> Result<Option<Ipv4Addr>, Error> {
        let output = Command::new("wg")
            .args(["show", dev, "endpoints"])
            .run_stdout(Logs::Print)
            .await?;
        // format: "<peer-pubkey>\t<ip>:<port>" or "(none)"
        Ok(output.split_whitespace().last().and_then(|tok| {
            let ip_part = tok.split(':').next()?;
            ip_part.parse().ok()
        }))
    }
}

#[async_trait]
impl ProbeOps for RealKernel {
    async fn ping(&self, target: Ipv4Addr, count: u32, interval: std::time::Duration) -> Result<(u32, u32, f64), Error> {
        let interval_arg = format!("{:.2}", interval.as_secs_f64());
        let output = Command::new("ping")
            .args(["-c", &count.to_string()])
            .args(["-i", &interval_arg])
            .args(["-W", "1"])
            .arg(target.to_string())
            .run_stdout(Logs::Suppress)
            .await
            .unwrap_or_default();
        Ok(parse_ping_summary(&output, count))
    }
}

/// Parses `X packets transmitted, Y received, Z% packet loss` and the
/// `rtt min/avg/max/mdev = a/b/c/d ms` lines from `ping`'s stdout.
fn parse_ping_summary(output: &str, sent_fallback: u32) -> (u32, u32, f64) {
    let mut sent = sent_fallback;
    let mut received = 0u32;
    let mut avg_rtt = 0.0;

    for line in output.lines() {
        if line.contains("packets transmitted") {
            let mut words = line.split_whitespace();
            if let Some(n) = words.next().and_then(|w| w.parse::<u32>().ok()) {
                sent = n;
            }
            if let Some(n) = words.nth(1).and_then(|w| w.parse::<u32>().ok()) {
                received = n;
            }
        } else if let Some(rest) = line.trim().strip_prefix("rtt ") {
            if let Some(values) = rest.split('=').nth(1) {
                let values = values.trim().split_whitespace().next().unwrap_or("");
                let mut parts = values.split('/');
                if let Some(avg) = parts.nth(1).and_then(|v| v.parse::<f64>().ok()) {
                    avg_rtt = avg;
                }
            }
        }
    }
    (sent, received, avg_rtt)
}

fn parse_rule_line(pref: u32, line: &str) -> Option<RuleEntry> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let mut from = None;
    let mut to = None;
    let mut table = 0u32;
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let mut i = 0;
    while i < tokens.len() {
        match tokens[i] {
            "from" => {
                from = tokens.get(i + 1).map(|s| s.to_string());
                i += 2;
            }
            "to" => {
                to = tokens.get(i + 1).map(|s| s.to_string());
                i += 2;
            }
            "lookup" => {
                table = tokens.get(i + 1).and_then(|s| s.parse().ok()).unwrap_or(0);
                i += 2;
            }
            _ => i += 1,
        }
    }
    Some(RuleEntry {
        pref,
        table,
        from: from.filter(|f| f != "all"),
        to,
    })
}

/// In-memory kernel substitute for tests: no real process is spawned, every
/// mutation is recorded so assertions can inspect the resulting state.
#[cfg(test)]
pub mod mocks {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    pub struct FakeState {
        pub links: Vec<String>,
        pub addrs: Vec<(String, Ipv4Addr, u8)>,
        pub xfrm_states: Vec<(Ipv4Addr, Ipv4Addr, u32)>,
        pub xfrm_policies: Vec<(Ipv4Addr, Ipv4Addr, Direction)>,
        pub rules: HashMap<u32, Vec<RuleEntry>>,
        pub routes: HashMap<u32, Vec<String>>,
        pub wg_peers: HashMap<String, Vec<String>>,
        pub wg_private_keys: HashMap<String, String>,
        pub handshake_timestamps: HashMap<String, u64>,
        pub peer_endpoints: HashMap<String, Ipv4Addr>,
        pub default_route_dev: HashMap<u32, Vec<String>>,
    }

    #[derive(Default)]
    pub struct FakeKernel {
        pub state: Mutex<FakeState>,
    }

    impl FakeKernel {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl LinkOps for FakeKernel {
        async fn link_add_gre(&self, name: &str, _local: Ipv4Addr, _remote: Ipv4Addr, _key: u32, _ttl: u8) -> Result<(), Error> {
            self.state.lock().unwrap().links.push(name.to_string());
            Ok(())
        }

        async fn link_add_wireguard(&self, name: &str) -> Result<(), Error> {
            self.state.lock().unwrap().links.push(name.to_string());
            Ok(())
        }

        async fn link_del(&self, name: &str) -> Result<(), Error> {
            self.state.lock().unwrap().links.retain(|l| l != name);
            Ok(())
        }

        async fn link_set_up(&self, _name: &str, _mtu: Option<u32>) -> Result<(), Error> {
            Ok(())
        }

        async fn addr_add(&self, dev: &str, addr: Ipv4Addr, prefix_len: u8) -> Result<(), Error> {
            self.state.lock().unwrap().addrs.push((dev.to_string(), addr, prefix_len));
            Ok(())
        }

        async fn addr_del(&self, dev: &str, addr: Ipv4Addr, prefix_len: u8) -> Result<(), Error> {
            self.state.lock().unwrap().addrs.retain(|e| e != &(dev.to_string(), addr, prefix_len));
            Ok(())
        }

        async fn xfrm_state_add(&self, src: Ipv4Addr, dst: Ipv4Addr, spi: u32, _auth: &str, _enc: &str) -> Result<(), Error> {
            self.state.lock().unwrap().xfrm_states.push((src, dst, spi));
            Ok(())
        }

        async fn xfrm_state_del(&self, src: Ipv4Addr, dst: Ipv4Addr, spi: u32) -> Result<(), Error> {
            self.state.lock().unwrap().xfrm_states.retain(|e| e != &(src, dst, spi));
            Ok(())
        }

        async fn xfrm_policy_add(&self, src: Ipv4Addr, dst: Ipv4Addr, dir: Direction, _spi: u32) -> Result<(), Error> {
            self.state.lock().unwrap().xfrm_policies.push((src, dst, dir));
            Ok(())
        }

        async fn xfrm_policy_del(&self, src: Ipv4Addr, dst: Ipv4Addr, dir: Direction) -> Result<(), Error> {
            self.state.lock().unwrap().xfrm_policies.retain(|e| e != &(src, dst, dir));
            Ok(())
        }
    }

    #[async_trait]
    impl RuleOps for FakeKernel {
        async fn rule_add(&self, pref: u32, table: u32, from: Option<&str>, to: Option<&str>) -> Result<(), Error> {
            self.state.lock().unwrap().rules.entry(pref).or_default().push(RuleEntry {
                pref,
                table,
                from: from.map(str::to_string),
                to: to.map(str::to_string),
            });
            Ok(())
        }

        async fn rule_del_at_pref(&self, pref: u32, table: u32) -> Result<(), Error> {
            if let Some(entries) = self.state.lock().unwrap().rules.get_mut(&pref) {
                if let Some(pos) = entries.iter().position(|e| e.table == table) {
                    entries.remove(pos);
                }
            }
            Ok(())
        }

        async fn rule_list_at_pref(&self, pref: u32) -> Result<Vec<RuleEntry>, Error> {
            Ok(self.state.lock().unwrap().rules.get(&pref).cloned().unwrap_or_default())
        }

        async fn route_add(&self, dest: &str, _via: Option<Ipv4Addr>, dev: &str, table: u32, _onlink: bool) -> Result<(), Error> {
            self.state
                .lock()
                .unwrap()
                .routes
                .entry(table)
                .or_default()
                .push(format!("{dest} dev {dev}"));
            if dest == "default" || dest == "0.0.0.0/0" {
                self.state.lock().unwrap().default_route_dev.entry(table).or_default().push(dev.to_string());
            }
            Ok(())
        }

        async fn route_del(&self, dest: &str, table: u32) -> Result<(), Error> {
            if let Some(routes) = self.state.lock().unwrap().routes.get_mut(&table) {
                routes.retain(|r| !r.starts_with(dest));
            }
            Ok(())
        }

        async fn route_flush_table(&self, table: u32) -> Result<(), Error> {
            self.state.lock().unwrap().routes.remove(&table);
            self.state.lock().unwrap().default_route_dev.remove(&table);
            Ok(())
        }

        async fn route_flush_cache(&self) -> Result<(), Error> {
            Ok(())
        }

        async fn route_show_default(&self, table: u32) -> Result<Vec<String>, Error> {
            Ok(self.state.lock().unwrap().default_route_dev.get(&table).cloned().unwrap_or_default())
        }

        async fn route_del_default_dev(&self, dev: &str, table: u32) -> Result<(), Error> {
            if let Some(devs) = self.state.lock().unwrap().default_route_dev.get_mut(&table) {
                if let Some(pos) = devs.iter().position(|d| d == dev) {
                    devs.remove(pos);
                }
            }
            Ok(())
        }
    }

    #[async_trait]
    impl WgOps for FakeKernel {
        async fn wg_set_private_key(&self, dev: &str, private_key_b64: &str) -> Result<(), Error> {
            self.state
                .lock()
                .unwrap()
                .wg_private_keys
                .insert(dev.to_string(), private_key_b64.to_string());
            Ok(())
        }

        async fn wg_set_listen_port(&self, _dev: &str, _port: u16) -> Result<(), Error> {
            Ok(())
        }

        async fn wg_set_peer(
            &self,
            dev: &str,
            peer_public_key: &str,
            _endpoint: Option<(Ipv4Addr, u16)>,
            _persistent_keepalive: Option<u16>,
        ) -> Result<(), Error> {
            self.state
                .lock()
                .unwrap()
                .wg_peers
                .entry(dev.to_string())
                .or_default()
                .push(peer_public_key.to_string());
            Ok(())
        }

        async fn wg_latest_handshake(&self, dev: &str) -> Result<u64, Error> {
            Ok(*self.state.lock().unwrap().handshake_timestamps.get(dev).unwrap_or(&0))
        }

        async fn wg_peer_endpoint(&self, dev: &str) -> Result<Option<Ipv4Addr>, Error> {
            Ok(self.state.lock().unwrap().peer_endpoints.get(dev).copied())
        }
    }

    #[async_trait]
    impl ProbeOps for FakeKernel {
        async fn ping(&self, _target: Ipv4Addr, count: u32, _interval: std::time::Duration) -> Result<(u32, u32, f64), Error> {
            Ok((count, count, 20.0))
        }
    }
}
