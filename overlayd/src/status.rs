//! Status reporter (C11): renders the physical/tunnel interface tree,
//! marking the live default-route exit and each node's last probe result.

use std::collections::HashMap;

use serde::Serialize;

use overlayd_core::state::RuntimeSnapshot;
use overlayd_core::tunnel::TunnelRecord;
use overlayd_root::ifinventory;

use crate::context::Context;
use crate::error::AppError;

#[derive(Debug, Serialize)]
pub struct ProbeSummary {
    pub final_score: f64,
    pub last_latency_ms: f64,
    pub last_loss_pct: f64,
    pub last_target: String,
}

#[derive(Debug, Serialize)]
pub struct StatusNode {
    pub name: String,
    pub kind: &'static str,
    pub enabled: bool,
    pub cost: u8,
    pub is_default_exit: bool,
    pub probe: Option<ProbeSummary>,
    pub children: Vec<StatusNode>,
}

/// Refreshes the physical inventory's gateways, then walks physicals as
/// roots with tunnels attached as children of their declared parent
/// (recursively, since a tunnel's parent may itself be a tunnel).
pub async fn tree(ctx: &Context) -> Result<Vec<StatusNode>, AppError> {
    ifinventory::refresh(&ctx.physicals).await?;

    let snapshot = RuntimeSnapshot::load_or_default(&ctx.snapshot_path())?;
    let default_binding = ctx.load_default_binding()?;
    let default_exit = default_binding.exit.as_deref();

    let mut children_of: HashMap<String, Vec<TunnelRecord>> = HashMap::new();
    for name in ctx.tunnels.list()? {
        let tunnel = ctx.tunnels.load(&name)?;
        children_of.entry(tunnel.parent.clone()).or_default().push(tunnel);
    }
    for children in children_of.values_mut() {
        children.sort_by(|a, b| a.name.cmp(&b.name));
    }

    let mut roots = Vec::new();
    for name in ctx.physicals.list()? {
        let physical = ctx.physicals.load(&name)?;
        roots.push(StatusNode {
            is_default_exit: default_exit == Some(name.as_str()),
            probe: probe_for(&snapshot, &name),
            children: build_children(&name, &children_of, &snapshot, default_exit),
            name,
            kind: "physical",
            enabled: physical.enabled,
            cost: physical.cost,
        });
    }
    Ok(roots)
}

fn build_children(
    parent: &str,
    children_of: &HashMap<String, Vec<TunnelRecord>>,
    snapshot: &RuntimeSnapshot,
    default_exit: Option<&str>,
) -> Vec<StatusNode> {
    let Some(tunnels) = children_of.get(parent) else {
        return Vec::new();
    };
    tunnels
        .iter()
        .map(|tunnel| StatusNode {
            is_default_exit: default_exit == Some(tunnel.name.as_str()),
            probe: probe_for(snapshot, &tunnel.name),
            children: build_children(&tunnel.name, children_of, snapshot, default_exit),
            name: tunnel.name.clone(),
            kind: "tunnel",
            enabled: tunnel.enabled,
            cost: tunnel.cost,
        })
        .collect()
}

fn probe_for(snapshot: &RuntimeSnapshot, name: &str) -> Option<ProbeSummary> {
    snapshot.interfaces.get(name).map(|state| ProbeSummary {
        final_score: state.final_score,
        last_latency_ms: state.last_latency_ms,
        last_loss_pct: state.last_loss_pct,
        last_target: state.last_target.clone(),
    })
}

/// Plain-text render, one line per node, children indented two spaces
/// deeper than their parent.
pub fn render_text(roots: &[StatusNode]) -> String {
    let mut out = String::new();
    for root in roots {
        render_node(root, 0, &mut out);
    }
    out
}

fn render_node(node: &StatusNode, depth: usize, out: &mut String) {
    let indent = "  ".repeat(depth);
    let marker = if node.is_default_exit { "*" } else { " " };
    let state = if node.enabled { "enabled" } else { "disabled" };
    match &node.probe {
        Some(probe) => {
            out.push_str(&format!(
                "{indent}{marker} {} [{}] cost={} score={:.1} latency={:.1}ms loss={:.1}% via {}\n",
                node.name, state, node.cost, probe.final_score, probe.last_latency_ms, probe.last_loss_pct, probe.last_target
            ));
        }
        None => {
            out.push_str(&format!("{indent}{marker} {} [{}] cost={} (no probe yet)\n", node.name, state, node.cost));
        }
    }
    for child in &node.children {
        render_node(child, depth + 1, out);
    }
}

/// Diagnostic single-name classification (`status --classify <name>`).
pub async fn classify(ctx: &Context, name: &str) -> String {
    let class = ifinventory::classify(name, &ctx.physicals, &ctx.tunnels).await;
    format!("{class:?}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use overlayd_core::iface::PhysicalInterface;
    use overlayd_core::registry::Registry;
    use overlayd_core::tunnel::{GreIpsecParams, TunnelKind};

    fn sample_tunnel(name: &str, parent: &str) -> TunnelRecord {
        TunnelRecord {
            name: name.into(),
            kind: TunnelKind::GreIpsec(GreIpsecParams {
                auth_key: "0xabc".into(),
                enc_key: "0xdef".into(),
            }),
            parent: parent.into(),
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
    fn nests_tunnel_under_tunnel_parent() {
        let dir = tempfile::tempdir().unwrap();
        let tunnels: Registry<TunnelRecord> = Registry::new(dir.path().join("tun")).unwrap();
        tunnels.create("tun01", &sample_tunnel("tun01", "eth0")).unwrap();
        tunnels.create("tun02", &sample_tunnel("tun02", "tun01")).unwrap();

        let mut children_of: HashMap<String, Vec<TunnelRecord>> = HashMap::new();
        for name in tunnels.list().unwrap() {
            let tunnel = tunnels.load(&name).unwrap();
            children_of.entry(tunnel.parent.clone()).or_default().push(tunnel);
        }

        let snapshot = RuntimeSnapshot::default();
        let children = build_children("eth0", &children_of, &snapshot, None);
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].name, "tun01");
        assert_eq!(children[0].children.len(), 1);
        assert_eq!(children[0].children[0].name, "tun02");
    }

    #[test]
    fn render_marks_default_exit() {
        let dir = tempfile::tempdir().unwrap();
        let physicals: Registry<PhysicalInterface> = Registry::new(dir.path()).unwrap();
        let _ = physicals;
        let node = StatusNode {
            name: "eth0".into(),
            kind: "physical",
            enabled: true,
            cost: 0,
            is_default_exit: true,
            probe: None,
            children: vec![],
        };
        let text = render_text(&[node]);
        assert!(text.starts_with("* eth0"));
    }
}
