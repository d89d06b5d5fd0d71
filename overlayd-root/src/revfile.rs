//! Crash-safe teardown log for multi-step kernel creates.
//!
//! Every tunnel create sequence (GRE+XFRM or WireGuard) performs several
//! kernel mutations that must all be undone together if a later step fails,
//! or if the process crashes mid-create and a later run needs to clean up.
//! A [`RevFile`] is an append-only, line-per-inverse-command log: each line
//! is one shell-equivalent teardown action, executed tolerantly (ENOENT is
//! not an error) in order on drop or on explicit teardown.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::kernel::{Direction, Kernel};

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
}

/// One inverse action recorded by a create sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevCommand {
    LinkDel(String),
    AddrDel {
        dev: String,
        addr: std::net::Ipv4Addr,
        prefix_len: u8,
    },
    XfrmStateDel {
        src: std::net::Ipv4Addr,
        dst: std::net::Ipv4Addr,
        spi: u32,
    },
    XfrmPolicyDel {
        src: std::net::Ipv4Addr,
        dst: std::net::Ipv4Addr,
        dir: Direction,
    },
    RouteDel {
        dest: String,
        table: u32,
    },
    RuleDelAtPref {
        pref: u32,
        table: u32,
    },
}

impl RevCommand {
    fn encode(&self) -> String {
        match self {
            RevCommand::LinkDel(name) => format!("link-del {name}"),
            RevCommand::AddrDel { dev, addr, prefix_len } => format!("addr-del {dev} {addr} {prefix_len}"),
            RevCommand::XfrmStateDel { src, dst, spi } => format!("xfrm-state-del {src} {dst} {spi}"),
            RevCommand::XfrmPolicyDel { src, dst, dir } => {
                let dir = match dir {
                    Direction::In => "in",
                    Direction::Out => "out",
                };
                format!("xfrm-policy-del {src} {dst} {dir}")
            }
            RevCommand::RouteDel { dest, table } => format!("route-del {dest} {table}"),
            RevCommand::RuleDelAtPref { pref, table } => format!("rule-del {pref} {table}"),
        }
    }

    fn decode(line: &str) -> Option<RevCommand> {
        let mut parts = line.split_whitespace();
        match parts.next()? {
            "link-del" => Some(RevCommand::LinkDel(parts.next()?.to_string())),
            "addr-del" => Some(RevCommand::AddrDel {
                dev: parts.next()?.to_string(),
                addr: parts.next()?.parse().ok()?,
                prefix_len: parts.next()?.parse().ok()?,
            }),
            "xfrm-state-del" => Some(RevCommand::XfrmStateDel {
                src: parts.next()?.parse().ok()?,
                dst: parts.next()?.parse().ok()?,
                spi: parts.next()?.parse().ok()?,
            }),
            "xfrm-policy-del" => {
                let src = parts.next()?.parse().ok()?;
                let dst = parts.next()?.parse().ok()?;
                let dir = match parts.next()? {
                    "in" => Direction::In,
                    _ => Direction::Out,
                };
                Some(RevCommand::XfrmPolicyDel { src, dst, dir })
            }
            "route-del" => Some(RevCommand::RouteDel {
                dest: parts.next()?.to_string(),
                table: parts.next()?.parse().ok()?,
            }),
            "rule-del" => Some(RevCommand::RuleDelAtPref {
                pref: parts.next()?.parse().ok()?,
                table: parts.next()?.parse().ok()?,
            }),
            _ => None,
        }
    }
}

/// An append-only compensation log for one artifact (one tunnel's create
/// sequence). Commands are appended in the order their forward actions
/// happened, and replayed in **reverse** so later creates are unwound
/// before earlier ones.
pub struct RevFile {
    path: PathBuf,
    commands: Vec<RevCommand>,
}

impl RevFile {
    /// Opens (or creates empty) the rev file for `artifact_name` under
    /// `dir`, loading any commands already recorded by a prior, possibly
    /// crashed, run.
    pub fn open(dir: &Path, artifact_name: &str) -> Result<Self, Error> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{artifact_name}.rev"));
        let commands = match fs::read_to_string(&path) {
            Ok(body) => body.lines().filter_map(RevCommand::decode).collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self { path, commands })
    }

    pub fn push(&mut self, command: RevCommand) -> Result<(), Error> {
        let mut file = fs::OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(file, "{}", command.encode())?;
        self.commands.push(command);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Executes every recorded command, most-recent-first, tolerating
    /// "already gone" kernel errors (the ops layer itself suppresses
    /// logging and ignores ENOENT-equivalent failures for delete calls).
    /// Deletes the rev file itself once every command has run.
    pub async fn execute_teardown<K: Kernel>(&mut self, kernel: &K) {
        for command in self.commands.drain(..).rev() {
            match command {
                RevCommand::LinkDel(name) => {
                    let _ = kernel.link_del(&name).await;
                }
                RevCommand::AddrDel { dev, addr, prefix_len } => {
                    let _ = kernel.addr_del(&dev, addr, prefix_len).await;
                }
                RevCommand::XfrmStateDel { src, dst, spi } => {
                    let _ = kernel.xfrm_state_del(src, dst, spi).await;
                }
                RevCommand::XfrmPolicyDel { src, dst, dir } => {
                    let _ = kernel.xfrm_policy_del(src, dst, dir).await;
                }
                RevCommand::RouteDel { dest, table } => {
                    let _ = kernel.route_del(&dest, table).await;
                }
                RevCommand::RuleDelAtPref { pref, table } => {
                    let _ = kernel.rule_del_at_pref(pref, table).await;
                }
            }
        }
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::mocks::FakeKernel;

    #[test]
    fn encode_decode_round_trips_every_variant() {
        let commands = vec![
            RevCommand::LinkDel("tun01".into()),
            RevCommand::AddrDel {
                dev: "tun01".into(),
                addr: "10.0.0.1".parse().unwrap(),
                prefix_len: 32,
            },
            RevCommand::XfrmStateDel {
                src: "10.0.0.1".parse().unwrap(),
                dst: "10.0.0.2".parse().unwrap(),
                spi: 0xdeadbeef,
            },
            RevCommand::XfrmPolicyDel {
                src: "10.0.0.1".parse().unwrap(),
                dst: "10.0.0.2".parse().unwrap(),
                dir: Direction::Out,
            },
            RevCommand::RouteDel {
                dest: "192.168.99.2/32".into(),
                table: 80,
            },
            RevCommand::RuleDelAtPref { pref: 10, table: 254 },
        ];
        for command in commands {
            let encoded = command.encode();
            assert_eq!(RevCommand::decode(&encoded), Some(command));
        }
    }

    #[tokio::test]
    async fn push_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut rev = RevFile::open(dir.path(), "tun01").unwrap();
            rev.push(RevCommand::LinkDel("tun01".into())).unwrap();
        }
        let reopened = RevFile::open(dir.path(), "tun01").unwrap();
        assert_eq!(reopened.commands.len(), 1);
    }

    #[tokio::test]
    async fn teardown_replays_in_reverse_and_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut rev = RevFile::open(dir.path(), "tun01").unwrap();
        rev.push(RevCommand::LinkDel("tun01".into())).unwrap();
        rev.push(RevCommand::RuleDelAtPref { pref: 10, table: 254 }).unwrap();

        let kernel = FakeKernel::new();
        rev.execute_teardown(&kernel).await;

        assert!(rev.is_empty());
        assert!(!dir.path().join("tun01.rev").exists());
    }
}
