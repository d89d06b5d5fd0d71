//! Argument parsing. A thin shell around `overlayd-core`/`overlayd-root`
//! calls: no interactive prompts, no config-file format of its own beyond
//! what's needed to round-trip the typed records.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use overlayd_core::config;

#[derive(Clone, Debug, Parser)]
#[command(version, about = "Node agent: overlay tunnels, policy routing, and active failover")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Clone, Debug, Subcommand)]
pub enum Command {
    /// Run the failover daemon in the foreground.
    Daemon {
        #[arg(long, env = config::ENV_VAR, default_value = config::DEFAULT_PATH)]
        config_path: PathBuf,
    },
    /// Discover physical interfaces and save them to the inventory.
    Scan,
    /// List the physical interface inventory.
    Ifaces,
    /// Tunnel records and their kernel-level lifecycle.
    #[command(subcommand)]
    Tunnel(TunnelCommand),
    /// Policy groups.
    #[command(subcommand)]
    Policy(PolicyCommand),
    /// The default-route binding.
    #[command(subcommand)]
    Default(DefaultCommand),
    /// Set the routing cost (0-100) of a physical interface or tunnel.
    SetCost { name: String, cost: u8 },
    /// Mark a physical interface or tunnel enabled.
    Enable { name: String },
    /// Mark a physical interface or tunnel disabled.
    Disable { name: String },
    /// Render the interface/tunnel tree and failover state.
    Status {
        /// Print the classification overlayd would assign to this interface
        /// name and exit, without rendering the full tree.
        #[arg(long)]
        classify: Option<String>,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum, PartialEq, Eq)]
pub enum WgMode {
    Server,
    Client,
}

#[derive(Clone, Debug, Subcommand)]
pub enum TunnelCommand {
    /// Register and create a GRE-over-IPsec tunnel.
    CreateGreIpsec {
        name: String,
        #[arg(long)]
        parent: String,
        #[arg(long)]
        remote_underlay: Ipv4Addr,
        #[arg(long)]
        local_virtual: Ipv4Addr,
        #[arg(long)]
        remote_virtual: Ipv4Addr,
        /// Shared passphrase; hashed into the IPsec auth key.
        #[arg(long)]
        auth_secret: String,
        /// Shared passphrase; hashed into the IPsec encryption key.
        #[arg(long)]
        enc_secret: String,
        #[arg(long, default_value_t = 0)]
        cost: u8,
    },
    /// Register and create a WireGuard tunnel, generating a fresh keypair.
    CreateWireGuard {
        name: String,
        #[arg(long)]
        parent: String,
        #[arg(long, value_enum)]
        mode: WgMode,
        /// Required in client mode: the server's underlay address.
        #[arg(long)]
        remote_underlay: Option<Ipv4Addr>,
        #[arg(long)]
        peer_public_key: String,
        #[arg(long)]
        local_virtual: Ipv4Addr,
        #[arg(long)]
        remote_virtual: Ipv4Addr,
        #[arg(long, default_value_t = 51820)]
        listen_port: u16,
        /// Client mode only: the server's listen port.
        #[arg(long, default_value_t = 0)]
        peer_port: u16,
        #[arg(long, default_value_t = 0)]
        cost: u8,
    },
    /// Tear down the kernel-level tunnel; keeps the record.
    Destroy { name: String },
    /// Delete the tunnel record. Does not touch the kernel — run `destroy`
    /// first if the tunnel is still up.
    Remove { name: String },
    /// List registered tunnel names.
    List,
    /// Print one tunnel record.
    Show { name: String },
}

#[derive(Clone, Debug, Subcommand)]
pub enum PolicyCommand {
    /// Register a policy group without applying it.
    Add {
        name: String,
        #[arg(long)]
        priority: u32,
        #[arg(long)]
        exit: String,
        /// IPv4 CIDR destinations; repeatable.
        #[arg(long = "dest", required = true)]
        destinations: Vec<String>,
        /// "all", a CIDR/IP, or an interface name resolved at apply time.
        #[arg(long)]
        from: Option<String>,
    },
    /// Apply one group, or every registered group if no name is given.
    Apply { name: Option<String> },
    /// Revoke one group's rule and flush its table.
    Revoke { name: String },
    /// Delete a policy group record.
    Remove { name: String },
    /// List registered policy group names.
    List,
}

#[derive(Clone, Debug, Subcommand)]
pub enum DefaultCommand {
    /// Set the default-route binding's exit, without applying it.
    Set { exit: String },
    /// Clear the default-route binding.
    Clear,
    /// Apply the configured default-route binding.
    Apply,
    /// Revoke the default route.
    Revoke,
}

pub fn parse() -> Cli {
    Cli::parse()
}
