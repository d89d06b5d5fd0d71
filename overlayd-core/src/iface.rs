//! Physical interface inventory and the interface-classification rules that
//! drive next-hop form selection throughout the policy-routing engine.

use serde::{Deserialize, Serialize};

/// How an interface behaves as a routing next hop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Class {
    Loopback,
    /// A physical interface we manage (tracked in the inventory).
    PhysicalManaged,
    /// A tunnel link we created (GRE/IPsec or WireGuard).
    TunnelManaged,
    /// Any other interface present on the host but not tracked by us.
    ThirdParty,
}

impl Class {
    /// `true` if routes via this interface need an explicit `via <gw>`
    /// clause rather than a bare `dev <iface>`.
    pub fn needs_gateway(self, has_gateway: bool) -> bool {
        matches!(self, Class::PhysicalManaged | Class::ThirdParty) && has_gateway
    }
}

/// A physical interface managed by this agent: real NIC, host bootstrap
/// selection. Mutated only by explicit set-cost/enable operations; destroyed
/// on re-bootstrap.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhysicalInterface {
    pub name: String,
    pub address: std::net::Ipv4Addr,
    /// Empty (`None`) means point-to-point: no gateway hop, route `dev` only.
    pub gateway: Option<std::net::Ipv4Addr>,
    pub enabled: bool,
    pub cost: u8,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CostError {
    #[error("cost must be between 0 and 100")]
    OutOfRange,
}

/// Shared validation for the `set-cost` operation on both physical interfaces
/// and tunnels.
pub fn validate_cost(cost: u8) -> Result<(), CostError> {
    if cost > 100 { Err(CostError::OutOfRange) } else { Ok(()) }
}

impl PhysicalInterface {
    pub fn class(&self) -> Class {
        Class::PhysicalManaged
    }

    pub fn is_point_to_point(&self) -> bool {
        self.gateway.is_none()
    }

    pub fn set_cost(&mut self, cost: u8) -> Result<(), CostError> {
        validate_cost(cost)?;
        self.cost = cost;
        Ok(())
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }
}
