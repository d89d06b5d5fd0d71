//! Policy-group data model: the declarative side of the policy-routing
//! engine. Applying/revoking groups against the kernel lives in
//! `overlayd-root`; this module only owns validated shapes.

use cidr::Ipv4Cidr;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::priority::{PREF_POLICY_GROUP_MAX, PREF_POLICY_GROUP_MIN};

/// Source selector for a policy group's `ip rule from <selector>`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum FromSelector {
    /// No `from` clause: matches all sources.
    All,
    Cidr(Ipv4Cidr),
    /// Resolved at apply time: a managed tunnel's remote virtual IP, a
    /// managed physical's primary IP, or (rejected) a third-party device.
    InterfaceName(String),
}

impl std::fmt::Display for FromSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FromSelector::All => write!(f, "all"),
            FromSelector::Cidr(c) => write!(f, "{c}"),
            FromSelector::InterfaceName(n) => write!(f, "{n}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyGroup {
    pub name: String,
    /// Equal to the routing-table id used for this group's entries.
    pub priority: u32,
    /// Exit interface name; any non-loopback interface, may be unmanaged.
    pub exit: String,
    pub destinations: Vec<Ipv4Cidr>,
    pub from: FromSelector,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("priority {0} is outside the user policy group range [{PREF_POLICY_GROUP_MIN}, {PREF_POLICY_GROUP_MAX}]")]
    PriorityOutOfRange(u32),
    #[error("a policy group needs at least one destination")]
    NoDestinations,
    #[error("exit interface name must not be empty")]
    EmptyExit,
}

impl PolicyGroup {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !(PREF_POLICY_GROUP_MIN..=PREF_POLICY_GROUP_MAX).contains(&self.priority) {
            return Err(ValidationError::PriorityOutOfRange(self.priority));
        }
        if self.destinations.is_empty() {
            return Err(ValidationError::NoDestinations);
        }
        if self.exit.trim().is_empty() {
            return Err(ValidationError::EmptyExit);
        }
        Ok(())
    }
}

/// Optional `0.0.0.0/0` binding, materialized at the fixed default priority.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct DefaultRouteBinding {
    pub exit: Option<String>,
}
