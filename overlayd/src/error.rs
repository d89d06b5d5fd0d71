//! Top-level error type: every subsystem error funnels through here so
//! `main` has one place to pick an exit code.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Registry(#[from] overlayd_core::registry::Error),
    #[error(transparent)]
    Dirs(#[from] overlayd_core::dirs::Error),
    #[error(transparent)]
    Config(#[from] overlayd_core::config::Error),
    #[error(transparent)]
    Kernel(#[from] overlayd_root::kernel::Error),
    #[error(transparent)]
    PolicyEngine(#[from] overlayd_root::policy_engine::Error),
    #[error(transparent)]
    Health(#[from] overlayd_root::health::Error),
    #[error(transparent)]
    Ifinventory(#[from] overlayd_root::ifinventory::Error),
    #[error(transparent)]
    GreIpsec(#[from] overlayd_root::gre_ipsec::Error),
    #[error(transparent)]
    WireGuard(#[from] overlayd_root::wireguard::Error),
    #[error(transparent)]
    TunnelValidation(#[from] overlayd_core::tunnel::ValidationError),
    #[error(transparent)]
    PolicyValidation(#[from] overlayd_core::policy::ValidationError),
    #[error(transparent)]
    Cost(#[from] overlayd_core::iface::CostError),
    #[error(transparent)]
    Keys(#[from] overlayd_core::keys::Error),
    #[error(transparent)]
    Supervise(#[from] crate::supervise::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("invalid CIDR: {0}")]
    InvalidCidr(String),
    #[error("tunnel parent {0} must be enabled before it can carry a child tunnel")]
    DisabledParent(String),
    #[error("client-mode WireGuard tunnels need --remote-underlay")]
    MissingRemoteUnderlay,
}

impl AppError {
    /// Maps to a BSD sysexits.h code via the `exitcode` crate.
    pub fn exit_code(&self) -> exitcode::ExitCode {
        match self {
            AppError::NotFound(_) => exitcode::DATAERR,
            AppError::InvalidCidr(_) | AppError::DisabledParent(_) | AppError::MissingRemoteUnderlay => exitcode::USAGE,
            AppError::TunnelValidation(_) | AppError::PolicyValidation(_) | AppError::Cost(_) => exitcode::DATAERR,
            AppError::Config(_) => exitcode::CONFIG,
            AppError::Io(_) => exitcode::IOERR,
            _ => exitcode::SOFTWARE,
        }
    }
}
