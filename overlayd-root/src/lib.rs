pub mod gre_ipsec;
pub mod health;
pub mod ifinventory;
pub mod kernel;
pub mod policy_engine;
pub mod revfile;
pub mod wireguard;
