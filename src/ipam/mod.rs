//! IPAM integration.
//!
//! This module contains:
//! - `messages`: request/reply envelopes
//! - `IpamClient`: create pools and subnets through the gateway
//! - `IpamBootstrap`: one-time creation of the default pool and subnet

use serde::Deserialize;

pub mod bootstrap;
pub mod client;
pub mod messages;

pub use bootstrap::{BootstrapError, BootstrapOutcome, IpamBootstrap, IpamStatus};
pub use client::IpamClient;
pub use messages::{Action, IpamReply, IpamRequest, ObjectType};

/// Exchange the IPAM service listens on.
pub const IPAM_EXCHANGE: &str = "voyager-ipam-service";

/// What the bootstrap creates.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct IpamDefaults {
    /// Name of the default pool and of its subnet.
    pub pool_name: String,
    /// Pool metadata; the address range the pool covers.
    pub pool_metadata: String,
    pub subnet_start: String,
    pub subnet_end: String,
}

impl Default for IpamDefaults {
    fn default() -> Self {
        Self {
            pool_name: "default".to_string(),
            pool_metadata: "192.168.1.0/24".to_string(),
            subnet_start: "192.168.1.2".to_string(),
            subnet_end: "192.168.1.254".to_string(),
        }
    }
}
