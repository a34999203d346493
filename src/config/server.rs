//! HTTP server and upstream service configuration types.

use std::time::Duration;

use serde::Deserialize;

use crate::gateway::{Route, DEFAULT_TIMEOUT};
use crate::inventory::INVENTORY_EXCHANGE;
use crate::ipam::{IpamDefaults, IPAM_EXCHANGE};

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to.
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Request/reply gateway configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// How long a round trip waits for its reply.
    pub timeout_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT.as_millis() as u64,
        }
    }
}

impl GatewayConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// IPAM service address and bootstrap defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IpamConfig {
    pub route: Route,
    pub defaults: IpamDefaults,
}

impl Default for IpamConfig {
    fn default() -> Self {
        Self {
            route: Route::new(IPAM_EXCHANGE),
            defaults: IpamDefaults::default(),
        }
    }
}

/// Inventory service address.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InventoryConfig {
    pub route: Route,
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            route: Route::new(INVENTORY_EXCHANGE),
        }
    }
}
