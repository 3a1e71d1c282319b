//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase")]` and `#[serde(default)]`,
//! so a settings file only needs to name the values it changes.

mod gateway;
mod server;

pub use gateway::*;
pub use server::*;

use serde::{Deserialize, Serialize};

/// Root settings type for the relay gateway.
///
/// ```json
/// {
///   "server": { "port": 9000 },
///   "gateway": { "maxConnections": 500, "pongTimeoutMs": 10000 }
/// }
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelaySettings {
    /// Settings schema version.
    pub version: String,
    /// Application name.
    pub name: String,
    /// HTTP listener settings.
    pub server: ServerSettings,
    /// Connection gateway settings.
    pub gateway: GatewaySettings,
    /// Logging configuration.
    pub logging: LoggingSettings,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            version: "0.1.0".to_string(),
            name: "relay".to_string(),
            server: ServerSettings::default(),
            gateway: GatewaySettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}
