//! Typed configuration for the room service and the client sync layer (§6).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{StudioError, StudioResult};

/// Room service configuration, layered from environment variables prefixed
/// `MANIFOLD_` (e.g. `MANIFOLD_LISTEN`, `MANIFOLD_DB_PATH`) over the
/// defaults below, with CLI flags taking precedence (applied by the binary
/// after `ServiceConfig::load`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub listen: SocketAddr,
    pub db_path: PathBuf,
    pub compaction_delay_ms: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceConfig {
            listen: "0.0.0.0:8787".parse().expect("valid default listen address"),
            db_path: PathBuf::from("manifold-studio.sqlite"),
            compaction_delay_ms: 5_000,
        }
    }
}

impl ServiceConfig {
    /// Load from environment variables prefixed `MANIFOLD_`, falling back to
    /// defaults for anything unset.
    pub fn load() -> StudioResult<Self> {
        let config = config::Config::builder()
            .add_source(config::Config::try_from(&ServiceConfig::default()).map_err(|e| StudioError::Configuration(e.to_string()))?)
            .add_source(config::Environment::with_prefix("MANIFOLD").separator("_"))
            .build()
            .map_err(|e| StudioError::Configuration(e.to_string()))?;
        config.try_deserialize().map_err(|e| StudioError::Configuration(e.to_string()))
    }

    pub fn compaction_delay(&self) -> Duration {
        Duration::from_millis(self.compaction_delay_ms)
    }
}

/// Client sync configuration (§6 "Client config"): `SYNC_URL` (absent
/// disables sync) and a `room` id defaulting to `"default"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub sync_url: Option<String>,
    pub room: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig { sync_url: None, room: "default".to_string() }
    }
}

impl ClientConfig {
    pub fn load() -> StudioResult<Self> {
        let config = config::Config::builder()
            .add_source(config::Config::try_from(&ClientConfig::default()).map_err(|e| StudioError::Configuration(e.to_string()))?)
            .add_source(config::Environment::default())
            .build()
            .map_err(|e| StudioError::Configuration(e.to_string()))?;
        config.try_deserialize().map_err(|e| StudioError::Configuration(e.to_string()))
    }

    /// Whether sync is enabled at all (§6: "absent disables sync").
    pub fn sync_enabled(&self) -> bool {
        self.sync_url.is_some()
    }
}
