//! Last-used connection parameters.
//!
//! The engine never reads global state: callers load a
//! [`ConnectionConfig`] from a store, pass parameters in explicitly, and
//! save back after a successful connect. `MemoryParamsStore` covers tests
//! and embedding; persistent backends implement [`ParamsStore`] outside
//! this crate.

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::device::DeviceFamily;
use crate::transport::ConnectionParams;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Storage(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Last-used transport parameters per device family.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub pts: Option<ConnectionParams>,
    pub cr: Option<ConnectionParams>,
}

impl ConnectionConfig {
    pub fn for_family(&self, family: DeviceFamily) -> Option<&ConnectionParams> {
        match family {
            DeviceFamily::Pts => self.pts.as_ref(),
            DeviceFamily::Cr => self.cr.as_ref(),
        }
    }

    pub fn set_family(&mut self, family: DeviceFamily, params: ConnectionParams) {
        match family {
            DeviceFamily::Pts => self.pts = Some(params),
            DeviceFamily::Cr => self.cr = Some(params),
        }
    }
}

#[async_trait::async_trait]
pub trait ParamsStore: Send + Sync {
    async fn load(&self) -> Result<ConnectionConfig>;
    async fn save(&self, config: &ConnectionConfig) -> Result<()>;
}

/// In-memory store holding the canonical serialized form, so load/save
/// behave exactly like a JSON-backed implementation.
pub struct MemoryParamsStore {
    inner: RwLock<String>,
}

impl MemoryParamsStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new("{}".to_string()),
        }
    }
}

impl Default for MemoryParamsStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ParamsStore for MemoryParamsStore {
    async fn load(&self) -> Result<ConnectionConfig> {
        let raw = self.inner.read().await;
        Ok(serde_json::from_str(&raw)?)
    }

    async fn save(&self, config: &ConnectionConfig) -> Result<()> {
        let raw = serde_json::to_string(config)?;
        *self.inner.write().await = raw;
        Ok(())
    }
}
