use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::device::Device;
use crate::media::{MediaPayload, SendOptions, SendResult};
use crate::registry::RegistryHandle;

/// Contract implemented by each protocol backend (Chromecast, DLNA, DIAL...).
///
/// A backend discovers devices on its own and reports them through the
/// [`RegistryHandle`] it was built with. Callbacks coming from foreign
/// threads go through `RegistryHandle::schedule_task`.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    /// Starts discovery. Calling it on a started backend does nothing.
    ///
    /// Must not wait for `RegistryHandle::wait_until_ready`: the registry
    /// becomes ready only after every backend returned from `start`.
    async fn start(&self) -> anyhow::Result<()>;

    /// Releases sockets and background loops. Idempotent.
    async fn stop(&self) -> anyhow::Result<()>;

    /// Delivers `payload` to `device`.
    ///
    /// Failures are reported as `SendResult::failure`, never as panics.
    async fn send_media(
        &self,
        device: &Device,
        payload: &MediaPayload,
        options: &SendOptions,
    ) -> SendResult;
}

/// Builds a fresh backend instance each time the registry starts.
pub type AdapterFactory = Arc<dyn Fn(RegistryHandle) -> Arc<dyn BackendAdapter> + Send + Sync>;

/// Configuration record of a backend.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackendInfo {
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    /// Backend-specific keys, kept as-is.
    #[serde(flatten)]
    pub options: BTreeMap<String, serde_json::Value>,
}

fn enabled_by_default() -> bool {
    true
}

impl Default for BackendInfo {
    fn default() -> Self {
        Self {
            enabled: true,
            options: BTreeMap::new(),
        }
    }
}

impl BackendInfo {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn option(&self, key: &str) -> Option<&serde_json::Value> {
        self.options.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_info_from_yaml_record() {
        let record: serde_yaml::Value =
            serde_yaml::from_str("enabled: false\ninterval_secs: 60\n").unwrap();

        let info: BackendInfo = serde_yaml::from_value(record).unwrap();

        assert!(!info.enabled);
        assert_eq!(info.option("interval_secs"), Some(&serde_json::json!(60)));
    }

    #[test]
    fn test_backend_info_enabled_when_unspecified() {
        let record: serde_yaml::Value = serde_yaml::from_str("{}").unwrap();

        let info: BackendInfo = serde_yaml::from_value(record).unwrap();

        assert!(info.enabled);
        assert!(info.options.is_empty());
    }
}
