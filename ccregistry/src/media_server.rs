use std::sync::Arc;

use async_trait::async_trait;

use crate::media::MediaPayload;

/// Embedded HTTP server turning payloads into URLs a device can fetch.
///
/// The registry owns the server lifecycle; backends only read the URLs it
/// hands out through `RegistryHandle::register_media_payload`.
#[async_trait]
pub trait MediaServer: Send + Sync {
    /// Resolves once the listener accepts connections.
    async fn start(&self, host: &str, port: u16) -> anyhow::Result<()>;

    /// Closes the listener and forgets every registered payload.
    async fn stop(&self) -> anyhow::Result<()>;

    /// Base URL advertised to devices, once started.
    fn base_url(&self) -> Option<String>;

    /// Returns the URL serving `payload`. Fails when the server is not started.
    fn register_payload(&self, id: &str, payload: MediaPayload) -> anyhow::Result<String>;

    fn unregister_payload(&self, id: &str);
}

/// Builds the media server instance used by one registry run.
pub type MediaServerFactory = Arc<dyn Fn() -> Arc<dyn MediaServer> + Send + Sync>;
