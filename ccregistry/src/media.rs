use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// `SendResult::reason` when the device is not in the catalog.
pub const DEVICE_UNKNOWN: &str = "device_unknown";
/// `SendResult::reason` when no running backend handles the device transport.
pub const ADAPTER_NOT_AVAILABLE: &str = "adapter_not_available";

const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// Image attached to a media (cover art, poster).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaImage {
    pub url: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

/// Descriptive metadata forwarded to the renderer when its protocol allows it.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaMetadata {
    pub title: Option<String>,
    pub subtitle: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub images: Vec<MediaImage>,
    /// Generic hint such as "movie", "music" or "photo".
    pub kind: Option<String>,
    /// Transport-specific extras.
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl MediaMetadata {
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Self::default()
        }
    }
}

/// Where the bytes of a payload come from.
#[derive(Clone, PartialEq)]
pub enum MediaSource {
    Bytes(Bytes),
    Path(PathBuf),
    Url(String),
}

impl fmt::Debug for MediaSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaSource::Bytes(data) => write!(f, "Bytes({} bytes)", data.len()),
            MediaSource::Path(path) => f.debug_tuple("Path").field(path).finish(),
            MediaSource::Url(url) => f.debug_tuple("Url").field(url).finish(),
        }
    }
}

/// Media to deliver to a device.
#[derive(Clone, Debug, PartialEq)]
pub struct MediaPayload {
    source: MediaSource,
    pub mime_type: Option<String>,
    pub size: Option<u64>,
    pub metadata: Option<MediaMetadata>,
}

impl MediaPayload {
    pub fn from_bytes(data: impl Into<Bytes>, mime_type: Option<&str>) -> Self {
        let data = data.into();
        Self {
            size: Some(data.len() as u64),
            source: MediaSource::Bytes(data),
            mime_type: mime_type.map(str::to_string),
            metadata: None,
        }
    }

    /// The size is read from the filesystem when the file exists.
    pub fn from_path(path: impl AsRef<Path>, mime_type: Option<&str>) -> Self {
        let path = path.as_ref().to_path_buf();
        Self {
            size: std::fs::metadata(&path).ok().map(|m| m.len()),
            source: MediaSource::Path(path),
            mime_type: mime_type.map(str::to_string),
            metadata: None,
        }
    }

    pub fn from_url(url: impl Into<String>, mime_type: Option<&str>) -> Self {
        Self {
            source: MediaSource::Url(url.into()),
            mime_type: mime_type.map(str::to_string),
            size: None,
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: MediaMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn source(&self) -> &MediaSource {
        &self.source
    }

    /// Remote URL, when the payload is already fetchable by the device.
    pub fn url(&self) -> Option<&str> {
        match &self.source {
            MediaSource::Url(url) => Some(url),
            _ => None,
        }
    }

    pub fn title(&self) -> Option<&str> {
        self.metadata.as_ref()?.title.as_deref()
    }
}

/// Per-call options forwarded untouched to the backend.
#[derive(Clone, Debug, PartialEq)]
pub struct SendOptions {
    /// Transport-specific format hint.
    pub format: Option<String>,
    /// Deadline the backend applies to its own protocol exchange.
    pub timeout: Duration,
    /// Transport-specific launch options (application id, ...).
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            format: None,
            timeout: DEFAULT_SEND_TIMEOUT,
            extra: BTreeMap::new(),
        }
    }
}

impl SendOptions {
    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

/// Outcome of a `send_media` call. Failures are values, never errors.
#[derive(Clone, Default)]
pub struct SendResult {
    pub success: bool,
    pub reason: Option<String>,
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Playback controls, when the backend opened a session.
    pub controller: Option<Arc<dyn MediaController>>,
}

impl SendResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            reason: Some(reason.into()),
            ..Self::default()
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_controller(mut self, controller: Arc<dyn MediaController>) -> Self {
        self.controller = Some(controller);
        self
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }
}

impl fmt::Debug for SendResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendResult")
            .field("success", &self.success)
            .field("reason", &self.reason)
            .field("metadata", &self.metadata)
            .field("controller", &self.controller.is_some())
            .finish()
    }
}

/// Playback controls of an active media session.
///
/// Every method resolves once the transport acknowledged the command. The
/// default bodies are the path for operations a protocol cannot express:
/// they log a warning and succeed.
#[async_trait]
pub trait MediaController: Send + Sync {
    /// Protocol name used in diagnostics.
    fn backend(&self) -> &str;

    async fn play(&self) -> anyhow::Result<()> {
        op_not_supported("play", self.backend());
        Ok(())
    }

    async fn pause(&self) -> anyhow::Result<()> {
        op_not_supported("pause", self.backend());
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        op_not_supported("stop", self.backend());
        Ok(())
    }

    /// Position in seconds from the beginning.
    async fn seek(&self, _position: f64) -> anyhow::Result<()> {
        op_not_supported("seek", self.backend());
        Ok(())
    }

    /// Level between 0.0 and 1.0.
    async fn set_volume(&self, _level: f64) -> anyhow::Result<()> {
        op_not_supported("set_volume", self.backend());
        Ok(())
    }

    async fn set_mute(&self, _muted: bool) -> anyhow::Result<()> {
        op_not_supported("set_mute", self.backend());
        Ok(())
    }
}

fn op_not_supported(op: &str, backend: &str) {
    warn!("MediaController operation '{}' is not supported by backend '{}'", op, backend);
}

#[cfg(test)]
mod tests {
    use super::*;

    struct LaunchOnly;

    #[async_trait]
    impl MediaController for LaunchOnly {
        fn backend(&self) -> &str {
            "dial"
        }
    }

    #[tokio::test]
    async fn test_unsupported_operations_are_noops() {
        let controller = LaunchOnly;

        assert!(controller.play().await.is_ok());
        assert!(controller.seek(12.5).await.is_ok());
        assert!(controller.set_mute(true).await.is_ok());
    }

    #[test]
    fn test_from_bytes_sets_size() {
        let payload = MediaPayload::from_bytes(vec![0u8; 42], Some("image/png"));

        assert_eq!(payload.size, Some(42));
        assert_eq!(payload.mime_type.as_deref(), Some("image/png"));
        assert!(payload.url().is_none());
    }

    #[test]
    fn test_from_missing_path_has_no_size() {
        let payload = MediaPayload::from_path("/definitely/not/here.mp4", None);

        assert_eq!(payload.size, None);
        assert!(matches!(payload.source(), MediaSource::Path(_)));
    }

    #[test]
    fn test_from_url_with_metadata() {
        let payload = MediaPayload::from_url("http://example.org/a.mp3", Some("audio/mpeg"))
            .with_metadata(MediaMetadata::titled("A song"));

        assert_eq!(payload.url(), Some("http://example.org/a.mp3"));
        assert_eq!(payload.title(), Some("A song"));
    }

    #[test]
    fn test_failure_result() {
        let result = SendResult::failure(DEVICE_UNKNOWN);

        assert!(!result.success);
        assert_eq!(result.reason(), Some("device_unknown"));
        assert!(result.controller.is_none());
    }
}
