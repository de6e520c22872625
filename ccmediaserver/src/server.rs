//! # Module Server - Serveur HTTP des médias
//!
//! [`MediaHttpServer`] implements [`ccregistry::MediaServer`] on top of Axum.
//! Every registered payload is reachable at `GET <base_url>/<id>`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use ccregistry::{MediaPayload, MediaServer, MediaSource};
use ccutils::{guess_local_ip, is_unspecified_host};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DEFAULT_MIME_TYPE: &str = "application/octet-stream";
const FILE_CHUNK_SIZE: usize = 256 * 1024;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

type PayloadMap = Arc<RwLock<HashMap<String, MediaPayload>>>;

/// Serveur en cours d'exécution
struct RunningServer {
    base_url: String,
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    join_handle: JoinHandle<()>,
}

/// HTTP server exposing registered payloads to the renderers.
pub struct MediaHttpServer {
    name: String,
    payloads: PayloadMap,
    running: Mutex<Option<RunningServer>>,
}

impl Default for MediaHttpServer {
    fn default() -> Self {
        Self::new("CommonCast-Media-Server")
    }
}

impl MediaHttpServer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            payloads: Arc::new(RwLock::new(HashMap::new())),
            running: Mutex::new(None),
        }
    }

    /// Factory handed to `RegistryBuilder::media_server`.
    pub fn factory() -> impl Fn() -> Arc<dyn MediaServer> + Send + Sync + 'static {
        || Arc::new(MediaHttpServer::default()) as Arc<dyn MediaServer>
    }

    /// Address the listener is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|r| r.local_addr)
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    pub fn payload_count(&self) -> usize {
        self.payloads.read().len()
    }

    fn router(&self) -> Router {
        Router::new()
            .route("/{id}", get(serve_payload))
            .with_state(self.payloads.clone())
    }
}

#[async_trait]
impl MediaServer for MediaHttpServer {
    async fn start(&self, host: &str, port: u16) -> anyhow::Result<()> {
        if self.is_running() {
            debug!(server = %self.name, "Media server already running");
            return Ok(());
        }

        let bind_host = match host.trim_start_matches('[').trim_end_matches(']') {
            "" => "0.0.0.0",
            h => h,
        };
        let listener = tokio::net::TcpListener::bind((bind_host, port))
            .await
            .with_context(|| format!("cannot bind {}:{}", bind_host, port))?;
        let local_addr = listener.local_addr()?;

        // Les périphériques ne peuvent pas joindre 0.0.0.0 : on annonce l'IP locale
        let advertised = if is_unspecified_host(host) {
            guess_local_ip()
        } else {
            bind_host.to_string()
        };
        let advertised = if advertised.contains(':') {
            format!("[{}]", advertised)
        } else {
            advertised
        };
        let base_url = format!("http://{}:{}", advertised, local_addr.port());

        let shutdown = CancellationToken::new();
        let router = self.router();
        let signal = shutdown.clone().cancelled_owned();
        let name = self.name.clone();
        let join_handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router.into_make_service())
                .with_graceful_shutdown(signal)
                .await
            {
                warn!(server = %name, error = %e, "Media server terminated with an error");
            }
        });

        info!(
            "Server {} running at {} (bound to {})",
            self.name, base_url, local_addr
        );

        let mut running = self.running.lock();
        if running.is_some() {
            // démarrage concurrent : on garde le premier
            shutdown.cancel();
            return Ok(());
        }
        *running = Some(RunningServer {
            base_url,
            local_addr,
            shutdown,
            join_handle,
        });
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        let running = self.running.lock().take();
        self.payloads.write().clear();

        let Some(running) = running else {
            return Ok(());
        };
        running.shutdown.cancel();

        let mut join_handle = running.join_handle;
        match tokio::time::timeout(SHUTDOWN_GRACE, &mut join_handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(anyhow!("media server task failed: {}", e)),
            Err(_) => {
                warn!(server = %self.name, "Open connections after grace period, aborting");
                join_handle.abort();
            }
        }
        info!(server = %self.name, "Media server stopped");
        Ok(())
    }

    fn base_url(&self) -> Option<String> {
        self.running.lock().as_ref().map(|r| r.base_url.clone())
    }

    fn register_payload(&self, id: &str, payload: MediaPayload) -> anyhow::Result<String> {
        let base_url = self
            .base_url()
            .ok_or_else(|| anyhow!("media server {} is not started", self.name))?;
        if id.is_empty() || id.contains('/') {
            return Err(anyhow!("invalid media id '{}'", id));
        }
        debug!(id, source = ?payload.source(), "Registering media payload");
        self.payloads.write().insert(id.to_string(), payload);
        Ok(format!("{}/{}", base_url, id))
    }

    fn unregister_payload(&self, id: &str) {
        if self.payloads.write().remove(id).is_some() {
            debug!(id, "Media payload unregistered");
        }
    }
}

async fn serve_payload(State(payloads): State<PayloadMap>, Path(id): Path<String>) -> Response {
    let payload = payloads.read().get(&id).cloned();
    let Some(payload) = payload else {
        debug!(id = %id, "Unknown media requested");
        return (StatusCode::NOT_FOUND, "Unknown media").into_response();
    };
    let mime_type = payload
        .mime_type
        .clone()
        .unwrap_or_else(|| DEFAULT_MIME_TYPE.to_string());

    match payload.source() {
        MediaSource::Url(url) => (StatusCode::FOUND, [(header::LOCATION, url.clone())]).into_response(),
        MediaSource::Bytes(data) => ([(header::CONTENT_TYPE, mime_type)], data.clone()).into_response(),
        MediaSource::Path(path) => {
            let file = match tokio::fs::File::open(path).await {
                Ok(file) => file,
                Err(e) => {
                    warn!(id = %id, path = %path.display(), error = %e, "Cannot open media file");
                    return (StatusCode::NOT_FOUND, "Media file not found").into_response();
                }
            };
            let length = file.metadata().await.ok().map(|m| m.len());
            let body = Body::from_stream(ReaderStream::with_capacity(file, FILE_CHUNK_SIZE));

            let mut response = ([(header::CONTENT_TYPE, mime_type)], body).into_response();
            if let Some(length) = length {
                response
                    .headers_mut()
                    .insert(header::CONTENT_LENGTH, HeaderValue::from(length));
            }
            response
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_before_start_fails() {
        let server = MediaHttpServer::default();

        let result = server.register_payload("a", MediaPayload::from_bytes(vec![1u8], None));

        assert!(result.is_err());
        assert_eq!(server.payload_count(), 0);
    }

    #[tokio::test]
    async fn test_unspecified_host_advertises_reachable_ip() {
        let server = MediaHttpServer::default();
        server.start("0.0.0.0", 0).await.unwrap();

        let base_url = server.base_url().unwrap();
        assert!(!base_url.contains("0.0.0.0"));
        assert!(base_url.ends_with(&format!(":{}", server.local_addr().unwrap().port())));

        server.stop().await.unwrap();
        assert!(server.base_url().is_none());
    }

    #[tokio::test]
    async fn test_invalid_ids_are_rejected() {
        let server = MediaHttpServer::default();
        server.start("127.0.0.1", 0).await.unwrap();

        assert!(server.register_payload("", MediaPayload::from_bytes(vec![1u8], None)).is_err());
        assert!(server.register_payload("a/b", MediaPayload::from_bytes(vec![1u8], None)).is_err());

        server.stop().await.unwrap();
    }
}
