//! Démonstration du registre avec un backend simulé
//!
//! ```text
//! cargo run -p ccmediaserver --example cast_demo -- /path/to/file.mp3
//! ```
//!
//! A fake "simulated" backend announces one renderer, the media given on the
//! command line is published through the embedded media server, then sent
//! to the renderer. Stops after 10 seconds or on Ctrl+C.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ccmediaserver::{configured_registry, logs::init_logging};
use ccregistry::{
    BackendAdapter, Capability, Device, DeviceEventKind, DeviceId, MediaController,
    MediaPayload, RegistryHandle, SendOptions, SendResult,
};
use tracing::{info, warn};

const BACKEND: &str = "simulated";

struct SimulatedController;

#[async_trait]
impl MediaController for SimulatedController {
    fn backend(&self) -> &str {
        BACKEND
    }

    async fn pause(&self) -> anyhow::Result<()> {
        info!("simulated renderer paused");
        Ok(())
    }
}

struct SimulatedBackend {
    handle: RegistryHandle,
}

#[async_trait]
impl BackendAdapter for SimulatedBackend {
    async fn start(&self) -> anyhow::Result<()> {
        let handle = self.handle.clone();
        self.handle.spawn_background(async move {
            handle.register_device(
                Device::new("sim-1", "Simulated renderer", BACKEND)
                    .with_model("Virtual Speaker")
                    .with_capability(Capability::AUDIO),
            );
            loop {
                tokio::time::sleep(Duration::from_secs(2)).await;
                handle.publish(DeviceEventKind::DeviceHeartbeat {
                    device_id: DeviceId::from("sim-1"),
                });
            }
        });
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn send_media(
        &self,
        device: &Device,
        payload: &MediaPayload,
        _options: &SendOptions,
    ) -> SendResult {
        info!(device_id = %device.id, source = ?payload.source(), "simulated renderer playing");
        self.handle.publish(DeviceEventKind::MediaStatusUpdated {
            device_id: device.id.clone(),
            status: "playing".to_string(),
            session_id: Some("sim-session".to_string()),
            position: Some(0.0),
        });
        SendResult::ok().with_controller(Arc::new(SimulatedController))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let registry = configured_registry()
        .backend(BACKEND, |handle| {
            Arc::new(SimulatedBackend { handle }) as Arc<dyn BackendAdapter>
        })
        .build();

    let _printer = registry.subscribe(|event| async move {
        println!("{}", serde_json::to_string(&event)?);
        Ok::<(), anyhow::Error>(())
    });
    let mut events = registry.events();

    registry.start_configured().await?;

    // attendre l'annonce du renderer
    let device = loop {
        match events.next_event().await {
            Some(event) => {
                if let DeviceEventKind::DeviceAdded { device } = event.kind {
                    break device;
                }
            }
            None => anyhow::bail!("event stream closed"),
        }
    };

    let payload = match std::env::args().nth(1) {
        Some(path) => MediaPayload::from_path(path, None),
        None => MediaPayload::from_bytes(&b"not really an mp3"[..], Some("audio/mpeg")),
    };
    let payload = match registry.register_media_payload("demo", payload.clone()) {
        Ok(url) => {
            info!(url = %url, "media published");
            MediaPayload::from_url(url, payload.mime_type.as_deref())
        }
        Err(e) => {
            warn!(error = %e, "media server unavailable, sending the payload as-is");
            payload
        }
    };

    let result = registry
        .send_media(&device, &payload, &SendOptions::default())
        .await;
    info!(success = result.success, reason = ?result.reason(), "send_media done");
    if let Some(controller) = result.controller {
        controller.pause().await?;
        controller.seek(42.0).await?;
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Ctrl+C reçu, arrêt"),
        _ = tokio::time::sleep(Duration::from_secs(10)) => {}
    }

    registry.stop().await?;
    Ok(())
}
