#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use ccregistry::{
    BackendAdapter, Device, DeviceEvent, EventStream, MediaPayload, Registry, RegistryHandle,
    SendOptions, SendResult,
};

/// Compteurs partagés entre le test et les instances créées par la factory
#[derive(Clone, Default)]
pub struct AdapterCounters {
    pub starts: Arc<AtomicUsize>,
    pub stops: Arc<AtomicUsize>,
    pub sends: Arc<AtomicUsize>,
}

impl AdapterCounters {
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn sends(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }
}

/// Backend de test : compte les appels et accepte tous les envois
pub struct StubAdapter {
    pub handle: RegistryHandle,
    pub counters: AdapterCounters,
    pub fail_start: bool,
    pub start_delay: Duration,
}

#[async_trait]
impl BackendAdapter for StubAdapter {
    async fn start(&self) -> anyhow::Result<()> {
        self.counters.starts.fetch_add(1, Ordering::SeqCst);
        if !self.start_delay.is_zero() {
            tokio::time::sleep(self.start_delay).await;
        }
        if self.fail_start {
            anyhow::bail!("cannot open discovery socket");
        }
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.counters.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn send_media(
        &self,
        device: &Device,
        payload: &MediaPayload,
        _options: &SendOptions,
    ) -> SendResult {
        self.counters.sends.fetch_add(1, Ordering::SeqCst);
        SendResult::ok()
            .with_metadata("device", device.id.as_str())
            .with_metadata("mime_type", payload.mime_type.clone().unwrap_or_default())
    }
}

pub fn stub_factory(
    counters: &AdapterCounters,
    fail_start: bool,
) -> impl Fn(RegistryHandle) -> Arc<dyn BackendAdapter> + Send + Sync + 'static {
    slow_stub_factory(counters, Duration::ZERO, fail_start)
}

/// Comme `stub_factory`, mais `start` dort `start_delay` avant de rendre la main
pub fn slow_stub_factory(
    counters: &AdapterCounters,
    start_delay: Duration,
    fail_start: bool,
) -> impl Fn(RegistryHandle) -> Arc<dyn BackendAdapter> + Send + Sync + 'static {
    let counters = counters.clone();
    move |handle| {
        Arc::new(StubAdapter {
            handle,
            counters: counters.clone(),
            fail_start,
            start_delay,
        }) as Arc<dyn BackendAdapter>
    }
}

pub async fn next_event(stream: &mut EventStream) -> DeviceEvent {
    tokio::time::timeout(Duration::from_secs(2), stream.next_event())
        .await
        .expect("no event within 2s")
        .expect("event stream closed")
}

/// Attend que toutes les livraisons aux abonnés soient terminées
pub async fn wait_idle(registry: &Registry) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while registry.in_flight_tasks() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("deliveries still in flight after 5s");
}

pub async fn eventually<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached within 5s");
}
