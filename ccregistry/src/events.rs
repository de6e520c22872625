use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::{FutureExt, Stream};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::device::{Device, DeviceId};

/// Reason attached to the removals published by `Registry::stop`.
pub const REASON_SHUTDOWN: &str = "shutdown";
/// Reason used by backends when a device stops answering.
pub const REASON_LOST: &str = "lost";

/// What happened to a device.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceEventKind {
    DeviceAdded {
        device: Device,
    },
    DeviceUpdated {
        device: Device,
        /// Attribute names that differ from the previous record (may be empty).
        changes: BTreeSet<String>,
    },
    DeviceRemoved {
        device_id: DeviceId,
        reason: String,
    },
    DeviceHeartbeat {
        device_id: DeviceId,
    },
    MediaStatusUpdated {
        device_id: DeviceId,
        /// "playing", "paused", "buffering", "idle", ...
        status: String,
        session_id: Option<String>,
        /// Playback position in seconds.
        position: Option<f64>,
    },
    VolumeUpdated {
        device_id: DeviceId,
        /// Between 0.0 and 1.0.
        level: f64,
        muted: bool,
    },
}

/// Immutable event handed to subscribers, stamped at publish time.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DeviceEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: DeviceEventKind,
}

impl DeviceEvent {
    pub fn now(kind: DeviceEventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
        }
    }

    /// Id of the device the event is about.
    pub fn device_id(&self) -> &DeviceId {
        match &self.kind {
            DeviceEventKind::DeviceAdded { device } => &device.id,
            DeviceEventKind::DeviceUpdated { device, .. } => &device.id,
            DeviceEventKind::DeviceRemoved { device_id, .. }
            | DeviceEventKind::DeviceHeartbeat { device_id }
            | DeviceEventKind::MediaStatusUpdated { device_id, .. }
            | DeviceEventKind::VolumeUpdated { device_id, .. } => device_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match &self.kind {
            DeviceEventKind::DeviceAdded { .. } => "device_added",
            DeviceEventKind::DeviceUpdated { .. } => "device_updated",
            DeviceEventKind::DeviceRemoved { .. } => "device_removed",
            DeviceEventKind::DeviceHeartbeat { .. } => "device_heartbeat",
            DeviceEventKind::MediaStatusUpdated { .. } => "media_status_updated",
            DeviceEventKind::VolumeUpdated { .. } => "volume_updated",
        }
    }
}

pub(crate) type AsyncCallback =
    Arc<dyn Fn(DeviceEvent) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;
pub(crate) type SyncCallback = Arc<dyn Fn(&DeviceEvent) -> anyhow::Result<()> + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SubscriberKind {
    Async,
    Sync,
}

/// Fan-out of every published event to the three consumption models:
/// pull streams, async callbacks and blocking callbacks.
pub(crate) struct EventBus {
    streams: Mutex<Vec<UnboundedSender<DeviceEvent>>>,
    async_subscribers: Mutex<Vec<(u64, AsyncCallback)>>,
    sync_subscribers: Mutex<Vec<(u64, SyncCallback)>>,
    next_id: AtomicU64,
    /// In-flight deliveries; entries leave the set when the task ends.
    tasks: TaskTracker,
    /// Runtime used when `publish` is called from outside of it.
    runtime: Mutex<Option<Handle>>,
}

impl EventBus {
    pub(crate) fn new() -> Self {
        Self {
            streams: Mutex::new(Vec::new()),
            async_subscribers: Mutex::new(Vec::new()),
            sync_subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            tasks: TaskTracker::new(),
            runtime: Mutex::new(None),
        }
    }

    pub(crate) fn tasks(&self) -> &TaskTracker {
        &self.tasks
    }

    pub(crate) fn set_runtime(&self, handle: Option<Handle>) {
        *self.runtime.lock() = handle;
    }

    pub(crate) fn runtime(&self) -> Option<Handle> {
        self.runtime.lock().clone()
    }

    pub(crate) fn stream(&self) -> EventStream {
        let (tx, rx) = unbounded_channel();
        self.streams.lock().push(tx);
        EventStream { rx }
    }

    pub(crate) fn subscribe_async(self: &Arc<Self>, callback: AsyncCallback) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.async_subscribers.lock().push((id, callback));
        Subscription::new(Arc::downgrade(self), SubscriberKind::Async, id)
    }

    pub(crate) fn subscribe_sync(self: &Arc<Self>, callback: SyncCallback) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.sync_subscribers.lock().push((id, callback));
        Subscription::new(Arc::downgrade(self), SubscriberKind::Sync, id)
    }

    fn remove(&self, kind: SubscriberKind, id: u64) {
        match kind {
            SubscriberKind::Async => self.async_subscribers.lock().retain(|(i, _)| *i != id),
            SubscriberKind::Sync => self.sync_subscribers.lock().retain(|(i, _)| *i != id),
        }
    }

    /// Hands `event` to every consumer. Never waits for a subscriber.
    pub(crate) fn publish(&self, event: DeviceEvent) {
        debug!(event = event.name(), device_id = %event.device_id(), "Publishing event");

        // Les flux abandonnés par leur lecteur disparaissent au premier envoi raté
        self.streams
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());

        let async_subscribers: Vec<AsyncCallback> = self
            .async_subscribers
            .lock()
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        let sync_subscribers: Vec<SyncCallback> = self
            .sync_subscribers
            .lock()
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        if async_subscribers.is_empty() && sync_subscribers.is_empty() {
            return;
        }

        let Some(handle) = Handle::try_current()
            .ok()
            .or_else(|| self.runtime.lock().clone())
        else {
            warn!(
                event = event.name(),
                "No runtime available, callbacks will not see this event"
            );
            return;
        };

        for callback in async_subscribers {
            let event = event.clone();
            let name = event.name();
            self.tasks.spawn_on(
                async move {
                    match AssertUnwindSafe(async move { callback(event).await })
                        .catch_unwind()
                        .await
                    {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => debug!(event = name, error = %err, "Subscriber failed"),
                        Err(_) => warn!(event = name, "Subscriber panicked"),
                    }
                },
                &handle,
            );
        }

        for callback in sync_subscribers {
            let event = event.clone();
            self.tasks.spawn_blocking_on(
                move || match std::panic::catch_unwind(AssertUnwindSafe(|| callback(&event))) {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        debug!(event = event.name(), error = %err, "Sync subscriber failed")
                    }
                    Err(_) => warn!(event = event.name(), "Sync subscriber panicked"),
                },
                &handle,
            );
        }
    }
}

/// Handle on a callback registered with `Registry::subscribe` or
/// `Registry::subscribe_sync`.
///
/// Dropping the handle keeps the callback registered; call
/// [`Subscription::unsubscribe`] to remove it.
pub struct Subscription {
    bus: Weak<EventBus>,
    kind: SubscriberKind,
    id: u64,
    active: AtomicBool,
}

impl Subscription {
    fn new(bus: Weak<EventBus>, kind: SubscriberKind, id: u64) -> Self {
        Self {
            bus,
            kind,
            id,
            active: AtomicBool::new(true),
        }
    }

    /// Removes the callback. Calling it again is a no-op.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(self.kind, self.id);
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Pull-style view of the events published after its creation.
///
/// The stream only ends once the registry itself is gone.
pub struct EventStream {
    rx: UnboundedReceiver<DeviceEvent>,
}

impl EventStream {
    /// Waits for the next event.
    pub async fn next_event(&mut self) -> Option<DeviceEvent> {
        self.rx.recv().await
    }
}

impl Stream for EventStream {
    type Item = DeviceEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heartbeat(id: &str) -> DeviceEvent {
        DeviceEvent::now(DeviceEventKind::DeviceHeartbeat {
            device_id: DeviceId::from(id),
        })
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = heartbeat("dev1");
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["type"], "device_heartbeat");
        assert_eq!(json["device_id"], "dev1");
        assert!(json.get("timestamp").is_some());
    }

    #[test]
    fn test_dropped_streams_are_pruned() {
        let bus = EventBus::new();
        let kept = bus.stream();
        drop(bus.stream());

        bus.publish(heartbeat("dev1"));

        assert_eq!(bus.streams.lock().len(), 1);
        drop(kept);
    }

    #[test]
    fn test_unsubscribe_twice_is_noop() {
        let bus = Arc::new(EventBus::new());
        let sub = bus.subscribe_sync(Arc::new(|_| Ok(())));

        sub.unsubscribe();
        sub.unsubscribe();

        assert!(!sub.is_active());
        assert!(bus.sync_subscribers.lock().is_empty());
    }

    #[test]
    fn test_publish_without_runtime_still_feeds_streams() {
        let bus = Arc::new(EventBus::new());
        let mut stream = bus.stream();
        let _sub = bus.subscribe_sync(Arc::new(|_| Ok(())));

        bus.publish(heartbeat("dev1"));

        let received = stream.rx.try_recv().unwrap();
        assert_eq!(received.device_id().as_str(), "dev1");
    }
}
