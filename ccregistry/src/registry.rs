use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use ccconfig::{Config, get_config};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::adapter::{AdapterFactory, BackendAdapter, BackendInfo};
use crate::device::{Device, DeviceId};
use crate::errors::{RegistryError, Result};
use crate::events::{
    DeviceEvent, DeviceEventKind, EventBus, EventStream, REASON_SHUTDOWN, Subscription,
};
use crate::media::{ADAPTER_NOT_AVAILABLE, DEVICE_UNKNOWN, MediaPayload, SendOptions, SendResult};
use crate::media_server::{MediaServer, MediaServerFactory};

/// `media_host` value that keeps the embedded media server off.
pub const MEDIA_SERVER_DISABLED: &str = "disabled";

/// `BackendInfo` option holding the discovery timeout, in seconds.
pub const DISCOVERY_TIMEOUT_OPTION: &str = "discovery_timeout_secs";

const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

type LoopTask = BoxFuture<'static, ()>;

#[derive(Default)]
struct RegistryState {
    devices: HashMap<DeviceId, Device>,
    backends: BTreeMap<String, BackendInfo>,
    factories: HashMap<String, AdapterFactory>,
    adapters: BTreeMap<String, Arc<dyn BackendAdapter>>,
    media_server: Option<Arc<dyn MediaServer>>,
    /// Entrée thread-safe vers la boucle du registre, présente tant qu'il tourne.
    loop_tx: Option<UnboundedSender<LoopTask>>,
    shutdown: Option<CancellationToken>,
    /// Set by `stop` before its sweep: catalog insertions are refused until it returns.
    stopping: bool,
}

struct RegistryInner {
    state: Mutex<RegistryState>,
    bus: Arc<EventBus>,
    /// Serializes `start` and `stop`.
    lifecycle: tokio::sync::Mutex<()>,
    running: AtomicBool,
    ready: watch::Sender<bool>,
    /// Task loop and backend-owned loops, cancelled by `stop`.
    background: TaskTracker,
    media_server_factory: Option<MediaServerFactory>,
    shutdown_timeout: Duration,
}

/// Device registry shared by the public API and the backends.
///
/// Owns the device catalog, fans every event out to subscribers and drives
/// the backend and media-server lifecycles. Cloning is cheap; every clone
/// designates the same registry.
///
/// ```no_run
/// use ccregistry::{Registry, MEDIA_SERVER_DISABLED};
///
/// # async fn run() -> Result<(), ccregistry::RegistryError> {
/// let registry = Registry::new();
/// let _sub = registry.subscribe(|event| async move {
///     println!("{} {}", event.name(), event.device_id());
///     Ok(())
/// });
/// registry.start(MEDIA_SERVER_DISABLED, 0).await?;
/// // ...
/// registry.stop().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Registry")
            .field("running", &self.is_running())
            .field("devices", &state.devices.len())
            .field("backends", &state.backends.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Registry {
    /// Registry without backends nor media server.
    pub fn new() -> Self {
        RegistryBuilder::new().build()
    }

    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// Weak handle given to backends.
    pub fn handle(&self) -> RegistryHandle {
        RegistryHandle {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    // ---------------------------------------------------------------
    // Catalogue
    // ---------------------------------------------------------------

    /// Snapshot of the known devices, sorted by id.
    pub fn list_devices(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self.inner.state.lock().devices.values().cloned().collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        devices
    }

    pub fn get_device(&self, id: &DeviceId) -> Option<Device> {
        self.inner.state.lock().devices.get(id).cloned()
    }

    /// Inserts or replaces `device`.
    ///
    /// Publishes `DeviceAdded` for a new id, `DeviceUpdated` otherwise, even
    /// when nothing changed (backends use it as a liveness refresh).
    ///
    /// Ignored while `stop` is in progress.
    pub fn register_device(&self, device: Device) {
        let mut state = self.inner.state.lock();
        if state.stopping {
            debug!(device_id = %device.id, "Registry stopping, device ignored");
            return;
        }
        let kind = match state.devices.insert(device.id.clone(), device.clone()) {
            None => {
                info!(device_id = %device.id, name = %device.name, transport = %device.transport, "Device added");
                DeviceEventKind::DeviceAdded { device }
            }
            Some(previous) => {
                let changes = previous.changed_fields(&device);
                debug!(device_id = %device.id, ?changes, "Device updated");
                DeviceEventKind::DeviceUpdated { device, changes }
            }
        };
        // Publication sous le verrou : l'ordre des événements suit l'ordre des mutations
        self.inner.bus.publish(DeviceEvent::now(kind));
    }

    /// Removes a device. Returns `false`, without publishing, when the id is unknown.
    pub fn unregister_device(&self, device_id: &DeviceId, reason: &str) -> bool {
        let mut state = self.inner.state.lock();
        if state.devices.remove(device_id).is_none() {
            return false;
        }
        info!(device_id = %device_id, reason, "Device removed");
        self.inner.bus.publish(DeviceEvent::now(DeviceEventKind::DeviceRemoved {
            device_id: device_id.clone(),
            reason: reason.to_string(),
        }));
        true
    }

    // ---------------------------------------------------------------
    // Événements
    // ---------------------------------------------------------------

    /// Registers an async callback, run as its own task for every event.
    ///
    /// Errors and panics of the callback are logged and dropped.
    pub fn subscribe<F, Fut>(&self, callback: F) -> Subscription
    where
        F: Fn(DeviceEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.inner.bus.subscribe_async(Arc::new(
            move |event: DeviceEvent| -> BoxFuture<'static, anyhow::Result<()>> {
                Box::pin(callback(event))
            },
        ))
    }

    /// Registers a blocking callback, run on the blocking pool for every event.
    ///
    /// Errors and panics of the callback are logged and dropped.
    pub fn subscribe_sync<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&DeviceEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.inner.bus.subscribe_sync(Arc::new(callback))
    }

    /// Stream of the events published from now on.
    pub fn events(&self) -> EventStream {
        self.inner.bus.stream()
    }

    /// Number of callback deliveries still running.
    pub fn in_flight_tasks(&self) -> usize {
        self.inner.bus.tasks().len()
    }

    fn publish(&self, kind: DeviceEventKind) {
        self.inner.bus.publish(DeviceEvent::now(kind));
    }

    // ---------------------------------------------------------------
    // Backends
    // ---------------------------------------------------------------

    /// Registers the factory of backend `name`, enabled unless a record says otherwise.
    ///
    /// Takes effect on the next `start`.
    pub fn register_backend<F>(&self, name: &str, factory: F)
    where
        F: Fn(RegistryHandle) -> Arc<dyn BackendAdapter> + Send + Sync + 'static,
    {
        let mut state = self.inner.state.lock();
        state.backends.entry(name.to_string()).or_default();
        state.factories.insert(name.to_string(), Arc::new(factory));
    }

    pub fn enable_backend(&self, name: &str) {
        self.inner
            .state
            .lock()
            .backends
            .entry(name.to_string())
            .or_default()
            .enabled = true;
    }

    pub fn disable_backend(&self, name: &str) {
        self.inner
            .state
            .lock()
            .backends
            .entry(name.to_string())
            .or_default()
            .enabled = false;
    }

    pub fn list_backends(&self) -> BTreeMap<String, BackendInfo> {
        self.inner.state.lock().backends.clone()
    }

    // ---------------------------------------------------------------
    // Cycle de vie
    // ---------------------------------------------------------------

    /// Starts the media server and every enabled backend.
    ///
    /// Does nothing when already running. `media_host` set to
    /// [`MEDIA_SERVER_DISABLED`] skips the media server. Backends start one
    /// after the other, in name order.
    ///
    /// On error the registry stays marked running so that `stop` can release
    /// whatever did start.
    pub async fn start(&self, media_host: &str, media_port: u16) -> Result<()> {
        let _guard = self.inner.lifecycle.lock().await;
        if self.is_running() {
            debug!("Registry already running");
            return Ok(());
        }
        info!("Starting registry");
        self.inner.running.store(true, Ordering::Release);
        self.inner.bus.set_runtime(Handle::try_current().ok());
        self.inner.bus.tasks().reopen();
        self.inner.background.reopen();

        let token = CancellationToken::new();
        let (loop_tx, loop_rx) = unbounded_channel::<LoopTask>();
        {
            let mut state = self.inner.state.lock();
            state.loop_tx = Some(loop_tx);
            state.shutdown = Some(token.clone());
        }
        self.inner.background.spawn(run_task_loop(
            loop_rx,
            self.inner.background.clone(),
            token,
        ));

        if media_host == MEDIA_SERVER_DISABLED {
            debug!("Media server disabled");
        } else if let Some(factory) = &self.inner.media_server_factory {
            let server = factory();
            self.inner.state.lock().media_server = Some(Arc::clone(&server));
            server
                .start(media_host, media_port)
                .await
                .map_err(|source| RegistryError::MediaServerStart {
                    host: media_host.to_string(),
                    port: media_port,
                    source,
                })?;
            info!(base_url = ?server.base_url(), "Media server started");
        } else {
            debug!("No media server configured");
        }

        let selected: Vec<(String, AdapterFactory)> = {
            let state = self.inner.state.lock();
            state
                .backends
                .iter()
                .filter(|(_, info)| info.enabled)
                .filter_map(|(name, _)| match state.factories.get(name) {
                    Some(factory) => Some((name.clone(), Arc::clone(factory))),
                    None => {
                        debug!(backend = %name, "No adapter registered for backend");
                        None
                    }
                })
                .collect()
        };

        let handle = self.handle();
        for (name, factory) in selected {
            let adapter = factory(handle.clone());
            // Enregistré avant le démarrage pour que stop() puisse le libérer en cas d'échec
            self.inner
                .state
                .lock()
                .adapters
                .insert(name.clone(), Arc::clone(&adapter));
            info!(backend = %name, "Starting backend");
            adapter
                .start()
                .await
                .map_err(|source| RegistryError::backend_start(&name, source))?;
        }

        self.inner.ready.send_replace(true);
        info!("Registry started");
        Ok(())
    }

    /// Starts with the media host and port of the global configuration.
    pub async fn start_configured(&self) -> Result<()> {
        let config = get_config();
        self.start(&config.get_media_host(), config.get_media_port())
            .await
    }

    /// Stops backends, scheduled work and media server, then empties the catalog.
    ///
    /// Publishes `DeviceRemoved { reason: "shutdown" }` for every known
    /// device and waits (bounded by the shutdown timeout) for the pending
    /// deliveries. Does nothing when not running. Cleanup goes on after a
    /// failure; the first error is returned at the end.
    pub async fn stop(&self) -> Result<()> {
        let _guard = self.inner.lifecycle.lock().await;
        if !self.is_running() {
            debug!("Registry not running");
            return Ok(());
        }
        info!("Stopping registry");
        self.inner.state.lock().stopping = true;
        self.inner.ready.send_replace(false);
        let mut first_error: Option<RegistryError> = None;

        let adapters = std::mem::take(&mut self.inner.state.lock().adapters);
        for (name, adapter) in adapters {
            info!(backend = %name, "Stopping backend");
            if let Err(err) = adapter.stop().await {
                warn!(backend = %name, error = %err, "Backend failed to stop");
                first_error.get_or_insert(RegistryError::backend_stop(&name, err));
            }
        }

        let (token, loop_tx) = {
            let mut state = self.inner.state.lock();
            (state.shutdown.take(), state.loop_tx.take())
        };
        drop(loop_tx);
        if let Some(token) = token {
            token.cancel();
        }
        self.inner.background.close();
        if tokio::time::timeout(self.inner.shutdown_timeout, self.inner.background.wait())
            .await
            .is_err()
        {
            warn!(
                pending = self.inner.background.len(),
                "Background tasks still running after shutdown timeout"
            );
        }

        let media_server = self.inner.state.lock().media_server.take();
        if let Some(server) = media_server {
            if let Err(err) = server.stop().await {
                warn!(error = %err, "Media server failed to stop");
                first_error.get_or_insert(RegistryError::MediaServerStop(err));
            }
        }

        {
            let mut state = self.inner.state.lock();
            let mut ids: Vec<DeviceId> = state.devices.keys().cloned().collect();
            ids.sort();
            for device_id in ids {
                self.inner.bus.publish(DeviceEvent::now(DeviceEventKind::DeviceRemoved {
                    device_id,
                    reason: REASON_SHUTDOWN.to_string(),
                }));
            }
            state.devices.clear();
        }

        let tasks = self.inner.bus.tasks();
        tasks.close();
        if tokio::time::timeout(self.inner.shutdown_timeout, tasks.wait())
            .await
            .is_err()
        {
            warn!(pending = tasks.len(), "Subscriber deliveries still running after shutdown timeout");
        }
        tasks.reopen();
        self.inner.background.reopen();
        self.inner.bus.set_runtime(None);

        self.inner.state.lock().stopping = false;
        self.inner.running.store(false, Ordering::Release);
        info!("Registry stopped");
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Resolves once `start` has completed.
    pub async fn wait_until_ready(&self) {
        let mut ready = self.inner.ready.subscribe();
        // le Sender vit aussi longtemps que `self`
        let _ = ready.wait_for(|ready| *ready).await;
    }

    // ---------------------------------------------------------------
    // Médias
    // ---------------------------------------------------------------

    /// Routes `payload` to the backend named by `device.transport`.
    ///
    /// Fails with [`DEVICE_UNKNOWN`] when the device is not in the catalog,
    /// [`ADAPTER_NOT_AVAILABLE`] when that backend is not running. The backend
    /// result is returned unchanged.
    pub async fn send_media(
        &self,
        device: &Device,
        payload: &MediaPayload,
        options: &SendOptions,
    ) -> SendResult {
        let adapter = {
            let state = self.inner.state.lock();
            if !state.devices.contains_key(&device.id) {
                debug!(device_id = %device.id, "send_media on unknown device");
                return SendResult::failure(DEVICE_UNKNOWN);
            }
            match state.adapters.get(&device.transport) {
                Some(adapter) => Arc::clone(adapter),
                None => {
                    debug!(device_id = %device.id, transport = %device.transport, "No running backend");
                    return SendResult::failure(ADAPTER_NOT_AVAILABLE);
                }
            }
        };
        adapter.send_media(device, payload, options).await
    }

    /// URL under which the running media server serves `payload`.
    pub fn register_media_payload(&self, id: &str, payload: MediaPayload) -> Result<String> {
        let server = self
            .inner
            .state
            .lock()
            .media_server
            .clone()
            .ok_or(RegistryError::MediaServerUnavailable)?;
        server
            .register_payload(id, payload)
            .map_err(|source| RegistryError::MediaPayload {
                id: id.to_string(),
                source,
            })
    }

    pub fn unregister_media_payload(&self, id: &str) {
        let server = self.inner.state.lock().media_server.clone();
        if let Some(server) = server {
            server.unregister_payload(id);
        }
    }

    // ---------------------------------------------------------------
    // Boucle du registre
    // ---------------------------------------------------------------

    /// Submits `work` to the registry loop from any thread.
    ///
    /// Returns `false` when the registry is not running: the work is dropped
    /// unpolled, releasing whatever it owns.
    pub fn schedule_task<F>(&self, work: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let sender = self.inner.state.lock().loop_tx.clone();
        match sender {
            Some(tx) => {
                if tx.send(Box::pin(work)).is_err() {
                    warn!("Registry loop closed, discarding scheduled task");
                    return false;
                }
                true
            }
            None => {
                warn!("Registry not running, discarding scheduled task");
                false
            }
        }
    }

    fn spawn_background<F>(&self, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = self.inner.state.lock().shutdown.clone();
        let Some(token) = token else {
            warn!("Registry not running, background task not spawned");
            return false;
        };
        let Some(runtime) = Handle::try_current().ok().or_else(|| self.inner.bus.runtime()) else {
            warn!("No runtime available, background task not spawned");
            return false;
        };
        self.inner.background.spawn_on(
            async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = task => {}
                }
            },
            &runtime,
        );
        true
    }
}

/// Consumes the work submitted through `schedule_task` while the registry runs.
///
/// Each work item runs on `tasks` until it ends or `token` is cancelled, so
/// `stop` cancels and awaits it before sweeping the catalog.
async fn run_task_loop(
    mut rx: UnboundedReceiver<LoopTask>,
    tasks: TaskTracker,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            work = rx.recv() => match work {
                Some(work) => {
                    let token = token.clone();
                    tasks.spawn(async move {
                        tokio::select! {
                            _ = token.cancelled() => {}
                            _ = work => {}
                        }
                    });
                }
                None => break,
            },
        }
    }

    rx.close();
    let mut discarded = 0usize;
    while let Ok(work) = rx.try_recv() {
        drop(work);
        discarded += 1;
    }
    if discarded > 0 {
        warn!(discarded, "Registry stopped, discarding scheduled tasks");
    }
}

/// Weak handle on a [`Registry`], given to backends.
///
/// Holding it does not keep the registry alive; every call becomes a no-op
/// once the registry is gone.
#[derive(Clone)]
pub struct RegistryHandle {
    inner: Weak<RegistryInner>,
}

impl std::fmt::Debug for RegistryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryHandle")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

impl RegistryHandle {
    pub fn upgrade(&self) -> Option<Registry> {
        self.inner.upgrade().map(|inner| Registry { inner })
    }

    pub fn is_running(&self) -> bool {
        self.upgrade().is_some_and(|registry| registry.is_running())
    }

    pub fn register_device(&self, device: Device) {
        if let Some(registry) = self.upgrade() {
            registry.register_device(device);
        }
    }

    pub fn unregister_device(&self, device_id: &DeviceId, reason: &str) -> bool {
        self.upgrade()
            .is_some_and(|registry| registry.unregister_device(device_id, reason))
    }

    /// Publishes a status event (heartbeat, media status, volume).
    ///
    /// Catalog changes go through `register_device` / `unregister_device`.
    pub fn publish(&self, kind: DeviceEventKind) {
        if let Some(registry) = self.upgrade() {
            registry.publish(kind);
        }
    }

    pub fn schedule_task<F>(&self, work: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match self.upgrade() {
            Some(registry) => registry.schedule_task(work),
            None => {
                warn!("Registry dropped, discarding scheduled task");
                false
            }
        }
    }

    pub fn register_media_payload(&self, id: &str, payload: MediaPayload) -> Result<String> {
        self.upgrade()
            .ok_or(RegistryError::MediaServerUnavailable)?
            .register_media_payload(id, payload)
    }

    pub fn unregister_media_payload(&self, id: &str) {
        if let Some(registry) = self.upgrade() {
            registry.unregister_media_payload(id);
        }
    }

    /// Runs a backend-owned loop until it ends or the registry stops.
    ///
    /// `stop` cancels the loop at its next await point and waits for it.
    pub fn spawn_background<F>(&self, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.upgrade()
            .is_some_and(|registry| registry.spawn_background(task))
    }

    /// Resolves `true` once the registry has started, `false` if it is dropped first.
    pub async fn wait_until_ready(&self) -> bool {
        let Some(mut ready) = self.inner.upgrade().map(|inner| inner.ready.subscribe()) else {
            return false;
        };
        ready.wait_for(|ready| *ready).await.is_ok()
    }
}

/// Builder for [`Registry`].
#[derive(Default)]
pub struct RegistryBuilder {
    backends: BTreeMap<String, BackendInfo>,
    factories: HashMap<String, AdapterFactory>,
    media_server: Option<MediaServerFactory>,
    shutdown_timeout: Option<Duration>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder seeded from the global configuration.
    pub fn configured() -> Self {
        Self::from_config(&get_config())
    }

    /// Builder seeded with the `backends` records and the shutdown timeout of `config`.
    ///
    /// Each record gets the global `discovery.timeout_secs` as its
    /// `discovery_timeout_secs` option unless it sets its own.
    pub fn from_config(config: &Config) -> Self {
        let mut builder = Self::new();

        let discovery_timeout = config.get_discovery_timeout_secs().ok();

        match config.get_backends() {
            Ok(backends) => {
                for (name, record) in backends {
                    match serde_yaml::from_value::<BackendInfo>(record) {
                        Ok(mut info) => {
                            if let Some(secs) = discovery_timeout {
                                info.options
                                    .entry(DISCOVERY_TIMEOUT_OPTION.to_string())
                                    .or_insert_with(|| serde_json::Value::from(secs as u64));
                            }
                            builder.backends.insert(name, info);
                        }
                        Err(err) => {
                            warn!(backend = %name, error = %err, "Ignoring invalid backend record")
                        }
                    }
                }
            }
            Err(err) => warn!(error = %err, "Cannot read backends from configuration"),
        }

        if let Ok(ms) = config.get_shutdown_timeout_ms() {
            builder.shutdown_timeout = Some(Duration::from_millis(ms as u64));
        }
        builder
    }

    pub fn backend<F>(mut self, name: &str, factory: F) -> Self
    where
        F: Fn(RegistryHandle) -> Arc<dyn BackendAdapter> + Send + Sync + 'static,
    {
        self.backends.entry(name.to_string()).or_default();
        self.factories.insert(name.to_string(), Arc::new(factory));
        self
    }

    pub fn backend_info(mut self, name: &str, info: BackendInfo) -> Self {
        self.backends.insert(name.to_string(), info);
        self
    }

    pub fn media_server<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Arc<dyn MediaServer> + Send + Sync + 'static,
    {
        self.media_server = Some(Arc::new(factory));
        self
    }

    /// Upper bound on the waits performed by `stop`.
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Registry {
        let (ready, _) = watch::channel(false);
        let state = RegistryState {
            backends: self.backends,
            factories: self.factories,
            ..RegistryState::default()
        };
        Registry {
            inner: Arc::new(RegistryInner {
                state: Mutex::new(state),
                bus: Arc::new(EventBus::new()),
                lifecycle: tokio::sync::Mutex::new(()),
                running: AtomicBool::new(false),
                ready,
                background: TaskTracker::new(),
                media_server_factory: self.media_server,
                shutdown_timeout: self.shutdown_timeout.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT),
            }),
        }
    }
}
