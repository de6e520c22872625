//! # ccregistry - Registre de périphériques CommonCast
//!
//! Central catalog of the casting devices found by the protocol backends
//! (Chromecast, DLNA/UPnP, DIAL, ...), with:
//!
//! - a device catalog keyed by [`DeviceId`], kept up to date by the backends
//!   through a weak [`RegistryHandle`];
//! - event fan-out to three consumption models: pull streams
//!   ([`Registry::events`]), async callbacks ([`Registry::subscribe`]) and
//!   blocking callbacks ([`Registry::subscribe_sync`]);
//! - the start/stop lifecycle of the enabled backends and of the embedded
//!   media server;
//! - [`Registry::send_media`], routing a payload to the backend of a device.
//!
//! A misbehaving subscriber (error, panic, slowness) never affects the
//! publisher nor the other subscribers.
//!
//! ## Example
//!
//! ```no_run
//! use ccregistry::{Device, Registry, MEDIA_SERVER_DISABLED};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let registry = Registry::new();
//! let mut events = registry.events();
//!
//! registry.start(MEDIA_SERVER_DISABLED, 0).await?;
//! registry.register_device(Device::new("dev1", "Salon", "chromecast"));
//!
//! if let Some(event) = events.next_event().await {
//!     println!("{} {}", event.name(), event.device_id());
//! }
//! registry.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod device;
pub mod errors;
pub mod events;
pub mod media;
pub mod media_server;
pub mod registry;

pub use adapter::{AdapterFactory, BackendAdapter, BackendInfo};
pub use device::{Capability, Device, DeviceId, TransportInfo};
pub use errors::{RegistryError, Result};
pub use events::{
    DeviceEvent, DeviceEventKind, EventStream, REASON_LOST, REASON_SHUTDOWN, Subscription,
};
pub use media::{
    ADAPTER_NOT_AVAILABLE, DEVICE_UNKNOWN, MediaController, MediaImage, MediaMetadata,
    MediaPayload, MediaSource, SendOptions, SendResult,
};
pub use media_server::{MediaServer, MediaServerFactory};
pub use registry::{
    DISCOVERY_TIMEOUT_OPTION, MEDIA_SERVER_DISABLED, Registry, RegistryBuilder, RegistryHandle,
};
