//! # ccmediaserver - Serveur média embarqué pour CommonCast
//!
//! Serves the payloads registered with [`ccregistry::Registry::register_media_payload`]
//! over HTTP so that renderers can fetch them:
//!
//! - in-memory bytes are returned as-is;
//! - local files are streamed;
//! - remote URLs are answered with a redirect.
//!
//! The crate also hosts the logging setup shared by the binaries.
//!
//! ## Example
//!
//! ```rust,no_run
//! use ccmediaserver::{MediaHttpServer, logs::init_logging};
//! use ccregistry::{MediaPayload, Registry};
//!
//! # async fn run() -> anyhow::Result<()> {
//! init_logging();
//!
//! let registry = Registry::builder()
//!     .media_server(MediaHttpServer::factory())
//!     .build();
//! registry.start("0.0.0.0", 8090).await?;
//!
//! let url = registry.register_media_payload(
//!     "cover",
//!     MediaPayload::from_path("/tmp/cover.jpg", Some("image/jpeg")),
//! )?;
//! println!("cover available at {url}");
//! # Ok(())
//! # }
//! ```

pub mod logs;
pub mod server;

pub use server::MediaHttpServer;

use ccregistry::RegistryBuilder;

/// Registry builder seeded from the global configuration, with the HTTP media server.
pub fn configured_registry() -> RegistryBuilder {
    RegistryBuilder::configured().media_server(MediaHttpServer::factory())
}
