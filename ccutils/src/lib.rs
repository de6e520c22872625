//! Network helpers shared by the CommonCast crates.
//!
//! # Main functions
//!
//! - [`guess_local_ip`] : guess the local IP used for outgoing connections
//! - [`is_unspecified_host`] : tell whether a bind host listens on every interface
//!
//! # Examples
//!
//! ```
//! use ccutils::{guess_local_ip, is_unspecified_host};
//!
//! let host = "0.0.0.0";
//! let public = if is_unspecified_host(host) { guess_local_ip() } else { host.to_string() };
//! assert!(!public.is_empty());
//! ```

mod ip_utils;

pub use ip_utils::{guess_local_ip, is_unspecified_host};
