//! # Gangway
//!
//! Gangway translates Kubernetes routing objects (Ingress, HTTPProxy,
//! Gateway API routes and their supporting Services and Secrets) into Envoy
//! configuration and serves it to Envoy over aggregated xDS.
//!
//! ## Architecture
//!
//! ```text
//! objects → ResourceStore → Builder (processors) → Dag → translate → SnapshotCache → ADS
//!                                 ↓
//!                          StatusUpdate per object
//! ```
//!
//! - **[`store`]**: the objects that can affect routing, with relevance filtering
//! - **[`dag`]**: the routing graph and the processors that build it
//! - **[`xds`]**: Envoy resource translation, the snapshot cache and the ADS server
//! - **[`EventHandler`]**: glues the three together, rebuilding on every relevant change
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use gangway::{k8s::manifest::parse_manifest, Config, EventHandler, Result};
//!
//! fn main() -> Result<()> {
//!     let handler = EventHandler::new(&Config::default());
//!     for object in parse_manifest(&std::fs::read_to_string("kuard.yaml")?)? {
//!         handler.on_add(object);
//!     }
//!     for status in handler.statuses() {
//!         println!("{} {}", status.key, status.state);
//!     }
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod config;
pub mod dag;
pub mod errors;
pub mod event_handler;
pub mod k8s;
pub mod observability;
pub mod store;
pub mod utils;
pub mod xds;

pub use config::Config;
pub use errors::{Error, Result};
pub use event_handler::EventHandler;

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name from Cargo.toml
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
