//! `lxdlet` maps pod sandboxes and containers onto an LXD-like container
//! hypervisor whose only native objects are profiles and instances.
//!
//! # Overview
//!
//! The hypervisor knows nothing about pods: it offers two object kinds, each
//! carrying a flat string-to-string config map and a set of named devices.
//! lxdlet is the translation and lifecycle layer in between:
//!
//! - **Entity codec**: [`Sandbox`] and [`Container`] values encode into and
//!   decode out of the flat config maps of profiles and instances with full
//!   round-trip fidelity, without ever clobbering caller-supplied keys.
//! - **Key namespace rules**: the [`keyspace`] module declares which flat keys
//!   and prefixes this layer owns and recovers the opaque remainder.
//! - **Device variants**: the [`device`] module gives the hypervisor's named
//!   device entries a typed, closed set of shapes.
//! - **Schema migration**: every written object carries a schema tag; the
//!   [`migration`] module walks older objects up to the current layout once at
//!   startup.
//! - **Network backends**: the [`network`] module defines the lifecycle-hook
//!   interface pod networking plugs into, with a managed-bridge backend and a
//!   CNI conf-driven backend.
//! - **Shim driver**: the [`shim`] module ties the above to a store, drives
//!   sandbox and container lifecycles, and feeds hypervisor lifecycle events
//!   into the network hooks.
//!
//! # Usage Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use lxdlet::{
//!     network::{BridgeConfig, BridgeNetwork},
//!     shim::{spawn_event_listener, Shim},
//!     Migrator, Sandbox, SandboxMetadata,
//! };
//! use lxdstore::MemoryStore;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(MemoryStore::new());
//!     let network = Arc::new(BridgeNetwork::new(
//!         store.clone(),
//!         BridgeConfig::default(),
//!     ));
//!
//!     // Bring older objects up to the current schema before serving.
//!     Migrator::new(store.clone()).ensure().await?;
//!
//!     let shim = Arc::new(Shim::new(store, network));
//!     let _listener = spawn_event_listener(shim.clone()).await?;
//!
//!     let mut sandbox = Sandbox::with_metadata(SandboxMetadata {
//!         name: "web".to_string(),
//!         namespace: "default".to_string(),
//!         uid: "uid-1".to_string(),
//!         attempt: 0,
//!     });
//!     shim.apply_sandbox(&mut sandbox).await?;
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]

mod container;
mod error;
mod migration;
mod sandbox;
mod utils;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub mod device;
pub mod keyspace;
pub mod network;
pub mod shim;

pub use container::*;
pub use error::*;
pub use migration::*;
pub use sandbox::*;
