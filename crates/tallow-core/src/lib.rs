//! # tallow-core
//!
//! Entitlement allocation engine: issues time-bounded, quantity-limited
//! rights to use a product to registered consumers, drawn from finite
//! pool inventories derived from subscriptions.
//!
//! The hard part is automatic selection (autobind/heal): given a
//! consumer's installed products and physical facts, pick a minimal
//! valid combination of pools that satisfies coverage rules, honoring
//! stacking groups, multi-entitlement limits, and
//! virtualization-derived bonus capacity, without over- or
//! under-allocating shared inventory under concurrent requests.
//!
//! ## Components
//!
//! - [`catalog`]: read-only products, attributes, provided-product
//!   resolution, subscriptions
//! - [`consumer`]: consumer facts and the derived guest/host mapping
//! - [`pool`]: pool inventory and the store with per-pool atomic
//!   reservation
//! - [`stack`]: stacking groups and deterministic selection order
//! - [`coverage`]: required-quantity arithmetic
//! - [`bonus`]: virtualization bonus pool derivation
//! - [`autobind`]: the heal orchestrator
//! - [`engine`]: the facade collaborators talk to
//! - [`config`]: engine tunables
//!
//! ## Example
//!
//! ```rust
//! use chrono::{Duration, Utc};
//! use tallow_core::catalog::{Product, Subscription, ValidityWindow, attr};
//! use tallow_core::config::EngineConfig;
//! use tallow_core::consumer::Consumer;
//! use tallow_core::engine::Engine;
//!
//! let engine = Engine::new(EngineConfig::default());
//! engine.upsert_product(Product::new("os", "Operating System")
//!     .with_attribute(attr::SOCKETS, "2"));
//!
//! let now = Utc::now();
//! engine.create_subscription(&Subscription {
//!     id: "sub-1".to_string(),
//!     owner: "acme".to_string(),
//!     product_id: "os".to_string(),
//!     quantity: 10,
//!     window: ValidityWindow::new(now, now + Duration::days(365)),
//! }).unwrap();
//!
//! engine.register_consumer(
//!     Consumer::new("box-1", "acme").with_installed_product("os"),
//! );
//! let entitlements = engine.bind("box-1").unwrap();
//! assert_eq!(entitlements.len(), 1);
//! ```
//!
//! ## Concurrency model
//!
//! Pool quantity is the only shared-mutable resource; reservation is a
//! per-pool check-and-increment under that pool's own lock, never a
//! store-wide one. Heals for one consumer serialize; independent
//! consumers run concurrently. Bonus derivation for one hypervisor is
//! serialized so concurrent qualifying commits cannot race-create
//! duplicate pools.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod autobind;
pub mod bonus;
pub mod catalog;
pub mod config;
pub mod consumer;
pub mod coverage;
pub mod engine;
mod locks;
pub mod pool;
pub mod stack;

pub use autobind::BindError;
pub use config::EngineConfig;
pub use engine::{CertificateNotifier, Engine, EngineError};
pub use pool::{Entitlement, Pool, PoolSnapshot};
