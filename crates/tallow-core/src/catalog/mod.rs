//! Product and subscription catalog.
//!
//! The catalog is a read-only view over the records the import service
//! feeds us: products (with their attribute maps and provided-product
//! sets) and the subscriptions that generate pool inventory. The
//! allocator never mutates catalog records; it only asks which products
//! a pool satisfies and what a product's allocation attributes are.
//!
//! # Attribute parsing
//!
//! Product attributes arrive as a string map. Typed accessors parse on
//! demand and fall back to defaults on junk values (logged at `warn`),
//! so a malformed attribute degrades a single product rather than
//! failing an allocation request.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};


/// Well-known product attribute keys read by the allocator.
pub mod attr {
    /// Sockets covered per entitlement unit.
    pub const SOCKETS: &str = "sockets";
    /// Virtual CPUs covered per entitlement unit (informational).
    pub const VCPU: &str = "vcpu";
    /// Stack group key; pools sharing it combine toward one requirement.
    pub const STACKING_ID: &str = "stacking_id";
    /// Bonus-pool multiplier, or the string `"unlimited"`.
    pub const VIRT_LIMIT: &str = "virt_limit";
    /// Whether a consumer may hold more than one entitlement from the
    /// product's stack (`"yes"`/`"true"`).
    pub const MULTI_ENTITLEMENT: &str = "multi-entitlement";
    /// Pool is only entitlable by a hypervisor, for guest benefit.
    pub const HOST_LIMITED: &str = "host_limited";
    /// Quantity granularity for physical consumers.
    pub const INSTANCE_MULTIPLIER: &str = "instance_multiplier";
}

/// Sentinel attribute value marking an unlimited virtualization limit.
pub const UNLIMITED_SENTINEL: &str = "unlimited";

/// A virtualization limit parsed from the `virt_limit` attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VirtLimit {
    /// Each source entitlement unit grants this many bonus units.
    Finite(u32),
    /// Bonus capacity is unlimited.
    Unlimited,
}

/// Inclusive validity window for subscriptions and pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidityWindow {
    /// Start of the window.
    pub starts_at: DateTime<Utc>,
    /// End of the window.
    pub ends_at: DateTime<Utc>,
}

impl ValidityWindow {
    /// Creates a window spanning `starts_at..=ends_at`.
    #[must_use]
    pub const fn new(starts_at: DateTime<Utc>, ends_at: DateTime<Utc>) -> Self {
        Self { starts_at, ends_at }
    }

    /// Returns `true` if `at` falls inside the window.
    #[must_use]
    pub fn is_active_at(&self, at: DateTime<Utc>) -> bool {
        self.starts_at <= at && at <= self.ends_at
    }

    /// Returns the window spanning both `self` and `other`.
    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        Self {
            starts_at: self.starts_at.min(other.starts_at),
            ends_at: self.ends_at.max(other.ends_at),
        }
    }
}

/// A marketed product with its allocation attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    /// Product identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Raw attribute map as imported.
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    /// Products this one satisfies on behalf of.
    #[serde(default)]
    pub provided: BTreeSet<String>,
}

impl Product {
    /// Creates a product with no attributes and no provided products.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            attributes: BTreeMap::new(),
            provided: BTreeSet::new(),
        }
    }

    /// Sets an attribute, builder style.
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Adds a provided product id, builder style.
    #[must_use]
    pub fn providing(mut self, product_id: impl Into<String>) -> Self {
        self.provided.insert(product_id.into());
        self
    }

    /// Returns `true` if this product satisfies `product_id`, either
    /// directly or through its provided set.
    #[must_use]
    pub fn provides(&self, product_id: &str) -> bool {
        self.id == product_id || self.provided.contains(product_id)
    }

    /// Sockets covered per entitlement unit, if the product is
    /// socket-limited.
    #[must_use]
    pub fn sockets(&self) -> Option<u32> {
        self.parse_positive_u32(attr::SOCKETS)
    }

    /// Virtual CPUs covered per entitlement unit, if declared.
    #[must_use]
    pub fn vcpu(&self) -> Option<u32> {
        self.parse_positive_u32(attr::VCPU)
    }

    /// Stack group key, if any.
    #[must_use]
    pub fn stacking_id(&self) -> Option<&str> {
        self.attributes
            .get(attr::STACKING_ID)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// Parsed virtualization limit, if the product carries one.
    #[must_use]
    pub fn virt_limit(&self) -> Option<VirtLimit> {
        let raw = self.attributes.get(attr::VIRT_LIMIT)?;
        if raw.eq_ignore_ascii_case(UNLIMITED_SENTINEL) {
            return Some(VirtLimit::Unlimited);
        }
        match raw.parse::<u32>() {
            Ok(0) => None,
            Ok(n) => Some(VirtLimit::Finite(n)),
            Err(_) => {
                tracing::warn!(
                    product_id = %self.id,
                    value = %raw,
                    "ignoring unparseable virt_limit attribute"
                );
                None
            },
        }
    }

    /// Whether a consumer may hold more than one entitlement from the
    /// product's stack.
    #[must_use]
    pub fn multi_entitlement(&self) -> bool {
        self.bool_attr(attr::MULTI_ENTITLEMENT)
    }

    /// Whether pools of this product are only entitlable by hypervisors.
    #[must_use]
    pub fn host_limited(&self) -> bool {
        self.bool_attr(attr::HOST_LIMITED)
    }

    /// Quantity granularity for physical consumers; defaults to 1.
    #[must_use]
    pub fn instance_multiplier(&self) -> u32 {
        self.parse_positive_u32(attr::INSTANCE_MULTIPLIER).unwrap_or(1)
    }

    fn bool_attr(&self, key: &str) -> bool {
        self.attributes
            .get(key)
            .is_some_and(|v| v.eq_ignore_ascii_case("yes") || v.eq_ignore_ascii_case("true"))
    }

    fn parse_positive_u32(&self, key: &str) -> Option<u32> {
        let raw = self.attributes.get(key)?;
        match raw.parse::<u32>() {
            Ok(0) => None,
            Ok(n) => Some(n),
            Err(_) => {
                tracing::warn!(
                    product_id = %self.id,
                    attribute = key,
                    value = %raw,
                    "ignoring unparseable product attribute"
                );
                None
            },
        }
    }
}

/// A purchased subscription; generates exactly one base pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    /// Subscription identifier.
    pub id: String,
    /// Owning tenant.
    pub owner: String,
    /// Product the subscription is for.
    pub product_id: String,
    /// Purchased quantity.
    pub quantity: u64,
    /// Validity window inherited by the derived pools.
    pub window: ValidityWindow,
}

/// Read-only product lookup shared across allocator components.
///
/// Writes only happen on import events; allocation paths take the read
/// side, so concurrent heals never contend here.
#[derive(Debug, Default)]
pub struct Catalog {
    products: RwLock<HashMap<String, Product>>,
}

impl Catalog {
    /// Creates an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a product record.
    pub fn upsert_product(&self, product: Product) {
        let mut products = self.products.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        products.insert(product.id.clone(), product);
    }

    /// Looks up a product by id.
    #[must_use]
    pub fn product(&self, product_id: &str) -> Option<Product> {
        let products = self.products.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        products.get(product_id).cloned()
    }

    /// Returns `true` if `source_product_id` satisfies `wanted`, either
    /// as the product itself or through its provided set.
    ///
    /// Unknown products satisfy nothing; this is an empty result, not an
    /// error.
    #[must_use]
    pub fn provides(&self, source_product_id: &str, wanted: &str) -> bool {
        let products = self.products.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        products
            .get(source_product_id)
            .is_some_and(|p| p.provides(wanted))
    }
}
